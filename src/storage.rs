use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::service::OperationRecord;

/// Persisted history of a service; the operation log is not written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<OperationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub name: String,
    pub cycles: Vec<(f64, bool)>,
    #[serde(default)]
    pub children: BTreeMap<String, NodeStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeStatus {
    Supervisor(SupervisorStatus),
    Service(ServiceStatus),
}

/// Status file content, keyed by root node id.
pub type StatusSnapshot = BTreeMap<String, NodeStatus>;

pub fn load_status(path: &Path) -> Result<StatusSnapshot> {
    if !path.exists() {
        return Ok(StatusSnapshot::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read status file {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(StatusSnapshot::new());
    }

    match serde_json::from_str::<StatusSnapshot>(&content) {
        Ok(snapshot) => Ok(snapshot),
        Err(error) => {
            let backup = corrupted_backup_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "failed to move corrupted status file {} -> {}: {rename_err}",
                    path.display(),
                    backup.display()
                );
            } else {
                warn!(
                    "status file {} is corrupted ({error}), moved to {}",
                    path.display(),
                    backup.display()
                );
            }
            Ok(StatusSnapshot::new())
        }
    }
}

pub fn save_status(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_vec_pretty(snapshot)?;
    let tmp_path = tmp_status_path(path);

    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write temporary status {}", tmp_path.display()))?;
    replace_status_file(&tmp_path, path)?;

    Ok(())
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_extension(format!("corrupt-{suffix}.json"))
}

fn tmp_status_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

fn replace_status_file(tmp_path: &Path, path: &Path) -> Result<()> {
    match fs::rename(tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            #[cfg(windows)]
            {
                if path.exists() {
                    fs::remove_file(path).with_context(|| {
                        format!("failed to remove status file {}", path.display())
                    })?;
                    fs::rename(tmp_path, path).with_context(|| {
                        format!("failed to replace status file {}", path.display())
                    })?;
                    return Ok(());
                }
            }

            Err(rename_err)
                .with_context(|| format!("failed to replace status file {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{load_status, save_status, NodeStatus, ServiceStatus, StatusSnapshot, SupervisorStatus};

    fn sample() -> StatusSnapshot {
        let mut children = BTreeMap::new();
        children.insert(
            "svc-id".to_string(),
            NodeStatus::Service(ServiceStatus {
                name: "web".to_string(),
                log: Vec::new(),
            }),
        );
        children.insert(
            "inner-id".to_string(),
            NodeStatus::Supervisor(SupervisorStatus {
                name: "inner".to_string(),
                cycles: vec![(1.5, false)],
                children: BTreeMap::new(),
            }),
        );
        let mut snapshot = StatusSnapshot::new();
        snapshot.insert(
            "root-id".to_string(),
            NodeStatus::Supervisor(SupervisorStatus {
                name: "root".to_string(),
                cycles: vec![(1.0, true), (2.0, false)],
                children,
            }),
        );
        snapshot
    }

    #[test]
    fn save_and_load_keeps_node_kinds() {
        let path = temp_status_file("roundtrip");
        let snapshot = sample();

        save_status(&path, &snapshot).expect("failed to save test status");
        let loaded = load_status(&path).expect("failed to load test status");
        assert_eq!(loaded, snapshot);

        let raw = fs::read_to_string(&path).expect("failed to read status");
        assert!(raw.contains("\"cycles\""));
        assert!(!raw.contains("\"log\""), "service log must not be persisted");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_or_empty_file_means_no_history() {
        let path = temp_status_file("missing");
        assert!(load_status(&path).expect("missing is fine").is_empty());

        fs::write(&path, "  \n").expect("failed to write empty status");
        assert!(load_status(&path).expect("empty is fine").is_empty());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn load_status_recovers_from_corruption() {
        let path = temp_status_file("corrupt");
        fs::write(&path, "{ not valid json ]").expect("failed to write corrupted status file");

        let loaded = load_status(&path).expect("load_status should recover from corruption");
        assert!(loaded.is_empty());
        assert!(!path.exists(), "corrupted file should have been renamed");

        let original_stem = path
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or_default()
            .to_string();

        let backups: Vec<_> = path
            .parent()
            .expect("temp file has no parent")
            .read_dir()
            .expect("failed to read temp parent")
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|candidate| {
                candidate
                    .file_name()
                    .and_then(|value| value.to_str())
                    .map(|name| name.starts_with(&original_stem) && name.contains(".corrupt-"))
                    .unwrap_or(false)
            })
            .collect();

        assert!(!backups.is_empty(), "expected renamed corrupt backup status file");
        for backup in backups {
            let _ = fs::remove_file(backup);
        }
    }

    #[test]
    fn save_status_fails_when_directory_cannot_be_created() {
        let blocker = temp_status_file("blocker");
        fs::write(&blocker, "file").expect("failed to write blocker");

        let result = save_status(&blocker.join("status.json"), &sample());
        assert!(result.is_err());

        let _ = fs::remove_file(blocker);
    }

    fn temp_status_file(prefix: &str) -> std::path::PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("oxvisor-{prefix}-{nonce}.status.json"))
    }
}
