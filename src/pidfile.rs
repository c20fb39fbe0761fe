use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::errors::OxvisorError;
use crate::process_table;

pub const STATUS_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    Quit,
    StopSupervisor,
    StopChildren,
    WakeUp,
    RestartChild(String),
    Unknown(String),
}

impl ControlAction {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let action = match line {
            "quit" => ControlAction::Quit,
            "stop_supervisor" => ControlAction::StopSupervisor,
            "stop_children" => ControlAction::StopChildren,
            "wake_up" => ControlAction::WakeUp,
            other => match other.split_once(char::is_whitespace) {
                Some(("restart_child", path)) if !path.trim().is_empty() => {
                    ControlAction::RestartChild(path.trim().to_string())
                }
                _ => ControlAction::Unknown(other.to_string()),
            },
        };
        Some(action)
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::Quit => write!(f, "quit"),
            ControlAction::StopSupervisor => write!(f, "stop_supervisor"),
            ControlAction::StopChildren => write!(f, "stop_children"),
            ControlAction::WakeUp => write!(f, "wake_up"),
            ControlAction::RestartChild(path) => write!(f, "restart_child {path}"),
            ControlAction::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub pid: u32,
    pub action: Option<ControlAction>,
}

impl ControlRecord {
    fn render(&self) -> String {
        match &self.action {
            Some(action) => format!("{}\n{action}\n", self.pid),
            None => format!("{}\n", self.pid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidStatus {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<Option<ControlRecord>, OxvisorError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.error(format!("cannot read pidfile: {err}"))),
        };
        let mut lines = content.lines();
        let pid = lines
            .next()
            .map(str::trim)
            .and_then(|line| line.parse::<u32>().ok())
            .filter(|pid| *pid > 0)
            .ok_or_else(|| self.error("lost or corrupted pid file"))?;
        let action = lines.next().and_then(ControlAction::parse);
        Ok(Some(ControlRecord { pid, action }))
    }

    pub fn write(&self, record: &ControlRecord, exclusive: bool) -> Result<(), OxvisorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| self.error(format!("cannot create directory: {err}")))?;
            }
        }

        if exclusive {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .map_err(|err| match err.kind() {
                    ErrorKind::AlreadyExists => self.error(
                        "pidfile already exists, another supervisor may be running",
                    ),
                    _ => self.error(format!("cannot open pidfile: {err}")),
                })?;
            return file
                .write_all(record.render().as_bytes())
                .map_err(|err| self.error(format!("cannot write pidfile: {err}")));
        }

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, record.render())
            .map_err(|err| self.error(format!("cannot write {}: {err}", tmp_path.display())))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| self.error(format!("cannot replace pidfile: {err}")))
    }

    pub fn touch(&self) -> Result<(), OxvisorError> {
        File::options()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_modified(SystemTime::now()))
            .map_err(|err| self.error(format!("cannot touch pidfile: {err}")))
    }

    /// Returns the pending action for the current process.
    ///
    /// Fails when the file is gone, corrupted or claimed by another pid.
    pub fn check(&self) -> Result<Option<ControlAction>, OxvisorError> {
        let record = self
            .read()?
            .ok_or_else(|| self.error("lost or corrupted pid file"))?;
        let own = std::process::id();
        if record.pid != own {
            return Err(self.error(format!(
                "pidfile has been taken by another pid: {}",
                record.pid
            )));
        }
        Ok(record.action)
    }

    pub fn clear_action(&self) -> Result<(), OxvisorError> {
        self.write(
            &ControlRecord {
                pid: std::process::id(),
                action: None,
            },
            false,
        )
    }

    pub fn remove(&self) -> Result<bool, OxvisorError> {
        match self.read()? {
            Some(record) if record.pid == std::process::id() => {
                fs::remove_file(&self.path)
                    .map_err(|err| self.error(format!("cannot remove pidfile: {err}")))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn send_action(&self, action: ControlAction) -> Result<u32, OxvisorError> {
        let record = self
            .read()?
            .ok_or_else(|| self.error("does not exist, supervisor not running"))?;
        let pid = record.pid;
        debug!("posting {action} to pid {pid}");
        self.write(
            &ControlRecord {
                pid,
                action: Some(action),
            },
            false,
        )?;
        Ok(pid)
    }

    pub fn status(&self, max_age: Duration) -> Result<PidStatus, OxvisorError> {
        let Some(record) = self.read()? else {
            return Ok(PidStatus {
                code: 3,
                message: "does not seem to be running".to_string(),
            });
        };
        let pid = record.pid;
        if !process_table::process_exists(pid) {
            return Ok(PidStatus {
                code: 3,
                message: format!("pid {pid} does not seem to be running anymore"),
            });
        }
        let modified = match fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => {
                return Ok(PidStatus {
                    code: 3,
                    message: format!("(pid {pid}) does not have its pidfile anymore"),
                })
            }
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            return Ok(PidStatus {
                code: 1,
                message: format!("(pid {pid}) is not running since {}s", age.as_secs()),
            });
        }
        Ok(PidStatus {
            code: 0,
            message: format!("(pid {pid}) was active {}s ago", age.as_secs()),
        })
    }

    pub async fn request_exit(
        &self,
        action: ControlAction,
        wait: Duration,
    ) -> Result<Option<u32>, OxvisorError> {
        let pid = match self.read()? {
            Some(record) => record.pid,
            None => return Ok(None),
        };

        if process_table::process_exists(pid) {
            self.write(
                &ControlRecord {
                    pid,
                    action: Some(action),
                },
                false,
            )?;
            let deadline = tokio::time::Instant::now() + wait;
            while process_table::process_exists(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if process_table::process_exists(pid) {
                warn!("pid {pid} is still running, killing it now");
                process_table::kill_pids(&[pid], Duration::from_secs(5)).await;
                if process_table::process_exists(pid) {
                    return Err(self.error(format!("could not kill {pid}")));
                }
            }
        } else {
            debug!("pid {pid} does not seem to be running anymore");
        }

        if self.path.exists() {
            warn!("removing pid file {}", self.path.display());
            fs::remove_file(&self.path)
                .map_err(|err| self.error(format!("failed to remove pid file: {err}")))?;
        }
        Ok(Some(pid))
    }

    fn error(&self, reason: impl Into<String>) -> OxvisorError {
        OxvisorError::Pidfile {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }
}
