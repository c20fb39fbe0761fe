use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::errors::OxvisorError;
use crate::supervisor::Node;

pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// One service entry of the tree, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub expected: Option<String>,
    pub timeout: Option<i64>,
    pub control: Option<String>,
    pub start: Option<String>,
    pub stop: Option<String>,
    pub status: Option<String>,
    pub restart: Option<String>,
    pub path: Option<String>,
    pub daemon: Option<String>,
    pub pattern: Option<String>,
    /// Keys not listed above; only `var_*` keys are accepted.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SupervisorConfig {
    pub name: Option<String>,
    pub expected: Option<String>,
    pub strategy: Option<String>,
    pub window: Option<i64>,
    pub adjustments: Option<i64>,
    #[serde(default)]
    pub children: Vec<EntryConfig>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryConfig {
    Service(ServiceConfig),
    Supervisor(SupervisorConfig),
}

impl EntryConfig {
    pub fn name(&self) -> &str {
        match self {
            EntryConfig::Service(service) => &service.name,
            EntryConfig::Supervisor(supervisor) => supervisor
                .name
                .as_deref()
                .unwrap_or(crate::supervisor::DEFAULT_NAME),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSection {
    pub interval: Option<u64>,
    pub pidfile: Option<PathBuf>,
    pub store: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub oxvisor: GlobalSection,
    pub entry: EntryConfig,
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse configuration")
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub conf: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub store: Option<PathBuf>,
    pub interval: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub conf: PathBuf,
    pub pidfile: Option<PathBuf>,
    pub store: Option<PathBuf>,
    pub interval: Duration,
    pub log_level: String,
    pub entry: EntryConfig,
}

impl AppConfig {
    /// Resolves settings from flags, `OXVISOR_*` variables, the `[oxvisor]`
    /// table and defaults, in that order.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        let conf = overrides
            .conf
            .clone()
            .or_else(|| env_path("OXVISOR_CONF"))
            .unwrap_or_else(default_conf_path);
        let content = fs::read_to_string(&conf)
            .with_context(|| format!("failed to read configuration {}", conf.display()))?;
        let file = ConfigFile::parse(&content)
            .with_context(|| format!("invalid configuration {}", conf.display()))?;
        Self::resolve(conf, file, overrides)
    }

    fn resolve(conf: PathBuf, file: ConfigFile, overrides: &ConfigOverrides) -> Result<Self> {
        let global = file.oxvisor;
        let pidfile = overrides
            .pidfile
            .clone()
            .or_else(|| env_path("OXVISOR_PIDFILE"))
            .or(global.pidfile);
        let store = overrides
            .store
            .clone()
            .or_else(|| env_path("OXVISOR_STORE"))
            .or(global.store);
        let interval = overrides
            .interval
            .or_else(|| env_u64("OXVISOR_INTERVAL"))
            .or(global.interval)
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval == 0 {
            bail!("interval must be a positive number of seconds");
        }
        let log_level = overrides
            .log_level
            .clone()
            .or_else(|| env_string("OXVISOR_LOG"))
            .or(global.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            conf: absolutize(conf),
            pidfile,
            store,
            interval: Duration::from_secs(interval),
            log_level,
            entry: file.entry,
        })
    }

    pub fn entry_is_service(&self) -> bool {
        matches!(self.entry, EntryConfig::Service(_))
    }

    /// Builds the supervision tree; every configuration error surfaces here.
    pub fn build_tree(&self) -> Result<Node> {
        Node::from_config(&self.entry, None)
            .with_context(|| format!("invalid tree in {}", self.conf.display()))
    }
}

fn default_conf_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(env::temp_dir)
        .join("oxvisor")
        .join("oxvisor.toml")
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|value| value.parse::<u64>().ok())
}

/// Splits a node path such as `root/web/httpd` and strips the root name.
///
/// An empty path designates the root itself.
pub fn relative_node_path(root: &str, path: &str) -> Result<Vec<String>, OxvisorError> {
    let mut segments: Vec<String> = path
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();
    if segments.is_empty() {
        return Ok(segments);
    }
    if segments[0] != root {
        return Err(OxvisorError::NotFound(format!("given path is invalid: {path}")));
    }
    segments.remove(0);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Mutex, OnceLock};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::{
        env_u64, relative_node_path, AppConfig, ConfigFile, ConfigOverrides, EntryConfig,
    };
    use crate::supervisor::Node;

    const TREE: &str = r#"
[oxvisor]
interval = 30
pidfile = "/run/oxvisor.pid"
log_level = "debug"

[entry]
type = "supervisor"
name = "root"
strategy = "rest_for_one"
window = 5
adjustments = 2
var_owner = "ops"

[[entry.children]]
type = "service"
name = "db"
start = "/usr/bin/db --port 5432"
status = "/usr/bin/db-status"
timeout = 10

[[entry.children]]
type = "supervisor"
name = "web"
expected = "stopped"

[[entry.children.children]]
type = "service"
name = "httpd"
control = "/sbin/service httpd"
"#;

    #[test]
    fn parses_nested_tree() {
        let file = ConfigFile::parse(TREE).expect("tree should parse");
        assert_eq!(file.oxvisor.interval, Some(30));

        let EntryConfig::Supervisor(root) = &file.entry else {
            panic!("root should be a supervisor");
        };
        assert_eq!(root.name.as_deref(), Some("root"));
        assert_eq!(root.children.len(), 2);
        assert!(root.extra.contains_key("var_owner"));
        let EntryConfig::Service(db) = &root.children[0] else {
            panic!("first child should be a service");
        };
        assert_eq!(db.timeout, Some(10));
        assert_eq!(root.children[1].name(), "web");

        let node = Node::from_config(&file.entry, None).expect("tree should build");
        let Node::Supervisor(supervisor) = node else {
            panic!("root should build into a supervisor");
        };
        assert_eq!(supervisor.children().len(), 2);
    }

    #[test]
    fn rejects_unknown_entry_type_and_global_keys() {
        let bad_type = "[entry]\ntype = \"cluster\"\nname = \"x\"\n";
        assert!(ConfigFile::parse(bad_type).is_err());

        let bad_global = "[oxvisor]\nport = 1\n[entry]\ntype = \"service\"\nname = \"x\"\nstart = \"/bin/x\"\n";
        assert!(ConfigFile::parse(bad_global).is_err());
    }

    #[test]
    fn unknown_service_key_fails_at_build_time() {
        let content = "[entry]\ntype = \"service\"\nname = \"x\"\nstart = \"/bin/x\"\nstatus = \"/bin/x-status\"\ncolour = \"red\"\n";
        let file = ConfigFile::parse(content).expect("parses");
        let err = Node::from_config(&file.entry, None).expect_err("unknown key");
        assert!(err.to_string().contains("colour"), "{err}");
    }

    #[test]
    fn relative_node_path_strips_root_name() {
        assert_eq!(
            relative_node_path("root", "root/web/httpd").expect("valid"),
            vec!["web", "httpd"]
        );
        assert!(relative_node_path("root", "root").expect("root").is_empty());
        assert!(relative_node_path("root", "").expect("empty").is_empty());
        assert!(relative_node_path("root", "web/httpd").is_err());
    }

    #[test]
    fn env_u64_ignores_invalid_values() {
        let _guard = env_lock().lock().expect("failed to acquire env lock");
        let old = std::env::var("OXVISOR_TEST_ENV_U64").ok();
        std::env::set_var("OXVISOR_TEST_ENV_U64", "not-a-number");

        assert_eq!(env_u64("OXVISOR_TEST_ENV_U64"), None);

        restore_env("OXVISOR_TEST_ENV_U64", old);
    }

    #[test]
    fn app_config_load_applies_precedence() {
        let _guard = env_lock().lock().expect("failed to acquire env lock");
        let base = temp_dir("config-load");
        fs::create_dir_all(&base).expect("failed to create config dir");
        let conf = base.join("oxvisor.toml");
        fs::write(&conf, TREE).expect("failed to write config");

        let old_conf = std::env::var("OXVISOR_CONF").ok();
        let old_interval = std::env::var("OXVISOR_INTERVAL").ok();
        let old_pidfile = std::env::var("OXVISOR_PIDFILE").ok();
        let old_log = std::env::var("OXVISOR_LOG").ok();
        let old_store = std::env::var("OXVISOR_STORE").ok();

        std::env::set_var("OXVISOR_CONF", &conf);
        std::env::set_var("OXVISOR_INTERVAL", "7");
        std::env::remove_var("OXVISOR_PIDFILE");
        std::env::remove_var("OXVISOR_LOG");
        std::env::set_var("OXVISOR_STORE", base.join("env-status.json"));

        let overrides = ConfigOverrides {
            store: Some(base.join("cli-status.json")),
            ..ConfigOverrides::default()
        };
        let config = AppConfig::load(&overrides).expect("expected config load to succeed");
        assert_eq!(config.conf, conf);
        assert_eq!(config.interval, Duration::from_secs(7));
        assert_eq!(config.pidfile, Some(PathBuf::from("/run/oxvisor.pid")));
        assert_eq!(config.store, Some(base.join("cli-status.json")));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.entry.name(), "root");

        std::env::set_var("OXVISOR_INTERVAL", "0");
        let zero = ConfigOverrides {
            interval: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(AppConfig::load(&zero).is_err(), "zero interval must be rejected");

        let _ = fs::remove_dir_all(&base);
        restore_env("OXVISOR_CONF", old_conf);
        restore_env("OXVISOR_INTERVAL", old_interval);
        restore_env("OXVISOR_PIDFILE", old_pidfile);
        restore_env("OXVISOR_LOG", old_log);
        restore_env("OXVISOR_STORE", old_store);
    }

    #[test]
    fn missing_configuration_is_reported() {
        let overrides = ConfigOverrides {
            conf: Some(temp_dir("config-missing").join("absent.toml")),
            ..ConfigOverrides::default()
        };
        let err = AppConfig::load(&overrides).expect_err("missing file");
        assert!(format!("{err:#}").contains("failed to read configuration"));
    }

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn restore_env(key: &str, previous: Option<String>) {
        if let Some(value) = previous {
            std::env::set_var(key, value);
        } else {
            std::env::remove_var(key);
        }
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("oxvisor-{prefix}-{nonce}"))
    }
}
