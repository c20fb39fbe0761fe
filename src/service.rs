use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::errors::{OxvisorError, ServiceError};
use crate::process_table;
use crate::runner::{run_command, CommandResult};
use crate::storage::ServiceStatus;
use crate::supervisor::CheckReport;

pub const MAXIMUM_LOG: usize = 100;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DAEMON_HELPER: &str = "/usr/bin/oxvisor-loop";

pub const STATUS_RUNNING: i32 = 0;
pub const STATUS_STOPPED: i32 = 3;

const CONFIRM_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expected {
    Running,
    Stopped,
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Expected::Running => "running",
            Expected::Stopped => "stopped",
        };
        write!(f, "{value}")
    }
}

impl FromStr for Expected {
    type Err = OxvisorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(Expected::Running),
            "stopped" => Ok(Expected::Stopped),
            other => Err(OxvisorError::config(format!(
                "expected must be running or stopped, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    Start,
    Stop,
    Status,
    Restart,
}

impl Subcommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Subcommand::Start => "start",
            Subcommand::Stop => "stop",
            Subcommand::Status => "status",
            Subcommand::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub time: f64,
    pub operation: String,
    pub result: CommandResult,
}

#[derive(Debug)]
pub struct Service {
    name: String,
    expected: Expected,
    timeout_secs: u64,
    control: Option<String>,
    start: Option<String>,
    stop: Option<String>,
    status: Option<String>,
    restart: Option<String>,
    path: Option<String>,
    pattern: Option<Regex>,
    log: VecDeque<OperationRecord>,
    is_new: bool,
}

impl Service {
    pub fn new(config: &ServiceConfig, inherited: Option<Expected>) -> Result<Self, OxvisorError> {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err(OxvisorError::config("service name cannot be empty"));
        }
        if let Some(key) = config.extra.keys().find(|key| !key.starts_with("var_")) {
            return Err(OxvisorError::config(format!(
                "an invalid property has been specified for service {name}: {key}"
            )));
        }
        validate_options(config)
            .map_err(|reason| OxvisorError::config(format!("service {name}: {reason}")))?;

        let expected = match config.expected.as_deref() {
            Some(value) => value.parse::<Expected>()?,
            None => inherited.unwrap_or(Expected::Running),
        };
        let timeout_secs = match config.timeout {
            None => DEFAULT_TIMEOUT_SECS,
            Some(value) if value > 0 => value as u64,
            Some(value) => {
                return Err(OxvisorError::config(format!(
                    "timeout value for {name} is not a valid positive integer: {value}"
                )))
            }
        };

        let mut service = Self {
            name,
            expected,
            timeout_secs,
            control: non_empty(&config.control),
            start: non_empty(&config.start),
            stop: non_empty(&config.stop),
            status: non_empty(&config.status),
            restart: non_empty(&config.restart),
            path: non_empty(&config.path),
            pattern: None,
            log: VecDeque::new(),
            is_new: true,
        };

        let daemon = non_empty(&config.daemon);
        if let (None, Some(pidfile), Some(start)) =
            (&service.control, daemon.as_deref(), service.start.clone())
        {
            service.start = Some(format!(
                "{DAEMON_HELPER} -c 1 --pidfile {pidfile} --daemon {start}"
            ));
            service.stop = Some(format!("{DAEMON_HELPER} --pidfile {pidfile} --quit"));
            service.status = Some(format!("{DAEMON_HELPER} --pidfile {pidfile} --status"));
        } else if service.control.is_none() && service.status.is_none() {
            if !process_table::is_supported() {
                return Err(OxvisorError::config(format!(
                    "don't know how to read the process table, you must specify a status command for service {}",
                    service.name
                )));
            }
            let pattern = match non_empty(&config.pattern) {
                Some(pattern) => Regex::new(&pattern).map_err(|err| {
                    OxvisorError::config(format!(
                        "service {} pattern not valid: {err}",
                        service.name
                    ))
                })?,
                None => {
                    let literal = service.get_cmd(Subcommand::Start).join(" ");
                    Regex::new(&regex::escape(&literal)).map_err(|err| {
                        OxvisorError::config(format!(
                            "service {} start command cannot be used as pattern: {err}",
                            service.name
                        ))
                    })?
                }
            };
            debug!("using {} as pattern for service {}", pattern, service.name);
            service.pattern = Some(pattern);
        }

        Ok(service)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expected(&self) -> Expected {
        self.expected
    }

    pub fn is_enabled(&self) -> bool {
        self.expected == Expected::Running
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn log(&self) -> impl Iterator<Item = &OperationRecord> {
        self.log.iter()
    }

    pub fn get_cmd(&self, subcmd: Subcommand) -> Vec<String> {
        let explicit = match subcmd {
            Subcommand::Start => self.start.as_deref(),
            Subcommand::Stop => self.stop.as_deref(),
            Subcommand::Status => self.status.as_deref(),
            Subcommand::Restart => self.restart.as_deref(),
        };
        let mut tokens: Vec<String> = match (self.control.as_deref(), explicit) {
            (_, Some(command)) => command.split_whitespace().map(str::to_string).collect(),
            (Some(control), None) => {
                let mut tokens: Vec<String> =
                    control.split_whitespace().map(str::to_string).collect();
                tokens.push(subcmd.as_str().to_string());
                tokens
            }
            (None, None) => Vec::new(),
        };
        for token in &mut tokens {
            *token = percent_decode_str(token).decode_utf8_lossy().into_owned();
        }
        tokens
    }

    pub fn get_id(&self) -> String {
        let text_id = format!(
            "{}|{}|{}",
            self.name,
            self.expected,
            self.get_cmd(Subcommand::Start).join(" ")
        );
        format!("{:x}", Sha256::digest(text_id.as_bytes()))
    }

    pub async fn start(&mut self) -> CommandResult {
        let result = self.execute(self.get_cmd(Subcommand::Start)).await;
        self.record("start", &result);
        result
    }

    pub async fn stop(&mut self) -> CommandResult {
        let result = if self.control.is_none() && self.stop.is_none() {
            match self.pidof() {
                None => {
                    info!("{} already stopped", self.name);
                    CommandResult::success()
                }
                Some(found) => {
                    let pids: Vec<u32> = found.iter().map(|process| process.pid).collect();
                    process_table::kill_pids(&pids, Duration::from_secs(self.timeout_secs))
                        .await;
                    info!(
                        "{} stopped by killing processes: {}",
                        self.name,
                        pids.iter()
                            .map(u32::to_string)
                            .collect::<Vec<_>>()
                            .join(" ")
                    );
                    CommandResult::success()
                }
            }
        } else {
            self.execute(self.get_cmd(Subcommand::Stop)).await
        };
        self.record("stop", &result);
        result
    }

    /// LSB status: 0 running, 3 stopped, anything else is dirty.
    pub async fn status(&mut self) -> CommandResult {
        let result = if self.control.is_none() && self.status.is_none() {
            if self.pidof().is_some() {
                debug!("{} running", self.name);
                CommandResult::new(STATUS_RUNNING, "", "")
            } else {
                debug!("{} not running", self.name);
                CommandResult::new(STATUS_STOPPED, "", "")
            }
        } else {
            self.execute(self.get_cmd(Subcommand::Status)).await
        };
        self.record("status", &result);
        result
    }

    pub async fn check(&mut self) -> CheckReport {
        let status = self.status().await;
        let (ok, message) = describe_check(&self.name, self.expected, status.code);
        CheckReport::leaf(ok, message)
    }

    pub async fn restart(&mut self) -> CommandResult {
        let use_command = match (&self.control, self.restart.as_deref()) {
            (Some(_), Some("stop+start")) => false,
            (Some(_), _) => true,
            (None, restart) => restart.is_some_and(|restart| restart != "stop+start"),
        };

        if use_command {
            let result = self.execute(self.get_cmd(Subcommand::Restart)).await;
            info!("{} restarted with {result}", self.name);
            self.record("restart", &result);
            result
        } else {
            let stopped = self.stop().await;
            let started = self.start().await;
            let joint = stopped.merge(&started);
            info!("{} stop+start with {joint}", self.name);
            self.record("stop+start", &joint);
            joint
        }
    }

    pub async fn cond_start(&mut self, careful: bool) -> Result<bool, ServiceError> {
        self.is_new = false;
        let status = self.status().await;
        let action = match status.code {
            STATUS_RUNNING => {
                debug!("{} already running", self.name);
                return Ok(false);
            }
            STATUS_STOPPED => {
                let started = self.start().await;
                info!("{} started with {started}", self.name);
                started
            }
            code => {
                let stopped = self.stop().await;
                info!("{} stopped for cleaning (status {code}) with {stopped}", self.name);
                let started = self.start().await;
                info!("{} started with {started}", self.name);
                stopped.merge(&started)
            }
        };

        if careful {
            self.confirm(STATUS_RUNNING, "started", action).await?;
        }
        Ok(true)
    }

    pub async fn cond_stop(&mut self, careful: bool) -> Result<bool, ServiceError> {
        self.is_new = false;
        let status = self.status().await;
        if status.code == STATUS_STOPPED {
            debug!("{} already stopped", self.name);
            return Ok(false);
        }

        let stopped = self.stop().await;
        if status.code == STATUS_RUNNING {
            info!("{} stopped with {stopped}", self.name);
        } else {
            info!(
                "{} stopped for cleaning (status {}) with {stopped}",
                self.name, status.code
            );
        }

        if careful {
            self.confirm(STATUS_STOPPED, "stopped", stopped).await?;
        }
        Ok(true)
    }

    pub async fn cond_adjust(&mut self, careful: bool) -> Result<bool, ServiceError> {
        match self.expected {
            Expected::Running => self.cond_start(careful).await,
            Expected::Stopped => self.cond_stop(careful).await,
        }
    }

    pub fn load_status(&mut self, status: Option<&ServiceStatus>) {
        let Some(status) = status else {
            return;
        };
        self.is_new = false;
        if !status.log.is_empty() {
            self.log = status.log.iter().cloned().collect();
            self.trim_log();
        }
    }

    /// Snapshot for the status store; the operation log stays in memory.
    pub fn dump_status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.name.clone(),
            log: Vec::new(),
        }
    }

    async fn confirm(
        &mut self,
        target: i32,
        action: &'static str,
        triggered: CommandResult,
    ) -> Result<(), ServiceError> {
        if !triggered.is_success() {
            error!("service {} could not be {action}: {triggered}", self.name);
            return Err(self.service_error(action, triggered));
        }

        let deadline = Instant::now() + Duration::from_secs(self.timeout_secs);
        loop {
            let observed = self.status().await;
            if observed.code == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!(
                    "service {} could not be {action} within {}s: {observed}",
                    self.name, self.timeout_secs
                );
                return Err(self.service_error(action, observed));
            }
            sleep(CONFIRM_INTERVAL).await;
        }
    }

    fn service_error(&self, action: &'static str, result: CommandResult) -> ServiceError {
        ServiceError {
            service: self.name.clone(),
            action,
            result,
        }
    }

    async fn execute(&self, cmd: Vec<String>) -> CommandResult {
        let env = self
            .path
            .as_ref()
            .map(|path| HashMap::from([("PATH".to_string(), path.clone())]));
        let rendered = cmd.join(" ");
        debug!("executing {rendered}");

        match run_command(&cmd, Some(self.timeout_secs), env.as_ref()).await {
            Ok(result) => result,
            Err(OxvisorError::ProcessTimedOut { timeout_secs, .. }) => {
                warn!("{rendered} timed out after {timeout_secs} seconds");
                CommandResult::failure("timeout")
            }
            Err(err) => {
                warn!("error running {rendered}: {err}");
                CommandResult::failure(err.to_string())
            }
        }
    }

    fn pidof(&self) -> Option<Vec<process_table::ProcessMatch>> {
        self.pattern.as_ref().and_then(process_table::find)
    }

    fn record(&mut self, operation: &str, result: &CommandResult) {
        self.log.push_back(OperationRecord {
            time: now_epoch_secs(),
            operation: operation.to_string(),
            result: result.clone(),
        });
        self.trim_log();
    }

    fn trim_log(&mut self) {
        while self.log.len() > MAXIMUM_LOG {
            self.log.pop_front();
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {}", self.name)
    }
}

fn validate_options(config: &ServiceConfig) -> Result<(), String> {
    let start = non_empty(&config.start).is_some();
    let control = non_empty(&config.control).is_some();
    let daemon = non_empty(&config.daemon).is_some();
    let pattern = non_empty(&config.pattern).is_some();
    let status = non_empty(&config.status).is_some();
    let stop = non_empty(&config.stop).is_some();

    if !start && !control {
        return Err("one of start or control is required".to_string());
    }
    let exclusive = [
        ("start", start, "control", control),
        ("daemon", daemon, "control", control),
        ("pattern", pattern, "status", status),
        ("pattern", pattern, "stop", stop),
        ("pattern", pattern, "control", control),
    ];
    for (left, left_set, right, right_set) in exclusive {
        if left_set && right_set {
            return Err(format!("{left} and {right} are mutually exclusive"));
        }
    }
    if daemon && !start {
        return Err("daemon requires start".to_string());
    }
    Ok(())
}

fn describe_check(name: &str, expected: Expected, code: i32) -> (bool, String) {
    match (expected, code) {
        (Expected::Running, STATUS_RUNNING) => (true, format!("{name}: OK, running, as expected")),
        (Expected::Running, STATUS_STOPPED) => (
            false,
            format!("{name}: WARNING, not running, not expected"),
        ),
        (Expected::Stopped, STATUS_RUNNING) => (
            false,
            format!("{name}: WARNING, found running, not expected"),
        ),
        (Expected::Stopped, STATUS_STOPPED) => {
            (true, format!("{name}: OK, not running, as expected"))
        }
        (_, code) => (false, format!("{name}: WARNING, in \"dirty\" state: {code}")),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
