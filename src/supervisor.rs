use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::config::{EntryConfig, SupervisorConfig};
use crate::errors::{OxvisorError, ServiceError};
use crate::runner::CommandResult;
use crate::service::{now_epoch_secs, Expected, Service};
use crate::storage::{NodeStatus, SupervisorStatus};
use crate::strategy::Strategy;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_NAME: &str = "supervisor";
pub const DEFAULT_WINDOW: usize = 12;
pub const DEFAULT_ADJUSTMENTS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub ok: u64,
    pub adjusted: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub ok: bool,
    pub message: String,
    pub children: Vec<CheckReport>,
}

impl CheckReport {
    pub fn leaf(ok: bool, message: impl Into<String>) -> Self {
        Self {
            ok,
            message: message.into(),
            children: Vec::new(),
        }
    }

    pub fn flatten(&self) -> Vec<(usize, &CheckReport)> {
        let mut lines = Vec::new();
        self.collect(0, &mut lines);
        lines
    }

    fn collect<'a>(&'a self, depth: usize, lines: &mut Vec<(usize, &'a CheckReport)>) {
        lines.push((depth, self));
        for child in &self.children {
            child.collect(depth + 1, lines);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureWindow {
    size: usize,
    max_adjustments: usize,
    cycles: VecDeque<(f64, bool)>,
}

impl FailureWindow {
    pub fn new(size: usize, max_adjustments: usize) -> Self {
        Self {
            size: size.max(1),
            max_adjustments,
            cycles: VecDeque::new(),
        }
    }

    pub fn log_adjustment(&mut self, adjusted: bool) {
        self.push((now_epoch_secs(), adjusted));
    }

    pub fn adjustments(&self) -> usize {
        self.cycles.iter().filter(|(_, adjusted)| *adjusted).count()
    }

    /// True once more than `max_adjustments` cycles in the window adjusted.
    pub fn failed(&self) -> bool {
        self.adjustments() > self.max_adjustments
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn cycles(&self) -> Vec<(f64, bool)> {
        self.cycles.iter().copied().collect()
    }

    pub fn restore(&mut self, cycles: &[(f64, bool)]) {
        self.cycles.clear();
        for cycle in cycles {
            self.push(*cycle);
        }
    }

    fn push(&mut self, cycle: (f64, bool)) {
        self.cycles.push_back(cycle);
        while self.cycles.len() > self.size {
            self.cycles.pop_front();
        }
    }
}

#[derive(Debug)]
pub enum Node {
    Service(Service),
    Supervisor(Supervisor),
}

impl Node {
    pub fn from_config(
        config: &EntryConfig,
        inherited: Option<Expected>,
    ) -> Result<Self, OxvisorError> {
        match config {
            EntryConfig::Service(service) => Ok(Node::Service(Service::new(service, inherited)?)),
            EntryConfig::Supervisor(supervisor) => {
                Ok(Node::Supervisor(Supervisor::new(supervisor, inherited)?))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Service(service) => service.name(),
            Node::Supervisor(supervisor) => supervisor.name(),
        }
    }

    pub fn get_id(&self) -> String {
        match self {
            Node::Service(service) => service.get_id(),
            Node::Supervisor(supervisor) => supervisor.get_id(),
        }
    }

    pub fn get_child(&mut self, path: &[String]) -> Result<&mut Node, OxvisorError> {
        let Some((head, rest)) = path.split_first() else {
            return Ok(self);
        };
        match self {
            Node::Supervisor(supervisor) => supervisor.get_child(head)?.get_child(rest),
            Node::Service(service) => Err(OxvisorError::NotFound(format!(
                "{head} (service {} has no children)",
                service.name()
            ))),
        }
    }

    pub async fn check(&mut self) -> CheckReport {
        match self {
            Node::Service(service) => service.check().await,
            Node::Supervisor(supervisor) => supervisor.check().await,
        }
    }

    pub async fn start(&mut self) -> CommandResult {
        match self {
            Node::Service(service) => service.start().await,
            Node::Supervisor(supervisor) => outcome_result(supervisor.start().await),
        }
    }

    pub async fn stop(&mut self) -> CommandResult {
        match self {
            Node::Service(service) => service.stop().await,
            Node::Supervisor(supervisor) => outcome_result(supervisor.stop().await),
        }
    }

    pub async fn restart(&mut self) -> CommandResult {
        match self {
            Node::Service(service) => service.restart().await,
            Node::Supervisor(supervisor) => outcome_result(supervisor.restart().await),
        }
    }

    pub async fn status(&mut self) -> Option<CommandResult> {
        match self {
            Node::Service(service) => Some(service.status().await),
            Node::Supervisor(_) => None,
        }
    }

    pub fn load_status(&mut self, status: Option<&NodeStatus>) {
        match (self, status) {
            (Node::Service(service), Some(NodeStatus::Service(status))) => {
                service.load_status(Some(status))
            }
            (Node::Supervisor(supervisor), Some(NodeStatus::Supervisor(status))) => {
                supervisor.load_status(Some(status))
            }
            (node, Some(_)) => debug!("status for {} has a different node type, ignored", node.name()),
            (_, None) => {}
        }
    }

    pub fn dump_status(&self) -> NodeStatus {
        match self {
            Node::Service(service) => NodeStatus::Service(service.dump_status()),
            Node::Supervisor(supervisor) => NodeStatus::Supervisor(supervisor.dump_status()),
        }
    }
}

#[derive(Debug)]
pub struct Supervisor {
    name: String,
    expected: Option<Expected>,
    strategy: Strategy,
    window: FailureWindow,
    children: Vec<Node>,
    is_new: bool,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig, inherited: Option<Expected>) -> Result<Self, OxvisorError> {
        let name = config
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_NAME)
            .to_string();

        if let Some(key) = config.extra.keys().find(|key| !key.starts_with("var_")) {
            return Err(OxvisorError::config(format!(
                "an invalid property has been specified for supervisor {name}: {key}"
            )));
        }

        let expected = match config.expected.as_deref().map(str::trim) {
            None => inherited,
            Some(value) if value.eq_ignore_ascii_case("none") => None,
            Some(value) => Some(value.parse::<Expected>()?),
        };
        let strategy = match config.strategy.as_deref() {
            Some(value) => value.parse::<Strategy>()?,
            None => Strategy::default(),
        };
        let window = positive_option(&name, "window", config.window, DEFAULT_WINDOW)?;
        let adjustments = match config.adjustments {
            None => DEFAULT_ADJUSTMENTS,
            Some(value) if value >= 0 => value as usize,
            Some(value) => {
                return Err(OxvisorError::config(format!(
                    "supervisor {name}: adjustments must not be negative, got {value}"
                )))
            }
        };

        if config.children.is_empty() {
            return Err(OxvisorError::config(format!(
                "supervisor {name} has no children"
            )));
        }
        let mut children = Vec::with_capacity(config.children.len());
        let mut names = HashSet::new();
        for entry in &config.children {
            let child = Node::from_config(entry, expected)?;
            if !names.insert(child.name().to_string()) {
                return Err(OxvisorError::config(format!(
                    "supervisor {name} has more than one child named {}",
                    child.name()
                )));
            }
            children.push(child);
        }

        Ok(Self {
            name,
            expected,
            strategy,
            window: FailureWindow::new(window, adjustments),
            children,
            is_new: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> &FailureWindow {
        &self.window
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_enabled(&self) -> bool {
        self.expected != Some(Expected::Stopped)
    }

    pub fn get_id(&self) -> String {
        format!("{:x}", Sha256::digest(self.name.as_bytes()))
    }

    pub fn get_child(&mut self, name: &str) -> Result<&mut Node, OxvisorError> {
        let owner = self.name.clone();
        self.children
            .iter_mut()
            .find(|child| child.name() == name)
            .ok_or_else(|| OxvisorError::NotFound(format!("{name} in supervisor {owner}")))
    }

    pub fn child_by_id(&self, id: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.get_id() == id)
    }

    pub fn start(&mut self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move {
            debug!("starting supervisor {} ({})", self.name, self.strategy);
            self.strategy.start(&mut self.children).await
        })
    }

    pub fn stop(&mut self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move {
            debug!("stopping supervisor {} ({})", self.name, self.strategy);
            self.strategy.stop(&mut self.children).await
        })
    }

    pub fn restart(&mut self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move {
            info!("restarting supervisor {}", self.name);
            self.stop().await?;
            self.start().await
        })
    }

    pub fn supervise<'a>(&'a mut self, tally: &'a mut Tally) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let successful = self
                .strategy
                .supervise(&mut self.children, &mut self.window, tally)
                .await;
            if !successful && self.window.failed() {
                error!(
                    "supervisor {} failed: {} adjustments in the last {} cycles, stopping its children",
                    self.name,
                    self.window.adjustments(),
                    self.window.len()
                );
                if let Err(err) = self.stop().await {
                    error!("supervisor {} could not stop its children: {err}", self.name);
                }
                return false;
            }
            true
        })
    }

    pub fn check(&mut self) -> BoxFuture<'_, CheckReport> {
        Box::pin(async move {
            let mut healthy = true;
            let mut children = Vec::with_capacity(self.children.len());
            for child in &mut self.children {
                let report = child.check().await;
                debug!("check of {}: {}", child.name(), report.message);
                healthy = healthy && report.ok;
                children.push(report);
            }
            let message = if healthy {
                format!("{}: OK, as expected", self.name)
            } else {
                format!("{}: WARNING, not expected", self.name)
            };
            CheckReport {
                ok: healthy,
                message,
                children,
            }
        })
    }

    pub fn load_status(&mut self, status: Option<&SupervisorStatus>) {
        let Some(status) = status else {
            return;
        };
        self.is_new = false;
        self.window.restore(&status.cycles);
        for child in &mut self.children {
            let id = child.get_id();
            match status.children.get(&id) {
                Some(child_status) => child.load_status(Some(child_status)),
                None => debug!("no saved status for {}, treated as new", child.name()),
            }
        }
    }

    pub fn dump_status(&self) -> SupervisorStatus {
        let children: BTreeMap<String, NodeStatus> = self
            .children
            .iter()
            .map(|child| (child.get_id(), child.dump_status()))
            .collect();
        SupervisorStatus {
            name: self.name.clone(),
            cycles: self.window.cycles(),
            children,
        }
    }
}

fn outcome_result(outcome: Result<(), ServiceError>) -> CommandResult {
    match outcome {
        Ok(()) => CommandResult::success(),
        Err(err) => err.result,
    }
}

fn positive_option(
    name: &str,
    key: &str,
    value: Option<i64>,
    default: usize,
) -> Result<usize, OxvisorError> {
    match value {
        None => Ok(default),
        Some(value) if value > 0 => Ok(value as usize),
        Some(value) => Err(OxvisorError::config(format!(
            "supervisor {name}: {key} must be a positive integer, got {value}"
        ))),
    }
}
