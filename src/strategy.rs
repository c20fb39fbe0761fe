use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::errors::{OxvisorError, ServiceError};
use crate::supervisor::{FailureWindow, Node, Tally};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    OneForOne,
    RestForOne,
    OneForAll,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Strategy::OneForOne => "one_for_one",
            Strategy::RestForOne => "rest_for_one",
            Strategy::OneForAll => "one_for_all",
        };
        write!(f, "{value}")
    }
}

impl FromStr for Strategy {
    type Err = OxvisorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "one_for_one" => Ok(Strategy::OneForOne),
            "rest_for_one" => Ok(Strategy::RestForOne),
            "one_for_all" => Ok(Strategy::OneForAll),
            other => Err(OxvisorError::config(format!("unsupported strategy: {other}"))),
        }
    }
}

impl Strategy {
    fn is_dependent(self) -> bool {
        !matches!(self, Strategy::OneForOne)
    }

    pub async fn start(self, children: &mut [Node]) -> Result<(), ServiceError> {
        if self.is_dependent() {
            for child in children.iter_mut() {
                start_child(child, true).await?;
            }
            return Ok(());
        }

        let mut outcome = Ok(());
        for child in children.iter_mut() {
            if let Err(err) = start_child(child, false).await {
                error!("{err}");
                outcome = Err(err);
            }
        }
        outcome
    }

    pub async fn stop(self, children: &mut [Node]) -> Result<(), ServiceError> {
        if self.is_dependent() {
            for child in children.iter_mut().rev() {
                stop_child(child, true).await?;
            }
            return Ok(());
        }

        let mut outcome = Ok(());
        for child in children.iter_mut() {
            if let Err(err) = stop_child(child, false).await {
                error!("{err}");
                outcome = Err(err);
            }
        }
        outcome
    }

    pub async fn supervise(
        self,
        children: &mut [Node],
        window: &mut FailureWindow,
        tally: &mut Tally,
    ) -> bool {
        match self {
            Strategy::OneForOne => supervise_independent(children, window, tally).await,
            Strategy::RestForOne | Strategy::OneForAll => {
                self.supervise_dependent(children, window, tally).await
            }
        }
    }

    async fn supervise_dependent(
        self,
        children: &mut [Node],
        window: &mut FailureWindow,
        tally: &mut Tally,
    ) -> bool {
        let mut logged = false;
        for index in 0..children.len() {
            let healthy = match &mut children[index] {
                Node::Supervisor(supervisor) => supervisor.supervise(tally).await,
                Node::Service(service) => {
                    let healthy = service.check().await.ok;
                    if healthy {
                        tally.ok += 1;
                    } else {
                        tally.adjusted += 1;
                    }
                    healthy
                }
            };
            if healthy {
                continue;
            }

            let first = match self {
                Strategy::RestForOne => index,
                _ => 0,
            };
            info!(
                "{} needs adjusting, restarting {} of {} children ({})",
                children[index].name(),
                children.len() - first,
                children.len(),
                self
            );
            let outcome = self.adjust(&mut children[first..]).await;
            if !logged {
                logged = true;
                window.log_adjustment(true);
            }
            if let Err(err) = outcome {
                error!("adjustment did not converge: {err}");
                tally.failed += 1;
                return !window.failed();
            }
            if window.failed() {
                return false;
            }
        }

        if !logged {
            window.log_adjustment(false);
        }
        true
    }

    async fn adjust(self, affected: &mut [Node]) -> Result<(), ServiceError> {
        self.stop(affected).await?;
        self.start(affected).await
    }
}

async fn supervise_independent(
    children: &mut [Node],
    window: &mut FailureWindow,
    tally: &mut Tally,
) -> bool {
    let mut adjusted_any = false;
    for child in children.iter_mut() {
        let adjusted = match child {
            Node::Supervisor(supervisor) => {
                if supervisor.supervise(tally).await {
                    false
                } else {
                    info!("restarting failed supervisor {}", supervisor.name());
                    if let Err(err) = supervisor.start().await {
                        error!("supervisor {} could not be restarted: {err}", supervisor.name());
                        tally.failed += 1;
                    }
                    true
                }
            }
            Node::Service(service) => match service.cond_adjust(true).await {
                Ok(true) => {
                    tally.adjusted += 1;
                    true
                }
                Ok(false) => {
                    tally.ok += 1;
                    false
                }
                Err(err) => {
                    error!("{err}");
                    tally.failed += 1;
                    false
                }
            },
        };

        if adjusted && !adjusted_any {
            adjusted_any = true;
            window.log_adjustment(true);
            if window.failed() {
                debug!("failure threshold reached, skipping remaining children");
                return false;
            }
        }
    }

    if !adjusted_any {
        window.log_adjustment(false);
    }
    true
}

async fn start_child(child: &mut Node, careful: bool) -> Result<(), ServiceError> {
    match child {
        Node::Supervisor(supervisor) => supervisor.start().await,
        Node::Service(service) => service.cond_adjust(careful).await.map(|_| ()),
    }
}

async fn stop_child(child: &mut Node, careful: bool) -> Result<(), ServiceError> {
    match child {
        Node::Supervisor(supervisor) => supervisor.stop().await,
        Node::Service(service) => service.cond_stop(careful).await.map(|_| ()),
    }
}
