use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{relative_node_path, AppConfig};
use crate::errors::OxvisorError;
use crate::pidfile::{ControlAction, ControlRecord, Pidfile};
use crate::service::Service;
use crate::storage::{load_status, save_status, StatusSnapshot};
use crate::supervisor::{Node, Tally};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What the loop should do after a control poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    WakeUp,
    Quit { stop_children: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Stopping,
}

pub struct MainLoop {
    root: Node,
    pidfile: Option<Pidfile>,
    store: Option<PathBuf>,
    interval: Duration,
    stop_requested: Arc<AtomicBool>,
    phase: Phase,
}

impl MainLoop {
    pub fn new(root: Node, config: &AppConfig) -> Result<Self> {
        let mut main_loop = Self {
            root,
            pidfile: config.pidfile.clone().map(Pidfile::new),
            store: config.store.clone(),
            interval: config.interval,
            stop_requested: Arc::new(AtomicBool::new(false)),
            phase: Phase::Starting,
        };
        main_loop.load_status()?;
        Ok(main_loop)
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn load_status(&mut self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = load_status(store)?;
        let id = self.root.get_id();
        self.root.load_status(snapshot.get(&id));
        debug!("status loaded from {}", store.display());
        Ok(())
    }

    /// Writes the status snapshot; a write failure is fatal.
    pub fn save_status(&self) -> Result<()> {
        let Some(store) = &self.store else {
            debug!("status file not specified");
            return Ok(());
        };
        let mut snapshot = StatusSnapshot::new();
        snapshot.insert(self.root.get_id(), self.root.dump_status());
        save_status(store, &snapshot)
            .with_context(|| format!("error writing status file {}", store.display()))?;
        debug!("status saved to {} ({:?})", store.display(), self.phase);
        Ok(())
    }

    /// Claims the pidfile for this process; fails if it already exists.
    pub fn claim_pidfile(&self) -> Result<()> {
        if let Some(pidfile) = &self.pidfile {
            pidfile.write(
                &ControlRecord {
                    pid: std::process::id(),
                    action: None,
                },
                true,
            )?;
        }
        Ok(())
    }

    pub fn release_pidfile(&self) {
        if let Some(pidfile) = &self.pidfile {
            if let Err(err) = pidfile.remove() {
                warn!("{err}");
            }
        }
    }

    /// Brings the whole tree to its expected state before supervising.
    pub async fn pre_run(&mut self) {
        self.phase = Phase::Starting;
        let result = self.root.start().await;
        if result.is_success() {
            debug!("all elements adjusted");
        } else {
            warn!("initial adjustment incomplete: {result}");
        }
    }

    pub async fn supervise_once(&mut self) -> Tally {
        let mut tally = Tally::default();
        match &mut self.root {
            Node::Supervisor(supervisor) => {
                if !supervisor.supervise(&mut tally).await {
                    error!("supervisor {} failed, its children have been stopped", supervisor.name());
                }
            }
            Node::Service(service) => match service.cond_adjust(true).await {
                Ok(true) => tally.adjusted += 1,
                Ok(false) => tally.ok += 1,
                Err(err) => {
                    error!("{err}");
                    tally.failed += 1;
                }
            },
        }
        debug!(
            "supervised: {} ok, {} adjusted, {} failed",
            tally.ok, tally.adjusted, tally.failed
        );
        tally
    }

    /// Handles at most one pending control action.
    pub async fn poll_control(&mut self) -> Result<LoopControl, OxvisorError> {
        let Some(pidfile) = &self.pidfile else {
            return Ok(LoopControl::Continue);
        };
        let Some(action) = pidfile.check()? else {
            return Ok(LoopControl::Continue);
        };
        pidfile.clear_action()?;
        info!("asked to {action}");

        let control = match action {
            ControlAction::Quit => LoopControl::Quit {
                stop_children: true,
            },
            ControlAction::StopSupervisor => LoopControl::Quit {
                stop_children: false,
            },
            ControlAction::StopChildren => {
                info!("stopping all the children");
                self.stop_tree().await;
                LoopControl::Continue
            }
            ControlAction::WakeUp => LoopControl::WakeUp,
            ControlAction::RestartChild(path) => {
                let resolved = relative_node_path(self.root.name(), &path)
                    .and_then(|segments| self.root.get_child(&segments));
                match resolved {
                    Ok(node) => {
                        let result = node.restart().await;
                        info!("child {path} restarted with {result}");
                    }
                    Err(err) => warn!("cannot restart child {path}: {err}"),
                }
                LoopControl::Continue
            }
            ControlAction::Unknown(raw) => {
                warn!("unknown action: {raw}");
                LoopControl::Continue
            }
        };
        Ok(control)
    }

    /// A pidfile that vanished or changed owner ends the sleep with an error.
    async fn sleep_with_poll(&mut self) -> Result<LoopControl, OxvisorError> {
        debug!("sleeping for {} seconds", self.interval.as_secs());
        let wake_time = Instant::now() + self.interval;
        loop {
            if self.stop_requested() {
                return Ok(LoopControl::Quit {
                    stop_children: true,
                });
            }
            if let Some(pidfile) = &self.pidfile {
                if let Err(err) = pidfile.touch() {
                    warn!("{err}");
                }
            }
            match self.poll_control().await? {
                LoopControl::Continue => {}
                control => return Ok(control),
            }

            let now = Instant::now();
            if now >= wake_time {
                return Ok(LoopControl::Continue);
            }
            sleep(POLL_INTERVAL.min(wake_time - now)).await;
        }
    }

    async fn stop_tree(&mut self) {
        let result = self.root.stop().await;
        if !result.is_success() {
            warn!("children did not stop cleanly: {result}");
        }
    }

    /// Starting, then supervise/persist/sleep until asked to quit, then
    /// stopping.
    pub async fn run(&mut self) -> Result<()> {
        self.pre_run().await;
        self.phase = Phase::Running;
        info!("supervisor started");

        let mut stop_children = true;
        while !self.stop_requested() {
            self.supervise_once().await;
            self.save_status()?;
            let control = match self.sleep_with_poll().await {
                Ok(control) => control,
                Err(err) => {
                    error!("control channel lost, leaving the children as they are: {err}");
                    self.phase = Phase::Stopping;
                    self.save_status()?;
                    return Err(err).context("supervisor no longer owns its pidfile");
                }
            };
            match control {
                LoopControl::Quit {
                    stop_children: children,
                } => {
                    stop_children = children;
                    break;
                }
                LoopControl::WakeUp => debug!("woken up early"),
                LoopControl::Continue => {}
            }
        }

        self.phase = Phase::Stopping;
        if stop_children {
            info!("stopping all the children");
            self.stop_tree().await;
        }
        info!("stopping the supervisor");
        self.save_status()
    }

    /// Pre-run adjustment, exactly one supervision cycle, persist.
    pub async fn run_single(&mut self) -> Result<Tally> {
        self.pre_run().await;
        self.phase = Phase::Running;
        let tally = self.supervise_once().await;
        self.save_status()?;
        Ok(tally)
    }
}

/// Flags the loop to stop on SIGINT/SIGTERM; SIGHUP is logged and ignored.
pub fn spawn_signal_listener(stop: Arc<AtomicBool>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt =
            signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interrupt.recv() => {
                        info!("caught SIGINT");
                        stop.store(true, Ordering::SeqCst);
                    }
                    _ = terminate.recv() => {
                        info!("caught SIGTERM");
                        stop.store(true, Ordering::SeqCst);
                    }
                    _ = hangup.recv() => {
                        info!("caught SIGHUP, ignoring it");
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to wait for CTRL-C signal: {err}");
                return;
            }
            info!("caught CTRL-C");
            stop.store(true, Ordering::SeqCst);
        });
    }

    Ok(())
}

/// Runs the supervisor in the foreground until told to quit.
///
/// A root that is a single service is just started once; the return value
/// is its exit code.
pub async fn run_foreground(config: &AppConfig) -> Result<i32> {
    let root = match config.build_tree()? {
        Node::Service(mut service) => return Ok(start_lone_service(&mut service).await),
        root => root,
    };

    let mut main_loop = MainLoop::new(root, config)?;
    main_loop.claim_pidfile()?;
    spawn_signal_listener(main_loop.stop_flag())?;

    let outcome = main_loop.run().await;
    main_loop.release_pidfile();
    outcome.map(|()| 0)
}

pub async fn run_single(config: &AppConfig) -> Result<i32> {
    let root = match config.build_tree()? {
        Node::Service(mut service) => return Ok(start_lone_service(&mut service).await),
        root => root,
    };
    let mut main_loop = MainLoop::new(root, config)?;
    main_loop.claim_pidfile()?;

    let outcome = main_loop.run_single().await;
    main_loop.release_pidfile();
    let tally = outcome?;
    info!(
        "single cycle: {} ok, {} adjusted, {} failed",
        tally.ok, tally.adjusted, tally.failed
    );
    Ok(if tally.failed == 0 { 0 } else { 1 })
}

async fn start_lone_service(service: &mut Service) -> i32 {
    let result = service.start().await;
    info!("{} started with {result}", service.name());
    result.code
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::{LoopControl, MainLoop};
    use crate::config::{AppConfig, EntryConfig, SupervisorConfig};
    use crate::pidfile::{ControlAction, Pidfile};
    use crate::service::tests::ControlFixture;
    use crate::storage::load_status;
    use crate::supervisor::Node;

    fn app_config(fixture: &ControlFixture, names: &[&str]) -> AppConfig {
        let entry = EntryConfig::Supervisor(SupervisorConfig {
            name: Some("root".to_string()),
            children: names
                .iter()
                .map(|name| EntryConfig::Service(fixture.service_config(name)))
                .collect(),
            ..SupervisorConfig::default()
        });
        AppConfig {
            conf: fixture.root.join("oxvisor.toml"),
            pidfile: Some(fixture.root.join("oxvisor.pid")),
            store: Some(fixture.root.join("status.json")),
            interval: Duration::from_secs(1),
            log_level: "info".to_string(),
            entry,
        }
    }

    fn build_loop(config: &AppConfig) -> MainLoop {
        let root = config.build_tree().expect("tree should build");
        MainLoop::new(root, config).expect("main loop should build")
    }

    #[tokio::test]
    async fn single_cycle_adjusts_and_persists() {
        let fixture = ControlFixture::new("loop-single");
        let config = app_config(&fixture, &["a", "b"]);
        let mut main_loop = build_loop(&config);

        let tally = main_loop.run_single().await.expect("single cycle");
        assert_eq!(tally.failed, 0);
        assert!(fixture.is_running("a"));
        assert!(fixture.is_running("b"));

        let snapshot = load_status(&fixture.root.join("status.json")).expect("status");
        assert!(snapshot.contains_key(&main_loop.root().get_id()));

        let reloaded = build_loop(&config);
        let Node::Supervisor(supervisor) = reloaded.root() else {
            panic!("root should be a supervisor");
        };
        assert!(!supervisor.is_new());
        assert_eq!(supervisor.window().len(), 1);
    }

    #[tokio::test]
    async fn stop_children_then_wake_up_executes_only_the_last_action() {
        let fixture = ControlFixture::new("loop-control");
        let config = app_config(&fixture, &["a"]);
        let mut main_loop = build_loop(&config);
        main_loop.claim_pidfile().expect("claim pidfile");
        main_loop.run_single().await.expect("single cycle");
        fixture.clear_actions();

        let pidfile = Pidfile::new(fixture.root.join("oxvisor.pid"));
        pidfile
            .send_action(ControlAction::StopChildren)
            .expect("post stop_children");
        pidfile.send_action(ControlAction::WakeUp).expect("post wake_up");

        assert_eq!(
            main_loop.poll_control().await.expect("poll"),
            LoopControl::WakeUp
        );
        assert!(fixture.actions().is_empty(), "stop_children was overwritten");
        assert_eq!(
            main_loop.poll_control().await.expect("poll"),
            LoopControl::Continue
        );
        assert!(fixture.is_running("a"));
        main_loop.release_pidfile();
    }

    #[tokio::test]
    async fn control_actions_drive_the_tree() {
        let fixture = ControlFixture::new("loop-actions");
        let config = app_config(&fixture, &["a", "b"]);
        let mut main_loop = build_loop(&config);
        main_loop.claim_pidfile().expect("claim pidfile");
        main_loop.run_single().await.expect("single cycle");
        fixture.clear_actions();
        let pidfile = Pidfile::new(fixture.root.join("oxvisor.pid"));

        pidfile
            .send_action(ControlAction::RestartChild("root/b".to_string()))
            .expect("post restart_child");
        assert_eq!(
            main_loop.poll_control().await.expect("poll"),
            LoopControl::Continue
        );
        assert!(fixture.actions().is_empty(), "control restart is one call");
        assert_eq!(pidfile.check().expect("owned"), None, "action cleared");

        pidfile
            .send_action(ControlAction::StopChildren)
            .expect("post stop_children");
        assert_eq!(
            main_loop.poll_control().await.expect("poll"),
            LoopControl::Continue
        );
        assert!(!fixture.is_running("a"));
        assert!(!fixture.is_running("b"));

        pidfile
            .send_action(ControlAction::StopSupervisor)
            .expect("post stop_supervisor");
        assert_eq!(
            main_loop.poll_control().await.expect("poll"),
            LoopControl::Quit {
                stop_children: false
            }
        );
        main_loop.release_pidfile();
        assert!(!fixture.root.join("oxvisor.pid").exists());
    }

    #[tokio::test]
    async fn run_stops_children_when_asked_to_quit() {
        let fixture = ControlFixture::new("loop-run");
        let config = app_config(&fixture, &["a"]);
        let mut main_loop = build_loop(&config);
        main_loop.claim_pidfile().expect("claim pidfile");

        let pid_path: PathBuf = fixture.root.join("oxvisor.pid");
        let stop = main_loop.stop_flag();
        let poster = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let pidfile = Pidfile::new(pid_path);
            if pidfile.send_action(ControlAction::Quit).is_err() {
                stop.store(true, Ordering::SeqCst);
            }
        });

        main_loop.run().await.expect("loop should exit cleanly");
        poster.await.expect("poster task");
        main_loop.release_pidfile();

        assert_eq!(fixture.actions().first().map(String::as_str), Some("start a"));
        assert_eq!(fixture.actions().last().map(String::as_str), Some("stop a"));
        assert!(!fixture.is_running("a"));
        assert!(fs::metadata(fixture.root.join("status.json")).is_ok());
    }

    #[tokio::test]
    async fn run_exits_when_pidfile_changes_owner() {
        let fixture = ControlFixture::new("loop-foreign");
        let config = app_config(&fixture, &["a"]);
        let mut main_loop = build_loop(&config);
        main_loop.claim_pidfile().expect("claim pidfile");

        let pid_path: PathBuf = fixture.root.join("oxvisor.pid");
        let intruder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            fs::write(pid_path, "1\n").expect("overwrite pidfile");
        });

        let outcome = tokio::time::timeout(Duration::from_secs(10), main_loop.run())
            .await
            .expect("loop should not keep running");
        intruder.await.expect("intruder task");

        let err = outcome.expect_err("foreign pidfile is fatal");
        assert!(format!("{err:#}").contains("taken by another pid"), "{err:#}");
        assert!(fixture.is_running("a"), "children are left as they are");
        assert!(fixture.root.join("oxvisor.pid").exists());
    }
}
