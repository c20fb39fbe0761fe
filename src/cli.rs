use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverrides;

const BUILD_VERSION: &str = env!("OXVISOR_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Supervisor:
    start, single, stop, stop-supervisor, status, check
  Control:
    stop-children, wake-up, restart-child
  Config:
    configuration-check
  Single node (--path root/child):
    start, stop, status, restart, check

Examples
  oxvisor --conf /etc/oxvisor.toml start
  oxvisor check
  oxvisor restart --path root/web/httpd
  oxvisor restart-child root/web
";

#[derive(Debug, Parser)]
#[command(
    name = "oxvisor",
    version = BUILD_VERSION,
    about = "Oxvisor hierarchical process supervisor",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Configuration file.
    #[arg(long, short = 'c', global = true)]
    pub conf: Option<PathBuf>,
    /// Pidfile used as control channel.
    #[arg(long, global = true)]
    pub pidfile: Option<PathBuf>,
    /// JSON file where the status is kept between runs.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    /// Seconds between supervision cycles.
    #[arg(long, global = true)]
    pub interval: Option<u64>,
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,
}

impl GlobalArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            conf: self.conf.clone(),
            pidfile: self.pidfile.clone(),
            store: self.store.clone(),
            interval: self.interval,
            log_level: self.log_level.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the supervisor, or start a single node with --path.
    Start {
        #[arg(long)]
        path: Option<String>,
    },
    /// Ask the supervisor to quit, or stop a single node with --path.
    Stop {
        #[arg(long)]
        path: Option<String>,
    },
    /// Supervisor liveness, or the status command of a node with --path.
    Status {
        #[arg(long)]
        path: Option<String>,
    },
    /// Restart a single node.
    Restart {
        #[arg(long)]
        path: Option<String>,
    },
    /// Compare the tree, or one node, against its expected state.
    Check {
        #[arg(long)]
        path: Option<String>,
    },
    /// Adjust the tree, supervise once and exit.
    Single,
    /// Ask the supervisor to quit, leaving the children running.
    StopSupervisor,
    /// Ask the supervisor to stop all the children.
    StopChildren,
    /// Ask the supervisor to start the next cycle now.
    WakeUp,
    /// Ask the supervisor to restart one node.
    RestartChild { path: String },
    /// Validate the configuration and exit.
    ConfigurationCheck,
}

impl Commands {
    /// Node path for the commands that accept `--path`.
    pub fn node_path(&self) -> Option<&str> {
        match self {
            Commands::Start { path }
            | Commands::Stop { path }
            | Commands::Status { path }
            | Commands::Restart { path }
            | Commands::Check { path } => path.as_deref(),
            _ => None,
        }
    }
}
