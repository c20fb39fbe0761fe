mod common;
mod control;
mod node;
mod start;
mod status;
mod stop;
mod validate;

use anyhow::Result;

use crate::cli::Commands;
use crate::config::AppConfig;
use crate::pidfile::ControlAction;

/// Runs one CLI command and returns the process exit code.
pub async fn run(command: Commands, config: &AppConfig) -> Result<i32> {
    if let Some(path) = command.node_path() {
        let path = path.to_string();
        return node::run(&command, config, &path).await;
    }
    if config.entry_is_service() && node::is_node_command(&command) {
        return node::run(&command, config, "").await;
    }

    match command {
        Commands::Start { .. } => start::run(config).await,
        Commands::Single => start::run_single(config).await,
        Commands::Stop { .. } => stop::run(config, ControlAction::Quit).await,
        Commands::StopSupervisor => stop::run(config, ControlAction::StopSupervisor).await,
        Commands::StopChildren => control::run(config, ControlAction::StopChildren),
        Commands::WakeUp => control::run(config, ControlAction::WakeUp),
        Commands::RestartChild { path } => control::run(config, ControlAction::RestartChild(path)),
        Commands::Status { .. } => status::run(config),
        Commands::Check { .. } => node::run(&command, config, "").await,
        Commands::Restart { .. } => {
            anyhow::bail!("restart command is accepted only with a path")
        }
        Commands::ConfigurationCheck => validate::run(config),
    }
}
