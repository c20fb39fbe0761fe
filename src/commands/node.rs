use anyhow::Result;

use crate::cli::Commands;
use crate::config::{relative_node_path, AppConfig};
use crate::supervisor::Node;
use crate::ui;

use super::common::result_lines;

pub(crate) fn is_node_command(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Start { .. }
            | Commands::Stop { .. }
            | Commands::Status { .. }
            | Commands::Restart { .. }
            | Commands::Check { .. }
    )
}

/// Runs a command against one node of the tree, `path` being relative to the
/// configured root (an empty path is the root itself).
pub(crate) async fn run(command: &Commands, config: &AppConfig, path: &str) -> Result<i32> {
    let mut root = config.build_tree()?;
    let segments = relative_node_path(root.name(), path)?;
    let node = root.get_child(&segments)?;
    let (code, lines) = execute(command, node).await?;
    for line in lines {
        println!("{line}");
    }
    Ok(code)
}

async fn execute(command: &Commands, node: &mut Node) -> Result<(i32, Vec<String>)> {
    let result = match command {
        Commands::Start { .. } => node.start().await,
        Commands::Stop { .. } => node.stop().await,
        Commands::Restart { .. } => node.restart().await,
        Commands::Status { .. } => match node.status().await {
            Some(result) => result,
            None => anyhow::bail!(
                "status command not supported on a supervisor node, use check"
            ),
        },
        Commands::Check { .. } => {
            let report = node.check().await;
            let code = if report.ok { 0 } else { 1 };
            return Ok((code, ui::render_report(&report)));
        }
        other => anyhow::bail!("{other:?} cannot be applied to a single node"),
    };
    Ok((result.code, result_lines(&result)))
}
