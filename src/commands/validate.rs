use anyhow::Result;

use crate::config::AppConfig;

/// Builds the whole tree without running anything.
pub(crate) fn run(config: &AppConfig) -> Result<i32> {
    config.build_tree()?;
    println!("Configuration is valid.");
    Ok(0)
}
