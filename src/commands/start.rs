use anyhow::Result;

use crate::config::AppConfig;
use crate::daemon;

pub(crate) async fn run(config: &AppConfig) -> Result<i32> {
    daemon::run_foreground(config).await
}

pub(crate) async fn run_single(config: &AppConfig) -> Result<i32> {
    daemon::run_single(config).await
}
