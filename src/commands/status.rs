use anyhow::Result;

use crate::config::AppConfig;
use crate::pidfile::STATUS_MAX_AGE;
use crate::ui;

use super::common::require_pidfile;

/// Prints the supervisor liveness and returns its LSB code.
pub(crate) fn run(config: &AppConfig) -> Result<i32> {
    let pidfile = require_pidfile(config, "status")?;
    let status = pidfile.status(STATUS_MAX_AGE)?;
    println!("{} {}", ui::status_code(status.code), status.message);
    Ok(status.code)
}
