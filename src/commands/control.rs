use anyhow::Result;

use crate::config::AppConfig;
use crate::pidfile::ControlAction;

use super::common::require_pidfile;

/// Posts `action` for the running supervisor and returns immediately.
pub(crate) fn run(config: &AppConfig, action: ControlAction) -> Result<i32> {
    let pidfile = require_pidfile(config, &action.to_string())?;
    if pidfile.read()?.is_none() {
        println!("oxvisor does not seem to be running");
        return Ok(3);
    }
    let pid = pidfile.send_action(action.clone())?;
    println!("oxvisor (pid {pid}) is being told to {action}...");
    Ok(0)
}
