use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::pidfile::ControlAction;

use super::common::require_pidfile;

const EXIT_WAIT: Duration = Duration::from_secs(10);

/// Asks the supervisor to exit and makes sure it is gone.
pub(crate) async fn run(config: &AppConfig, action: ControlAction) -> Result<i32> {
    let pidfile = require_pidfile(config, &action.to_string())?;
    if let Some(record) = pidfile.read()? {
        println!("oxvisor (pid {}) is being told to {action}...", record.pid);
    }

    match pidfile.request_exit(action, EXIT_WAIT).await? {
        Some(pid) => println!("oxvisor (pid {pid}) is not running anymore"),
        None => println!("oxvisor does not seem to be running"),
    }
    Ok(0)
}
