use anyhow::Result;

use crate::config::AppConfig;
use crate::pidfile::Pidfile;
use crate::runner::CommandResult;

pub(crate) fn require_pidfile(config: &AppConfig, command: &str) -> Result<Pidfile> {
    match config.pidfile.as_ref() {
        Some(path) => Ok(Pidfile::new(path)),
        None => anyhow::bail!("{command} requires a pidfile"),
    }
}

/// Non-empty output lines of a command, as printed by node commands.
pub(crate) fn result_lines(result: &CommandResult) -> Vec<String> {
    let mut lines = Vec::new();
    if !result.stdout.trim().is_empty() {
        lines.push(format!("stdout: {}", result.stdout.trim()));
    }
    if !result.stderr.trim().is_empty() {
        lines.push(format!("stderr: {}", result.stderr.trim()));
    }
    lines
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{require_pidfile, result_lines};
    use crate::config::{AppConfig, EntryConfig, ServiceConfig};
    use crate::runner::CommandResult;

    #[test]
    fn result_lines_skip_empty_streams() {
        let result = CommandResult::new(0, "  started web\n", "");
        assert_eq!(result_lines(&result), vec!["stdout: started web"]);

        let result = CommandResult::new(1, "", "timeout");
        assert_eq!(result_lines(&result), vec!["stderr: timeout"]);
        assert!(result_lines(&CommandResult::success()).is_empty());
    }

    #[test]
    fn require_pidfile_reports_missing_setting() {
        let config = AppConfig {
            conf: "/etc/oxvisor.toml".into(),
            pidfile: None,
            store: None,
            interval: Duration::from_secs(60),
            log_level: "info".to_string(),
            entry: EntryConfig::Service(ServiceConfig::default()),
        };
        let err = require_pidfile(&config, "status").expect_err("no pidfile configured");
        assert_eq!(err.to_string(), "status requires a pidfile");
    }
}
