//! Terminal styling helpers for check trees and one-line command output.

use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use crate::supervisor::CheckReport;

const INDENT: usize = 2;

fn colors_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        if std::env::var_os("NO_COLOR").is_some() {
            return false;
        }

        if std::env::var("TERM")
            .map(|term| term.eq_ignore_ascii_case("dumb"))
            .unwrap_or(false)
        {
            return false;
        }

        io::stdout().is_terminal()
    })
}

fn paint(value: &str, code: &str) -> String {
    if colors_enabled() {
        format!("\x1b[{code}m{value}\x1b[0m")
    } else {
        value.to_string()
    }
}

/// Colours a check message by outcome.
pub fn check_message(report: &CheckReport) -> String {
    if report.ok {
        paint(&report.message, "1;32")
    } else {
        paint(&report.message, "1;33")
    }
}

/// Renders a check report as indented lines, children below their parent.
pub fn render_report(report: &CheckReport) -> Vec<String> {
    report
        .flatten()
        .into_iter()
        .map(|(depth, line)| format!("{}{}", " ".repeat(depth * INDENT), check_message(line)))
        .collect()
}

/// Colours an LSB status code: 0 green, 3 dim, anything else red.
pub fn status_code(code: i32) -> String {
    let value = code.to_string();
    match code {
        0 => paint(&value, "1;32"),
        3 => paint(&value, "2;37"),
        _ => paint(&value, "1;31"),
    }
}
