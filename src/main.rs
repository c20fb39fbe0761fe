mod cli;
mod commands;
mod config;
mod daemon;
mod errors;
mod pidfile;
mod process_table;
mod runner;
mod service;
mod storage;
mod strategy;
mod supervisor;
mod ui;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.global.overrides())?;
    init_tracing(&config.log_level);

    let code = commands::run(cli.command, &config).await?;
    Ok(exit_code(code))
}

fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}
