//! Log setup for the agent process.
//!
//! stdout carries the transfer protocol, so logs only ever go to a file
//! and/or stderr.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::Result;

/// Full `tracing` filter override, e.g. `GIT_DRS_LOG=git_drs=trace`.
pub const LOG_ENV: &str = "GIT_DRS_LOG";

/// Git's own transfer tracing switch; any positive value turns on debug logs.
pub const TRACE_ENV: &str = "GIT_TRANSFER_TRACE";

/// Install the global subscriber. Calling it again is a no-op.
pub fn init(config: &LogConfig) -> Result<()> {
    let log_env = std::env::var(LOG_ENV).ok();
    let trace_env = std::env::var(TRACE_ENV).ok();
    let directive = filter_directive(&config.level, log_env.as_deref(), trace_env.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer(config)?)
        .with_ansi(false)
        .with_thread_names(true);

    if subscriber.try_init().is_ok() {
        tracing::debug!(directive = %directive, "logging initialized");
    }
    Ok(())
}

/// Whether a `GIT_TRANSFER_TRACE` value asks for tracing.
pub fn trace_enabled(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        Some("true") => true,
        Some(v) => v.parse::<i64>().map_or(false, |n| n > 0),
        None => false,
    }
}

fn filter_directive(level: &str, log_env: Option<&str>, trace_env: Option<&str>) -> String {
    if let Some(directive) = log_env.map(str::trim).filter(|d| !d.is_empty()) {
        return directive.to_string();
    }
    if trace_enabled(trace_env) {
        return "debug".into();
    }
    level.to_string()
}

fn make_writer(config: &LogConfig) -> Result<BoxMakeWriter> {
    let file = match &config.file {
        Some(path) if !path.as_os_str().is_empty() => Some(open_log_file(path)?),
        _ => None,
    };

    Ok(match (file, config.stderr) {
        (Some(file), true) => BoxMakeWriter::new(Mutex::new(file).and(io::stderr)),
        (Some(file), false) => BoxMakeWriter::new(Mutex::new(file)),
        (None, true) => BoxMakeWriter::new(io::stderr),
        (None, false) => BoxMakeWriter::new(io::sink),
    })
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
