//! Structured logging setup
//!
//! Installs a `tracing` subscriber with:
//! 1. An `EnvFilter` taken from `RUST_LOG` or the configured level
//! 2. A console layer for interactive runs
//! 3. A daily rotating file layer in JSON or line format

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::ripper::config_loader::Logging;

/// Base name of the rotating log file
const LOG_FILE_NAME: &str = "gallery_ripper.log";

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type LoggerResult<T> = Result<T, LoggerError>;

/// Keeps the non-blocking file writer alive; drop it last to flush pending lines
pub struct LogGuard {
    _file_guard: WorkerGuard,
}

/// Build the subscriber and install it as the global default
pub fn init_logging(config: &Logging) -> LoggerResult<LogGuard> {
    let log_dir = Path::new(&config.log_directory);
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let file_layer = match config.log_format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed(),
        _ => fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed(),
    };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %config.log_format,
        log_level = %config.log_level,
        "Logger initialized"
    );

    Ok(LogGuard { _file_guard: guard })
}
