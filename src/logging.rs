//! Log output setup.
//!
//! Logs go to stderr for interactive commands and are appended to a file
//! when one is configured or when the process runs as a registered service,
//! which has no console to write to.

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// File name used when a service run has no configured log file.
const DEFAULT_LOG_FILE: &str = "echo-service.log";

/// Where log output should go.
pub fn log_path(config: &LoggingConfig, as_service: bool) -> Option<PathBuf> {
    config
        .file
        .clone()
        .or_else(|| as_service.then(|| std::env::temp_dir().join(DEFAULT_LOG_FILE)))
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig, as_service: bool) -> Result<(), LoggingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let path = log_path(config, as_service);
    let writer = match &path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| LoggingError::Open(path.clone(), e))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(path.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

/// Logging setup errors
#[derive(Debug)]
pub enum LoggingError {
    Open(PathBuf, std::io::Error),
    Init(String),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::Open(path, e) => {
                write!(f, "Failed to open log file '{}': {}", path.display(), e)
            }
            LoggingError::Init(msg) => write!(f, "Failed to initialize logging: {msg}"),
        }
    }
}

impl std::error::Error for LoggingError {}
