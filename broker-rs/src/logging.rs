//! Logging setup
//!
//! Every process (listener and child sessions alike) installs one global
//! tracing subscriber. `channels` is an `EnvFilter` directive string; when it
//! is absent `RUST_LOG` is consulted, then the default level.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::errors::{BrokerError, Result};

/// Where and how much to log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Append to this file instead of stderr
    pub file: Option<PathBuf>,
    /// Filter directives, e.g. `broker_core=debug,info`
    pub channels: Option<String>,
    pub verbose: bool,
}

impl LogConfig {
    fn default_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Build the filter for this configuration
    ///
    /// Channels may be separated by commas or whitespace.
    pub fn filter(&self) -> Result<EnvFilter> {
        match &self.channels {
            Some(channels) => {
                let directives = channels.split_whitespace().collect::<Vec<_>>().join(",");
                EnvFilter::try_new(&directives)
                    .map_err(|e| BrokerError::Config(format!("invalid log channels {:?}: {}", channels, e)))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_level()))),
        }
    }
}

/// Install the global subscriber
///
/// # Errors
/// A bad filter is a configuration error. An unopenable log file or a
/// subscriber that is already installed is a logging error.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| BrokerError::Logging(format!("unable to open log file {}: {}", path.display(), e)))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    installed.map_err(|e| BrokerError::Logging(e.to_string()))
}
