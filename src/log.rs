//! Logging from Sluice.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::config::{LogConfig, LogLevel};

//----------- Logger -----------------------------------------------------------

/// The state of the Sluice logger.
pub struct Logger {
    filter: Handle<EnvFilter, Registry>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("filter", &self.filter)
            .finish()
    }
}

impl Logger {
    /// Launch the Sluice logger.
    ///
    /// ## Panics
    ///
    /// Panics if a global [`tracing`] logger has been set already.
    pub fn launch(config: &LogConfig) -> Result<&'static Logger, String> {
        let filter = make_env_filter(config)?;

        // A reload layer is tracing's way of making it possible to change
        // values at runtime. It gives us a handle we can use to update the
        // EnvFilter when the config changes.
        let (filter, filter_handle) = reload::Layer::new(filter);

        match config.target.0.as_str() {
            "stdout" => {
                // We try to determine whether to use colors in a bit more fancy
                // way than tracing does automatically (it only does `NO_COLOR`).
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                    .with_writer(std::io::stdout);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            "stderr" => {
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                    .with_writer(std::io::stderr);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            path => {
                // We never emit colors to files.
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| format!("cannot open log file '{path}': {err}"))?;
                let layer = FmtLayer::new()
                    .with_ansi(false)
                    .with_writer(Arc::new(file));
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
        }

        Ok(Box::leak(Box::new(Logger {
            filter: filter_handle,
        })))
    }

    /// Apply a changed logging configuration.
    ///
    /// Only the filter level can be changed at runtime; the target is fixed
    /// at launch.
    pub fn apply(&self, config: &LogConfig) -> Result<(), String> {
        let filter = make_env_filter(config)?;
        self.filter
            .reload(filter)
            .map_err(|err| format!("cannot update the log filter: {err}"))
    }
}

/// Build the environment filter for a logging configuration.
///
/// `SLUICE_LOG` overrides the configured level, in the usual
/// tracing-subscriber directive syntax.
fn make_env_filter(config: &LogConfig) -> Result<EnvFilter, String> {
    let level = match config.level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };

    EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("SLUICE_LOG")
        .try_from_env()
        .or_else(|_| {
            Ok(EnvFilter::builder()
                .with_default_directive(level.into())
                .parse_lossy(""))
        })
}
