// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging initialization for hosts that don't bring their own subscriber.
//!
//! The tracer logs its operational events (export failures, dropped spans,
//! retention sweeps) through `tracing`; this helper wires up a formatted
//! subscriber with env-filter support. Entirely optional — embedding
//! applications that already install a subscriber should skip it.

use std::io;

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,

    /// Whether to include file/line information.
    pub include_file_line: bool,

    /// Whether to include target module path.
    pub include_target: bool,

    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,

    /// Whether to use compact log format.
    pub compact: bool,

    /// Custom filter directive (overrides default_level).
    pub filter_directive: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            include_file_line: false,
            include_target: true,
            ansi_colors: true,
            compact: true,
            filter_directive: None,
        }
    }
}

impl LogConfig {
    /// Verbose config for development.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_file_line: true,
            compact: false,
            ..Self::default()
        }
    }

    /// Set the default log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Set a custom filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }
}

/// Guard returned by [`init_logging`]; keep it alive for the program's
/// lifetime.
pub struct LoggingGuard {
    _private: (),
}

/// Initialize the global tracing subscriber.
///
/// Call once at application startup. RUST_LOG takes precedence over the
/// configured default level.
pub fn init_logging(config: &LogConfig) -> io::Result<LoggingGuard> {
    let filter = match &config.filter_directive {
        Some(directive) => EnvFilter::try_new(directive)
            .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.default_level))),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.default_level))),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line);

    if config.compact {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.compact())
            .try_init()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    }

    Ok(LoggingGuard { _private: () })
}
