//! Subscriber setup for the `keystone` binary
//!
//! Events go to stderr so command output on stdout stays machine-readable;
//! `serve` in particular owns stdout for the pipe protocol.

use clap::ValueEnum;
use std::io::IsTerminal;
use termcolor::ColorChoice;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding filter directives
pub const LOG_ENV: &str = "KEYSTONE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Builder for the global subscriber
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: Option<LogLevel>,
    format: LogFormat,
    ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Compact,
            ansi: std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal(),
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed level; without one `KEYSTONE_LOG` decides, then `warn`
    pub fn level(mut self, level: Option<LogLevel>) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Escape codes follow `--color`; `auto` keeps terminal detection
    pub fn color(mut self, choice: ColorChoice) -> Self {
        match choice {
            ColorChoice::Always | ColorChoice::AlwaysAnsi => self.ansi = true,
            ColorChoice::Never => self.ansi = false,
            ColorChoice::Auto => {}
        }
        self
    }

    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.directive()),
            None => EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| EnvFilter::new(LogLevel::Warn.directive())),
        }
    }

    /// Install as the global default; a second call is a no-op
    pub fn init(self) {
        let builder = fmt::fmt()
            .with_env_filter(self.filter())
            .with_writer(std::io::stderr)
            .with_ansi(self.ansi)
            .with_target(true);
        let _ = match self.format {
            LogFormat::Pretty => builder.pretty().try_init(),
            LogFormat::Compact => builder.compact().try_init(),
            LogFormat::Json => builder.json().with_ansi(false).try_init(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_wins() {
        let config = LogConfig::new().level(Some(LogLevel::Debug));
        assert_eq!(config.filter().to_string(), "debug");
    }

    #[test]
    fn test_color_choice_controls_escapes() {
        assert!(LogConfig::new().color(ColorChoice::Always).ansi);
        assert!(!LogConfig::new().color(ColorChoice::Never).ansi);
    }

    #[test]
    fn test_levels_order_by_verbosity() {
        assert!(LogLevel::Trace > LogLevel::Warn);
        assert_eq!(LogLevel::Error.directive(), "error");
    }
}
