//! Structured logging configuration using tracing

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

impl From<String> for LogLevel {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

impl From<String> for LogFormat {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
        }
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays free
/// for command output.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let level: Level = config.level.into();

    match config.format {
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .json()
                .with_max_level(level)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from("error"), LogLevel::Error);
        assert_eq!(LogLevel::from("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::from("trace"), LogLevel::Trace);

        // Unknown defaults to Info
        assert_eq!(LogLevel::from("verbose"), LogLevel::Info);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from("json"), LogFormat::Json);
        assert_eq!(LogFormat::from("xml"), LogFormat::Json);
    }

    #[test]
    fn test_log_config_deserializes_from_strings() {
        let config: LogConfig = serde_yaml::from_str("level: debug\nformat: pretty").unwrap();
        assert_eq!(
            config,
            LogConfig {
                level: LogLevel::Debug,
                format: LogFormat::Pretty
            }
        );
        let level: Level = config.level.into();
        assert_eq!(level, Level::DEBUG);
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
    }
}
