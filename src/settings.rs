//! Layered settings: built-in defaults, an optional file, then
//! `DATABRIDGE_` environment variables
//!
//! Nested keys use a double underscore in the environment, e.g.
//! `DATABRIDGE_LOG__LEVEL=debug` or `DATABRIDGE_METRICS_PORT=9090`.

use crate::error::Result;
use crate::logging::LogConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_PREFIX: &str = "DATABRIDGE";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    /// Port for the `/metrics` listener; no listener when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// PID file written while the daemon runs
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Default filter for file loopers started from the command line
    pub default_filter: String,
}

impl Settings {
    /// Load settings; `path` must exist when given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("log.level", "info")?
            .set_default("log.format", "json")?
            .set_default("default_filter", "*")?;

        if let Some(path) = path {
            debug!("Loading settings from {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            metrics_port: None,
            pid_file: None,
            default_filter: "*".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::logging::{LogFormat, LogLevel};
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.default_filter, "*");
        assert!(settings.pid_file.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "log:\n  level: debug\n  format: pretty\nmetrics_port: 9184\ndefault_filter: \"*.csv\""
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.log.level, LogLevel::Debug);
        assert_eq!(settings.log.format, LogFormat::Pretty);
        assert_eq!(settings.metrics_port, Some(9184));
        assert_eq!(settings.default_filter, "*.csv");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/databridge.yaml")));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
