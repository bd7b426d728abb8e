//! CLI interface for DataBridge

use crate::command::{once, Command, CommandInfo, ParameterStream};
use crate::commands::looper::{FileLooper, FILE_NAME_PARAMETER, FILE_PARAMETER};
use crate::commands::Group;
use crate::daemon::Daemon;
use crate::execution::execute_once;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::parameters::{ParameterDef, ParameterSet};
use crate::schedule::ScheduleInfo;
use crate::settings::Settings;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// DataBridge - composable data pipelines with scheduled execution
#[derive(Parser, Debug)]
#[command(name = "databridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Composable data pipelines with scheduled, overlap-free execution", long_about = None)]
pub struct Cli {
    /// Settings file (yaml, toml or json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides settings
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json or pretty); overrides settings
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the upcoming fire times of a schedule
    Next {
        /// Schedule as inline YAML or a path to a YAML file
        #[arg(short, long)]
        schedule: String,

        /// Number of fire times to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },

    /// Run a file looper over a directory once and print each step as JSON
    Files {
        directory: PathBuf,

        /// Wildcard filter, `;` separates alternatives
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Run a scheduled file looper in the foreground until interrupted
    Watch {
        directory: PathBuf,

        /// Schedule as inline YAML or a path to a YAML file
        #[arg(short, long)]
        schedule: String,

        #[arg(short, long)]
        filter: Option<String>,

        /// Pipeline name used in logs and metrics
        #[arg(long, default_value = "watch")]
        name: String,
    },
}

impl Cli {
    /// Load settings and apply command-line overrides
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(level) = &self.log_level {
            settings.log.level = LogLevel::from(level.as_str());
        }
        if let Some(format) = &self.log_format {
            settings.log.format = LogFormat::from(format.as_str());
        }
        Ok(settings)
    }

    pub fn init_logging(&self, settings: &Settings) -> anyhow::Result<()> {
        init_logging(&settings.log)
    }

    /// Execute the CLI command
    pub async fn execute(&self, settings: &Settings) -> anyhow::Result<()> {
        match &self.command {
            Commands::Next { schedule, count } => self.show_next(schedule, *count),
            Commands::Files { directory, filter } => {
                self.list_files(directory, filter.as_deref().unwrap_or(&settings.default_filter))
            }
            Commands::Watch {
                directory,
                schedule,
                filter,
                name,
            } => {
                let filter = filter.as_deref().unwrap_or(&settings.default_filter);
                self.watch(settings, directory, schedule, filter, name).await
            }
        }
    }

    fn show_next(&self, schedule: &str, count: usize) -> anyhow::Result<()> {
        let schedule = load_schedule(schedule)?;
        let now = Utc::now();
        let trigger = schedule.compile(now)?;

        println!("{}", schedule);
        for fire in trigger.upcoming(now, count) {
            println!("  {}", fire.to_rfc3339());
        }
        Ok(())
    }

    fn list_files(&self, directory: &Path, filter: &str) -> anyhow::Result<()> {
        let looper = FileLooper::new("files")
            .with_directory(directory.to_string_lossy())
            .with_filter(filter);

        let mut failures = 0;
        for step in execute_once(&looper, ParameterSet::new()) {
            match step {
                Ok(set) => println!("{}", serde_json::to_string(&set)?),
                Err(e) => {
                    error!("Step failed: {}", e);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            anyhow::bail!("{} step(s) failed", failures);
        }
        Ok(())
    }

    async fn watch(
        &self,
        settings: &Settings,
        directory: &Path,
        schedule: &str,
        filter: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        let schedule = load_schedule(schedule)?;
        let root = Group::new(name).with_child(
            FileLooper::new("scan")
                .with_directory(directory.to_string_lossy())
                .with_filter(filter)
                .with_child(ReportFile::new()),
        );

        let daemon = Daemon::new(settings).await?;
        let id = daemon.add_pipeline(name, schedule.clone(), Box::new(root)).await?;
        info!(schedule = %id, "Watching {:?} {}", directory, schedule);

        daemon.run().await?;
        Ok(())
    }
}

/// Parse a schedule from inline YAML, or from a file when `source` names one
pub fn load_schedule(source: &str) -> anyhow::Result<ScheduleInfo> {
    let path = Path::new(source);
    let text = if path.is_file() {
        std::fs::read_to_string(path)?
    } else {
        source.to_string()
    };
    let schedule: ScheduleInfo = serde_yaml::from_str(&text)
        .map_err(|e| anyhow::anyhow!("Cannot parse schedule '{}': {}", source, e))?;
    schedule.validate()?;
    Ok(schedule)
}

/// Leaf that logs each file it is handed
struct ReportFile {
    info: CommandInfo,
}

impl ReportFile {
    fn new() -> Self {
        Self {
            info: CommandInfo::new("report")
                .with_parameter(ParameterDef::input(FILE_PARAMETER))
                .with_parameter(ParameterDef::input(FILE_NAME_PARAMETER)),
        }
    }
}

impl Command for ReportFile {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        let file = match self.info.resolve_str(&input, FILE_PARAMETER) {
            Ok(file) => file,
            Err(e) => return once(Err(e)),
        };
        info!(command = self.name(), file = file.as_str(), "File found");
        once(Ok(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_command() {
        let cli = Cli::parse_from(["databridge", "next", "--schedule", "interval: { minutes: 15 }", "-n", "3"]);
        match cli.command {
            Commands::Next { schedule, count } => {
                assert_eq!(schedule, "interval: { minutes: 15 }");
                assert_eq!(count, 3);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_overrides() {
        let cli = Cli::parse_from(["databridge", "files", "/in", "--log-level", "debug", "--log-format", "pretty"]);
        let settings = cli.settings().unwrap();
        assert_eq!(settings.log.level, LogLevel::Debug);
        assert_eq!(settings.log.format, LogFormat::Pretty);
    }

    #[test]
    fn test_load_schedule_inline_and_file() {
        let inline = load_schedule("cron: { expression: \"0 0 * * * *\" }").unwrap();
        assert_eq!(inline, ScheduleInfo::cron("0 0 * * * *"));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("schedule.yaml");
        std::fs::write(&path, "interval:\n  minutes: 15\n").unwrap();
        let from_file = load_schedule(path.to_str().unwrap()).unwrap();
        assert_eq!(from_file, ScheduleInfo::every_minutes(15));

        assert!(load_schedule("interval: { minutes: 0 }").is_err());
        assert!(load_schedule("hourly: yes").is_err());
    }

    #[test]
    fn test_report_file_requires_file() {
        let report = ReportFile::new();
        let outputs: Vec<_> = execute_once(&report, ParameterSet::new()).collect();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_err());
    }
}
