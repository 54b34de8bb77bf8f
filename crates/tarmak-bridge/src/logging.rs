use clap::ValueEnum;
use tracing::level_filters::LevelFilter;

use crate::cmd::Command;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub format: LogFormat,
    pub level: LogLevel,
    pub timestamps: bool,
}

impl LogSettings {
    /// Settings for running `command`.
    ///
    /// A connector's stderr is re-logged line by line by the host that
    /// spawned it, which adds its own timestamp.
    pub fn for_command(command: &Command, format: LogFormat, level: LogLevel) -> Self {
        Self {
            format,
            level,
            timestamps: !matches!(command, Command::Connector(_)),
        }
    }
}

/// Logs always go to stderr: the connector's stdout carries the session.
pub fn init_logging(settings: LogSettings) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::from(settings.level))
        .with_ansi(false)
        .with_target(false);

    let _ = match (settings.format, settings.timestamps) {
        (LogFormat::Text, true) => builder.try_init(),
        (LogFormat::Text, false) => builder.without_time().try_init(),
        (LogFormat::Json, true) => builder.json().try_init(),
        (LogFormat::Json, false) => builder.json().without_time().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::cmd::{ConnectorArgs, VersionArgs};

    #[test]
    fn levels_map_to_filters() {
        assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
        assert_eq!(LevelFilter::from(LogLevel::Info), LevelFilter::INFO);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
        assert!(LevelFilter::from(LogLevel::Debug) > LevelFilter::from(LogLevel::Warn));
    }

    #[test]
    fn connector_leaves_timestamps_to_the_host() {
        let connector = Command::Connector(ConnectorArgs {
            socket: PathBuf::from("/tmp/connector.sock"),
        });
        let settings = LogSettings::for_command(&connector, LogFormat::Json, LogLevel::Debug);
        assert!(!settings.timestamps);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.level, LogLevel::Debug);

        let version = Command::Version(VersionArgs { extended: false });
        assert!(LogSettings::for_command(&version, LogFormat::Text, LogLevel::Info).timestamps);
    }
}
