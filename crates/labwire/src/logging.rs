use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Install a stderr subscriber. `RUST_LOG` directives override `level`.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_filter().into())
        .from_env_lossy();
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false);

    let installed = match format {
        LogFormat::Text => fmt.try_init(),
        LogFormat::Json => fmt.json().try_init(),
    };
    if installed.is_err() {
        tracing::trace!("log subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_lowercase() {
        let level: LogLevel = serde_json::from_str(r#""debug""#).expect("level should parse");
        assert_eq!(level, LogLevel::Debug);
        assert_eq!(level.as_filter(), LevelFilter::DEBUG);
        assert!(serde_json::from_str::<LogLevel>(r#""loud""#).is_err());
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logging(LogFormat::Json, LogLevel::Warn);
        init_logging(LogFormat::Text, LogLevel::Trace);
    }
}
