//! Subscriber installation.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event (default; what log shippers expect).
    Json,
    /// Human-readable lines for local runs.
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unknown `LOG_FORMAT` values fall back to JSON.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let filter = lookup("RUST_LOG")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            Some("pretty") | Some("text") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self { filter, format }
    }
}

pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_json_at_info() {
        let settings = LogSettings::from_lookup(|_| None);
        assert_eq!(settings.filter, "info");
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn reads_filter_and_format() {
        let settings = LogSettings::from_lookup(|key| match key {
            "RUST_LOG" => Some("flowbridge_infra=debug".to_string()),
            "LOG_FORMAT" => Some("pretty".to_string()),
            _ => None,
        });
        assert_eq!(settings.filter, "flowbridge_infra=debug");
        assert_eq!(settings.format, LogFormat::Pretty);
    }

    #[test]
    fn init_twice_is_harmless() {
        let settings = LogSettings::from_lookup(|_| None);
        init(&settings);
        init(&settings);
    }
}
