use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Knobs for the engine's transaction layer.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Longest a transaction waits for an overlapping range lease.
    pub lock_wait: Duration,
    /// First retry delay; doubles per attempt.
    pub retry_backoff: Duration,
    /// Automatic retries for transient storage failures.
    pub max_retries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(2000),
            retry_backoff: Duration::from_millis(50),
            max_retries: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub seed_file: Option<PathBuf>,
    pub engine: EngineOptions,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineOptions::default();
        let engine = EngineOptions {
            lock_wait: parse(&lookup, "STAYLEDGER_LOCK_WAIT_MS")?
                .map_or(defaults.lock_wait, Duration::from_millis),
            retry_backoff: parse(&lookup, "STAYLEDGER_RETRY_BACKOFF_MS")?
                .map_or(defaults.retry_backoff, Duration::from_millis),
            max_retries: parse(&lookup, "STAYLEDGER_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
        };
        Ok(Self {
            data_dir: lookup("STAYLEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: parse(&lookup, "STAYLEDGER_METRICS_PORT")?,
            compact_threshold: parse(&lookup, "STAYLEDGER_COMPACT_THRESHOLD")?.unwrap_or(1000),
            sweep_interval: Duration::from_secs(
                parse(&lookup, "STAYLEDGER_SWEEP_INTERVAL_SECS")?.unwrap_or(60),
            ),
            seed_file: lookup("STAYLEDGER_SEED_FILE").map(PathBuf::from),
            engine,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("stayledger.wal")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.engine.lock_wait, Duration::from_secs(2));
        assert_eq!(cfg.engine.max_retries, 1);
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/stayledger.wal"));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config_from(&[
            ("STAYLEDGER_DATA_DIR", "/var/lib/stay"),
            ("STAYLEDGER_LOCK_WAIT_MS", "250"),
            ("STAYLEDGER_RETRY_BACKOFF_MS", " 10 "),
            ("STAYLEDGER_METRICS_PORT", "9100"),
            ("STAYLEDGER_SWEEP_INTERVAL_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/stay"));
        assert_eq!(cfg.engine.lock_wait, Duration::from_millis(250));
        assert_eq!(cfg.engine.retry_backoff, Duration::from_millis(10));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = config_from(&[("STAYLEDGER_METRICS_PORT", "ninety")]).unwrap_err();
        assert!(err.to_string().contains("STAYLEDGER_METRICS_PORT"));
    }
}
