use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

/// Process settings, read once from `HEADCOUNT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub seed_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3001,
            data_dir: PathBuf::from("./data"),
            seed_file: None,
            metrics_port: None,
            compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("HEADCOUNT_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "HEADCOUNT_PORT", defaults.port),
            data_dir: lookup("HEADCOUNT_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            seed_file: lookup("HEADCOUNT_SEED_FILE").map(PathBuf::from),
            metrics_port: parse_opt(&lookup, "HEADCOUNT_METRICS_PORT"),
            compact_threshold: parse_or(&lookup, "HEADCOUNT_COMPACT_THRESHOLD", defaults.compact_threshold),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("occupancy.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: Display,
{
    let raw = lookup(key)?;
    raw.trim()
        .parse()
        .map_err(|e| warn!("invalid {key}={raw:?}: {e}, ignoring"))
        .ok()
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T::Err: Display,
{
    parse_opt(lookup, key).unwrap_or(default)
}
