use std::str::FromStr;
use std::time::Duration;

use compact_str::CompactString;
use thiserror::Error;

use crate::feed::DEFAULT_BASE_URL;
use crate::reconciler::DEFAULT_CAPACITY;

#[derive(Debug, Clone)]
pub struct Config {
    /// Station ids (EVA numbers) to monitor, in display order.
    pub stations: Vec<CompactString>,
    /// Only trains whose path contains this stop are tracked.
    pub end_station: String,
    pub port: u16,
    pub client_id: String,
    pub api_key: String,
    pub base_url: String,
    pub data_dir: String,
    pub debug: bool,
    pub poll_interval: Duration,
    pub trains_per_station: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("No stations configured")]
    NoStations,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let stations: Vec<CompactString> = get("STATIONS", "8000207")
            .split_whitespace()
            .map(CompactString::from)
            .collect();
        if stations.is_empty() {
            return Err(ConfigError::NoStations);
        }

        let poll_secs: u64 = parse("POLL_INTERVAL_SECS", get("POLL_INTERVAL_SECS", "20"))?;
        let trains_per_station: usize = parse(
            "TRAINS_PER_STATION",
            get("TRAINS_PER_STATION", &DEFAULT_CAPACITY.to_string()),
        )?;
        if poll_secs == 0 || trains_per_station == 0 {
            return Err(ConfigError::InvalidValue {
                key: if poll_secs == 0 { "POLL_INTERVAL_SECS" } else { "TRAINS_PER_STATION" },
                value: "0".to_string(),
            });
        }

        Ok(Self {
            stations,
            end_station: get("END_STATION", "Aachen Hbf"),
            port: parse("PORT", get("PORT", "8888"))?,
            client_id: get("DB_CLIENT_ID", "---"),
            api_key: get("DB_API_KEY", "---"),
            base_url: get("TIMETABLE_BASE_URL", DEFAULT_BASE_URL),
            data_dir: get("DATA_DIR", "./data"),
            debug: get("DEBUG", "false").eq_ignore_ascii_case("true"),
            poll_interval: Duration::from_secs(poll_secs),
            trains_per_station,
        })
    }
}

fn parse<T: FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    let parsed = raw.trim().parse();
    parsed.map_err(|_| ConfigError::InvalidValue { key, value: raw })
}
