//! Engine configuration.
//!
//! Settings are layered with the `config` crate, later sources overriding
//! earlier ones:
//! 1. Built-in defaults
//! 2. `config/default.toml` (optional)
//! 3. `config/local.toml` (optional)
//! 4. A user-specified file (optional)
//! 5. Environment variables prefixed with `LOGSTREAM_`, e.g.
//!    `LOGSTREAM_BATCH_SIZE_LIMIT=500`
//!
//! All durations are expressed in milliseconds.

use crate::error::SettingsError;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Share of `max_memory_bytes` at which the memory flush trigger fires.
pub const MEMORY_PRESSURE_RATIO: f64 = 0.8;

/// Which deduplication index backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// Exact hash map, bounded only by the periodic sweep.
    #[default]
    Exact,
    /// Fixed-capacity cache with TTL; bounded by construction.
    Lru,
    /// Time-decaying Bloom filter; fixed memory, tunable false positives.
    Bloom,
}

impl std::str::FromStr for DedupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(DedupStrategy::Exact),
            "lru" => Ok(DedupStrategy::Lru),
            "bloom" => Ok(DedupStrategy::Bloom),
            other => Err(format!("unknown dedup strategy `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Records per batch before the size trigger fires
    pub batch_size_limit: usize,
    /// Maximum age of a batch in ms before the time trigger fires
    pub flush_interval: u64,
    /// Memory budget; the memory trigger fires at 80% of it
    pub max_memory_bytes: usize,
    /// Span in ms during which a repeated fingerprint counts as a duplicate
    pub decay_window: u64,
    /// Period in ms of the dedup eviction sweep
    pub sweep_interval: u64,
    /// Width in ms of the grouping time window
    pub group_window: u64,
    pub ring_buffer_capacity: usize,
    /// gzip level, 1-9
    pub compression_level: u32,
    /// Upper bound in ms on any single sink call
    pub sink_timeout: u64,
    /// Sealed batches that may queue behind the in-flight flush
    pub max_pending_flushes: usize,
    pub dedup_strategy: DedupStrategy,
    /// Entry bound for the `lru` and `bloom` strategies
    pub dedup_capacity: usize,
    pub bloom_false_positive_rate: f64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size_limit: 1000,
            flush_interval: 2000,
            max_memory_bytes: 200 * 1024 * 1024,
            decay_window: 60_000,
            sweep_interval: 60_000,
            group_window: 300_000,
            ring_buffer_capacity: 50_000,
            compression_level: 6,
            sink_timeout: 5_000,
            max_pending_flushes: 4,
            dedup_strategy: DedupStrategy::Exact,
            dedup_capacity: 100_000,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl StreamSettings {
    /// Loads settings from `config/` and the environment.
    pub fn new() -> Result<Self, SettingsError> {
        Self::load(None)
    }

    /// Loads settings, layering an optional user file above the `config/`
    /// directory and below the environment.
    pub fn load(user_file: Option<&Path>) -> Result<Self, SettingsError> {
        let config_dir = Path::new("config");

        let mut builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false));

        if let Some(path) = user_file {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }

        let settings: StreamSettings = builder
            .add_source(Environment::with_prefix("LOGSTREAM").try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        fn invalid(field: &'static str, reason: &str) -> SettingsError {
            SettingsError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.batch_size_limit == 0 {
            return Err(invalid("batch_size_limit", "must be greater than zero"));
        }
        if self.flush_interval == 0 {
            return Err(invalid("flush_interval", "must be greater than zero"));
        }
        if self.max_memory_bytes == 0 {
            return Err(invalid("max_memory_bytes", "must be greater than zero"));
        }
        if self.sweep_interval == 0 {
            return Err(invalid("sweep_interval", "must be greater than zero"));
        }
        if self.group_window == 0 {
            return Err(invalid("group_window", "must be greater than zero"));
        }
        if self.ring_buffer_capacity == 0 {
            return Err(invalid("ring_buffer_capacity", "must be greater than zero"));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(invalid("compression_level", "must be between 1 and 9"));
        }
        if self.max_pending_flushes == 0 {
            return Err(invalid("max_pending_flushes", "must be greater than zero"));
        }
        if self.dedup_strategy != DedupStrategy::Exact && self.dedup_capacity == 0 {
            return Err(invalid("dedup_capacity", "must be greater than zero"));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(invalid(
                "bloom_false_positive_rate",
                "must be strictly between 0 and 1",
            ));
        }
        Ok(())
    }

    pub fn flush_interval_duration(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }

    pub fn decay_window_duration(&self) -> Duration {
        Duration::from_millis(self.decay_window)
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_millis(self.sweep_interval)
    }

    pub fn group_window_duration(&self) -> Duration {
        Duration::from_millis(self.group_window)
    }

    pub fn sink_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.sink_timeout)
    }

    /// Estimated memory at which the memory trigger fires.
    pub fn memory_threshold_bytes(&self) -> usize {
        (self.max_memory_bytes as f64 * MEMORY_PRESSURE_RATIO) as usize
    }

    /// Tick period of the flush timer; a tenth of the flush interval.
    pub fn flush_tick(&self) -> Duration {
        (self.flush_interval_duration() / 10)
            .clamp(Duration::from_millis(5), Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn setup() {
        INIT.call_once(|| {
            std::env::set_var("LOGSTREAM_BATCH_SIZE_LIMIT", "250");
        });
    }

    #[test]
    fn test_default_settings() {
        let settings = StreamSettings::default();
        assert_eq!(settings.batch_size_limit, 1000);
        assert_eq!(settings.flush_interval, 2000);
        assert_eq!(settings.max_memory_bytes, 200 * 1024 * 1024);
        assert_eq!(settings.group_window, 300_000);
        assert_eq!(settings.dedup_strategy, DedupStrategy::Exact);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_environment_override() {
        setup();
        let settings = StreamSettings::new().unwrap();
        assert_eq!(settings.batch_size_limit, 250);
    }

    #[test]
    fn test_user_file_layer() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "compression_level = 9\ndedup_strategy = \"bloom\"").unwrap();

        let settings = StreamSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.compression_level, 9);
        assert_eq!(settings.dedup_strategy, DedupStrategy::Bloom);
    }

    #[test]
    fn test_rejects_bad_compression_level() {
        let settings = StreamSettings {
            compression_level: 12,
            ..StreamSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("compression_level"));
    }

    #[test]
    fn test_memory_threshold_and_tick() {
        let settings = StreamSettings {
            max_memory_bytes: 1000,
            flush_interval: 100,
            ..StreamSettings::default()
        };
        assert_eq!(settings.memory_threshold_bytes(), 800);
        assert_eq!(settings.flush_tick(), Duration::from_millis(10));
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("LRU".parse::<DedupStrategy>(), Ok(DedupStrategy::Lru));
        assert!("cuckoo".parse::<DedupStrategy>().is_err());
    }
}
