//! Log records as supplied by producers and as owned by the engine.

use crate::error::RecordError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete log record supplied by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Only set when the message describes a timed operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_ms: Option<f64>,
}

impl LogRecord {
    pub fn new(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            level,
            message: message.into(),
            metadata: BTreeMap::new(),
            perf_ms: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_perf_ms(mut self, perf_ms: f64) -> Self {
        self.perf_ms = Some(perf_ms);
        self
    }

    /// Checks the required fields. `level` is always present by construction.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.source.trim().is_empty() {
            return Err(RecordError::MissingField("source"));
        }
        if self.message.is_empty() {
            return Err(RecordError::MissingField("message"));
        }
        Ok(())
    }

    /// Rough heap + inline footprint, used for memory accounting.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.source.len()
            + self.message.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2 * std::mem::size_of::<String>())
                .sum::<usize>()
    }
}

/// 128-bit content hash over `(source, level, message)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Placeholder carried by malformed records, which are never deduplicated.
    pub const UNKNOWN: Fingerprint = Fingerprint(0);

    pub fn compute(record: &LogRecord) -> Result<Self, RecordError> {
        record.validate()?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(record.source.as_bytes());
        hasher.update(&[0]);
        hasher.update(record.level.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(record.message.as_bytes());

        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Ok(Fingerprint(u128::from_be_bytes(bytes)))
    }

    pub fn from_u128(value: u128) -> Self {
        Fingerprint(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("fingerprint must be 16 bytes"))?;
        Ok(Fingerprint(u128::from_be_bytes(bytes)))
    }
}

/// A record after the engine has taken ownership of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: LogRecord,
    pub batch_id: String,
    pub ingest_time: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

impl EnrichedRecord {
    /// Enriches `record`, deriving the fingerprint from its content.
    pub fn new(record: LogRecord, batch_id: impl Into<String>, ingest_time: DateTime<Utc>) -> Self {
        let fingerprint = Fingerprint::compute(&record).unwrap_or(Fingerprint::UNKNOWN);
        Self::with_fingerprint(record, batch_id, ingest_time, fingerprint)
    }

    pub(crate) fn with_fingerprint(
        record: LogRecord,
        batch_id: impl Into<String>,
        ingest_time: DateTime<Utc>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            record,
            batch_id: batch_id.into(),
            ingest_time,
            fingerprint,
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.record.estimated_size()
            + self.batch_id.len()
            + std::mem::size_of::<Self>()
            - std::mem::size_of::<LogRecord>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_timestamp_and_metadata() {
        let a = LogRecord::new("svc-a", LogLevel::Info, "heartbeat");
        let b = LogRecord::new("svc-a", LogLevel::Info, "heartbeat")
            .at(Utc::now() + chrono::Duration::hours(1))
            .with_metadata("pod", "a-1");

        assert_eq!(
            Fingerprint::compute(&a).unwrap(),
            Fingerprint::compute(&b).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_separates_fields() {
        let a = LogRecord::new("ab", LogLevel::Info, "c");
        let b = LogRecord::new("a", LogLevel::Info, "bc");
        let c = LogRecord::new("ab", LogLevel::Warn, "c");

        let fa = Fingerprint::compute(&a).unwrap();
        assert_ne!(fa, Fingerprint::compute(&b).unwrap());
        assert_ne!(fa, Fingerprint::compute(&c).unwrap());
    }

    #[test]
    fn test_malformed_record_fails_fingerprint() {
        let record = LogRecord::new("", LogLevel::Error, "boom");
        assert_eq!(
            Fingerprint::compute(&record),
            Err(RecordError::MissingField("source"))
        );

        let enriched = EnrichedRecord::new(record, "batch", Utc::now());
        assert!(enriched.fingerprint.is_unknown());
    }

    #[test]
    fn test_enriched_record_json_shape() {
        let record = LogRecord::new("svc-a", LogLevel::Warn, "slow query").with_perf_ms(12.5);
        let enriched = EnrichedRecord::new(record, "b-1", Utc::now());

        let value = serde_json::to_value(&enriched).unwrap();
        assert_eq!(value["source"], "svc-a");
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["perf_ms"], 12.5);
        assert_eq!(value["fingerprint"].as_str().unwrap().len(), 32);
        assert!(value.get("metadata").is_none());

        let back: EnrichedRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, enriched);
    }
}
