//! Group serialization with common-field factoring and gzip.
//!
//! Payload layout before compression:
//!
//! ```json
//! { "common": { "source": "svc-a", "batch_id": "...", ... },
//!   "records": [ { "message": "...", "timestamp": "..." }, ... ],
//!   "count": 2 }
//! ```
//!
//! Fingerprints are not stored; they are recomputed from the restored
//! record on decompression.

use crate::error::CompressionError;
use crate::grouper::Group;
use crate::record::{EnrichedRecord, LogRecord};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Factored JSON, gzip-compressed.
    Gzip,
    /// Factored JSON stored as-is because gzip did not make it smaller.
    Identity,
    /// Plain JSON array of full records, used after a compression failure.
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub source: String,
    pub window_start: DateTime<Utc>,
    pub batch_id: String,
    pub record_count: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Fields factored out of every record.
    pub common_fields: Vec<String>,
    pub encoding: PayloadEncoding,
}

#[derive(Debug, Clone)]
pub struct CompressedGroup {
    /// Size of the group as a plain JSON array of enriched records.
    pub original_size: usize,
    pub compressed_size: usize,
    pub payload: Vec<u8>,
    pub metadata: GroupMetadata,
}

impl CompressedGroup {
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.original_size as f64
        }
    }
}

#[derive(Serialize, Deserialize)]
struct GroupPayload {
    common: Map<String, Value>,
    records: Vec<Map<String, Value>>,
    count: usize,
}

/// A record as stored in the payload, minus its fingerprint.
#[derive(Deserialize)]
struct StoredRecord {
    #[serde(flatten)]
    record: LogRecord,
    batch_id: String,
    ingest_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Compressor {
    level: Compression,
}

impl Compressor {
    /// `level` is clamped to gzip's 1-9 range.
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.clamp(1, 9)),
        }
    }

    pub fn compress(&self, group: &Group) -> Result<CompressedGroup, CompressionError> {
        let records: Vec<&EnrichedRecord> = group.records.iter().map(|r| r.as_ref()).collect();
        let original_size = serde_json::to_vec(&records)?.len();

        let mut maps = Vec::with_capacity(records.len());
        for record in &records {
            match serde_json::to_value(record)? {
                Value::Object(mut map) => {
                    map.remove("fingerprint");
                    maps.push(map);
                }
                other => {
                    return Err(CompressionError::Corrupt(format!(
                        "record serialized as {}",
                        other
                    )))
                }
            }
        }

        let common = common_fields(&maps);
        let residuals: Vec<Map<String, Value>> = maps
            .into_iter()
            .map(|mut map| {
                map.retain(|key, _| !common.contains_key(key));
                map
            })
            .collect();
        let common_names: Vec<String> = common.keys().cloned().collect();

        let factored = serde_json::to_vec(&GroupPayload {
            common,
            count: residuals.len(),
            records: residuals,
        })?;

        let mut encoder = GzEncoder::new(Vec::with_capacity(factored.len() / 2), self.level);
        encoder.write_all(&factored)?;
        let gzipped = encoder.finish()?;

        let (payload, encoding) = if gzipped.len() < factored.len() {
            (gzipped, PayloadEncoding::Gzip)
        } else {
            (factored, PayloadEncoding::Identity)
        };

        Ok(CompressedGroup {
            original_size,
            compressed_size: payload.len(),
            payload,
            metadata: metadata(group, common_names, encoding),
        })
    }

    /// Stores the group uncompressed, with no factoring.
    pub fn passthrough(&self, group: &Group) -> Result<CompressedGroup, CompressionError> {
        let records: Vec<&EnrichedRecord> = group.records.iter().map(|r| r.as_ref()).collect();
        let payload = serde_json::to_vec(&records)?;

        Ok(CompressedGroup {
            original_size: payload.len(),
            compressed_size: payload.len(),
            payload,
            metadata: metadata(group, Vec::new(), PayloadEncoding::Passthrough),
        })
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(6)
    }
}

/// Turns a group into the payload handed to the sink.
///
/// `passthrough` is the retry used when `compress` fails.
pub trait GroupEncoder: Send + Sync {
    fn compress(&self, group: &Group) -> Result<CompressedGroup, CompressionError>;

    fn passthrough(&self, group: &Group) -> Result<CompressedGroup, CompressionError>;
}

impl GroupEncoder for Compressor {
    fn compress(&self, group: &Group) -> Result<CompressedGroup, CompressionError> {
        Compressor::compress(self, group)
    }

    fn passthrough(&self, group: &Group) -> Result<CompressedGroup, CompressionError> {
        Compressor::passthrough(self, group)
    }
}

/// Restores the records of any payload produced by [`Compressor`].
pub fn decompress(payload: &[u8]) -> Result<Vec<EnrichedRecord>, CompressionError> {
    if payload.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::with_capacity(payload.len() * 4);
        GzDecoder::new(payload).read_to_end(&mut inflated)?;
        return decode_json(&inflated);
    }
    decode_json(payload)
}

fn decode_json(bytes: &[u8]) -> Result<Vec<EnrichedRecord>, CompressionError> {
    match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'[') => Ok(serde_json::from_slice(bytes)?),
        Some(b'{') => restore(serde_json::from_slice(bytes)?),
        _ => Err(CompressionError::Corrupt("unrecognized payload".to_string())),
    }
}

fn restore(payload: GroupPayload) -> Result<Vec<EnrichedRecord>, CompressionError> {
    if payload.count != payload.records.len() {
        return Err(CompressionError::Corrupt(format!(
            "payload declares {} records but holds {}",
            payload.count,
            payload.records.len()
        )));
    }

    payload
        .records
        .into_iter()
        .map(|residual| -> Result<EnrichedRecord, CompressionError> {
            let mut merged = payload.common.clone();
            merged.extend(residual);
            let stored: StoredRecord = serde_json::from_value(Value::Object(merged))?;
            Ok(EnrichedRecord::new(
                stored.record,
                stored.batch_id,
                stored.ingest_time,
            ))
        })
        .collect()
}

/// Fields present with an identical value in every map.
fn common_fields(maps: &[Map<String, Value>]) -> Map<String, Value> {
    let mut iter = maps.iter();
    let mut common = match iter.next() {
        Some(first) => first.clone(),
        None => return Map::new(),
    };
    for map in iter {
        common.retain(|key, value| map.get(key) == Some(value));
        if common.is_empty() {
            break;
        }
    }
    common
}

fn metadata(group: &Group, common_fields: Vec<String>, encoding: PayloadEncoding) -> GroupMetadata {
    GroupMetadata {
        source: group.key.source.clone(),
        window_start: group.window_start,
        batch_id: group
            .records
            .first()
            .map(|r| r.batch_id.clone())
            .unwrap_or_default(),
        record_count: group.records.len(),
        first_timestamp: group.records.iter().map(|r| r.record.timestamp).min(),
        last_timestamp: group.records.iter().map(|r| r.record.timestamp).max(),
        common_fields,
        encoding,
    }
}
