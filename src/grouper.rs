//! Compression-locality grouping.
//!
//! Records from one source inside one coarse time window tend to share
//! fields and phrasing. Grouping carries no correctness requirement; a
//! single group per batch would be valid, just compress worse.

use crate::record::EnrichedRecord;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub source: String,
    /// `floor(timestamp_ms / window_ms)`
    pub window_index: i64,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub key: GroupKey,
    pub window_start: DateTime<Utc>,
    /// Arrival order is preserved.
    pub records: Vec<Arc<EnrichedRecord>>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Partitions `records` by `(source, floor(timestamp / window))`.
///
/// Groups come out in order of first appearance.
pub fn group(records: &[Arc<EnrichedRecord>], window: Duration) -> Vec<Group> {
    let window_ms = (window.as_millis() as i64).max(1);
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();

    for record in records {
        let window_index = record
            .record
            .timestamp
            .timestamp_millis()
            .div_euclid(window_ms);
        let key = GroupKey {
            source: record.record.source.clone(),
            window_index,
        };

        match index.get(&key) {
            Some(&slot) => groups[slot].records.push(Arc::clone(record)),
            None => {
                let window_start = Utc
                    .timestamp_millis_opt(window_index.saturating_mul(window_ms))
                    .single()
                    .unwrap_or(record.record.timestamp);
                index.insert(key.clone(), groups.len());
                groups.push(Group {
                    key,
                    window_start,
                    records: vec![Arc::clone(record)],
                });
            }
        }
    }

    groups
}
