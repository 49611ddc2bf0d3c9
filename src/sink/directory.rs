//! Filesystem sink.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/
//!   <batch_id>/
//!     group-0000.lsg      metadata JSON line, then the payload bytes
//!     group-0001.lsg
//!   degraded.jsonl        one enriched record per line
//! ```
//!
//! A batch is staged in `<batch_id>.partial/` and committed by renaming the
//! directory, so readers see every group of a batch or none of them.

use super::{Sink, WriteReport};
use crate::compressor::{CompressedGroup, GroupMetadata};
use crate::error::SinkError;
use crate::record::EnrichedRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEGRADED_FILE: &str = "degraded.jsonl";
const STAGING_SUFFIX: &str = ".partial";

pub struct DirectorySink {
    root: PathBuf,
    /// Serializes appends to the degraded log.
    degraded: Mutex<()>,
}

impl DirectorySink {
    /// Creates `root` if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            degraded: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_dir(&self, batch_id: &str) -> PathBuf {
        self.root.join(batch_id)
    }

    pub fn degraded_path(&self) -> PathBuf {
        self.root.join(DEGRADED_FILE)
    }

    async fn stage(&self, staging: &Path, groups: &[CompressedGroup]) -> Result<(), SinkError> {
        fs::create_dir_all(staging).await?;
        for (index, group) in groups.iter().enumerate() {
            let mut bytes = serde_json::to_vec(&group.metadata)
                .map_err(|e| SinkError::Rejected(format!("metadata not serializable: {}", e)))?;
            bytes.push(b'\n');
            bytes.extend_from_slice(&group.payload);

            let mut file = fs::File::create(staging.join(group_file_name(index))).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

fn group_file_name(index: usize) -> String {
    format!("group-{:04}.lsg", index)
}

/// Splits a stored group file back into metadata and payload.
pub async fn read_group(path: &Path) -> Result<(GroupMetadata, Vec<u8>), SinkError> {
    let bytes = fs::read(path).await?;
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| SinkError::Rejected(format!("{} has no metadata line", path.display())))?;
    let metadata = serde_json::from_slice(&bytes[..split])
        .map_err(|e| SinkError::Rejected(format!("bad metadata in {}: {}", path.display(), e)))?;
    Ok((metadata, bytes[split + 1..].to_vec()))
}

#[async_trait]
impl Sink for DirectorySink {
    async fn write_batch(&self, groups: Vec<CompressedGroup>) -> Result<WriteReport, SinkError> {
        let batch_id = match groups.first() {
            Some(group) => group.metadata.batch_id.clone(),
            None => return Ok(WriteReport::default()),
        };
        if batch_id.is_empty() || batch_id.contains(['/', '\\']) || batch_id.starts_with('.') {
            return Err(SinkError::Rejected(format!("unusable batch id `{}`", batch_id)));
        }

        let staging = self.root.join(format!("{}{}", batch_id, STAGING_SUFFIX));
        let target = self.batch_dir(&batch_id);

        let committed = match self.stage(&staging, &groups).await {
            Ok(()) => fs::rename(&staging, &target).await.map_err(SinkError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        let report = WriteReport::for_groups(&groups);
        debug!(
            batch_id = %batch_id,
            groups = report.groups_written,
            bytes = report.bytes_written,
            "batch committed to disk"
        );
        Ok(report)
    }

    async fn write_one(&self, record: Arc<EnrichedRecord>) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record.as_ref())
            .map_err(|e| SinkError::Rejected(format!("record not serializable: {}", e)))?;
        line.push(b'\n');

        let _guard = self.degraded.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.degraded_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
