//! Checkpoint persistence
//!
//! Each checkpoint is a codec-encoded weight file plus a JSON sidecar with
//! its [`CheckpointMeta`]. Files are named by round so lexical order is
//! round order.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use rlhf_core::{Result, RlhfError};

use crate::codec::{self, WeightSet};
use crate::config::UpdateStrategy;

const WEIGHTS_EXT: &str = "ckpt";
const META_EXT: &str = "json";

/// Metadata persisted alongside a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub path: PathBuf,
    pub round_id: u64,
    pub created_at: DateTime<Utc>,
    pub strategy: UpdateStrategy,
    pub mean_loss: f64,
    pub gradient_norm: f64,
    pub samples_used: usize,
    pub format_version: u32,
}

impl CheckpointMeta {
    /// Metadata for a new checkpoint. `path` is filled in by the store.
    pub fn new(round_id: u64, strategy: UpdateStrategy) -> Self {
        Self {
            path: PathBuf::new(),
            round_id,
            created_at: Utc::now(),
            strategy,
            mean_loss: 0.0,
            gradient_norm: 0.0,
            samples_used: 0,
            format_version: codec::FORMAT_VERSION,
        }
    }
}

/// Storage backend for model checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist weights, returning the location written
    async fn save(&self, weights: &WeightSet, meta: CheckpointMeta) -> Result<PathBuf>;

    /// All checkpoints, oldest round first
    async fn list(&self) -> Result<Vec<CheckpointMeta>>;

    async fn delete(&self, path: &Path) -> Result<()>;

    async fn load(&self, path: &Path) -> Result<WeightSet>;
}

/// Delete the oldest checkpoints so at most `keep` remain.
///
/// Returns how many were deleted.
pub async fn rotate(store: &dyn CheckpointStore, keep: usize) -> Result<usize> {
    let checkpoints = store.list().await?;
    let excess = checkpoints.len().saturating_sub(keep);

    for meta in checkpoints.iter().take(excess) {
        store.delete(&meta.path).await?;
        debug!(round_id = meta.round_id, path = %meta.path.display(), "Rotated out checkpoint");
    }

    Ok(excess)
}

/// Most recent checkpoint, if any
pub async fn latest(store: &dyn CheckpointStore) -> Result<Option<CheckpointMeta>> {
    Ok(store.list().await?.pop())
}

/// Checkpoints stored as files in one directory
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn weights_path(&self, round_id: u64) -> PathBuf {
        self.dir.join(format!("round-{round_id:010}.{WEIGHTS_EXT}"))
    }

    fn checkpoint_error(action: &str, path: &Path, e: impl std::fmt::Display) -> RlhfError {
        RlhfError::Checkpoint(format!("failed to {action} {}: {e}", path.display()))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Self::checkpoint_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Self::checkpoint_error("rename", &tmp, e))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, weights: &WeightSet, mut meta: CheckpointMeta) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::checkpoint_error("create", &self.dir, e))?;

        let path = self.weights_path(meta.round_id);
        meta.path = path.clone();
        meta.format_version = codec::FORMAT_VERSION;

        Self::write_atomic(&path, &codec::encode(weights)).await?;
        let sidecar = serde_json::to_vec_pretty(&meta)?;
        Self::write_atomic(&path.with_extension(META_EXT), &sidecar).await?;

        debug!(
            round_id = meta.round_id,
            path = %path.display(),
            parameters = weights.parameter_count(),
            "Saved checkpoint"
        );
        Ok(path)
    }

    async fn list(&self) -> Result<Vec<CheckpointMeta>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::checkpoint_error("read", &self.dir, e)),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CheckpointMeta>(&bytes) {
                Ok(meta) if meta.path.exists() => checkpoints.push(meta),
                Ok(meta) => {
                    warn!(path = %meta.path.display(), "Checkpoint sidecar without weights, ignoring");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable checkpoint sidecar, ignoring");
                }
            }
        }

        checkpoints.sort_by_key(|meta| meta.round_id);
        Ok(checkpoints)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| Self::checkpoint_error("delete", path, e))?;

        let sidecar = path.with_extension(META_EXT);
        if let Err(e) = tokio::fs::remove_file(&sidecar).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Self::checkpoint_error("delete", &sidecar, e));
            }
        }
        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<WeightSet> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Self::checkpoint_error("read", path, e))?;
        codec::decode(&bytes)
    }
}
