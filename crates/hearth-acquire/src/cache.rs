//! On-disk asset cache with persisted hit files and miss sentinels.
//!
//! ## Layout
//!
//! Every entry is addressed by a key of the form `{id}_{variant}`:
//!
//! - `{key}.{ext}` holds the asset bytes (a *hit*)
//! - `{key}.miss` is a zero-byte sentinel recording that the upstream host
//!   definitively has no such asset (a *miss*)
//!
//! Hit and miss are mutually exclusive. Writing a hit removes any miss
//! sentinel; a miss is never written over an existing hit. Miss sentinels do
//! not expire and are only removed by [`DiskCache::clear_miss`] or
//! [`DiskCache::invalidate`].

use crate::error::{AcquireError, AcquireResult};
use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

/// Extension of the miss sentinel files.
const MISS_EXTENSION: &str = "miss";

/// Distinguishes concurrent temp files within one process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Resolved state of a cache entry on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Absent,
    Hit(PathBuf),
    Miss,
}

impl EntryState {
    /// Hit or miss; either way no network access is needed.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Counts of entries on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub hit_bytes: u64,
}

/// Asset cache backed by a single directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    extension: String,
}

impl DiskCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, extension: &str) -> AcquireResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let extension = extension.trim_start_matches('.').to_string();
        if extension.is_empty() || extension == MISS_EXTENSION {
            return Err(AcquireError::Config(format!(
                "invalid cache file extension: {extension:?}"
            )));
        }
        tracing::debug!("DiskCache opened at {}", dir.display());
        Ok(Self { dir, extension })
    }

    /// Default cache location (~/.hearth-acquire/art/).
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".hearth-acquire")
            .join("art")
    }

    /// Cache directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the hit file for `key`.
    pub fn hit_path(&self, key: &str) -> AcquireResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.{}", self.extension)))
    }

    /// Path of the miss sentinel for `key`.
    pub fn miss_path(&self, key: &str) -> AcquireResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.{MISS_EXTENSION}")))
    }

    /// Resolve the on-disk state of `key`.
    pub async fn state(&self, key: &str) -> AcquireResult<EntryState> {
        let hit = self.hit_path(key)?;
        if fs::try_exists(&hit).await? {
            return Ok(EntryState::Hit(hit));
        }
        if fs::try_exists(self.miss_path(key)?).await? {
            return Ok(EntryState::Miss);
        }
        Ok(EntryState::Absent)
    }

    /// Read the bytes of a hit, `None` if the key is not a hit.
    pub async fn read(&self, key: &str) -> AcquireResult<Option<Bytes>> {
        match fs::read(self.hit_path(key)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `data` as a hit for `key`.
    ///
    /// The file is written to a temporary name and renamed into place so
    /// readers never observe a partial asset.
    pub async fn write_hit(&self, key: &str, data: &[u8]) -> AcquireResult<PathBuf> {
        let path = self.hit_path(key)?;
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!(".{key}.{}.{seq}.tmp", std::process::id()));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        remove_if_exists(&self.miss_path(key)?).await?;
        tracing::debug!(key, bytes = data.len(), "cached asset");
        Ok(path)
    }

    /// Persist a miss sentinel for `key`.
    ///
    /// Returns `false` without writing if the key is already a hit.
    pub async fn write_miss(&self, key: &str) -> AcquireResult<bool> {
        if fs::try_exists(self.hit_path(key)?).await? {
            tracing::warn!(key, "refusing to mark a cached asset as missing");
            return Ok(false);
        }
        fs::write(self.miss_path(key)?, b"").await?;
        tracing::debug!(key, "recorded permanent miss");
        Ok(true)
    }

    /// Remove the miss sentinel for `key`. Returns whether one existed.
    pub async fn clear_miss(&self, key: &str) -> AcquireResult<bool> {
        remove_if_exists(&self.miss_path(key)?).await
    }

    /// Remove both the hit file and the miss sentinel for `key`.
    pub async fn invalidate(&self, key: &str) -> AcquireResult<()> {
        remove_if_exists(&self.hit_path(key)?).await?;
        remove_if_exists(&self.miss_path(key)?).await?;
        Ok(())
    }

    /// Count hits and misses currently on disk.
    pub async fn stats(&self) -> AcquireResult<CacheStats> {
        let mut stats = CacheStats::default();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
            {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some(MISS_EXTENSION) => stats.misses += 1,
                Some(ext) if ext == self.extension => {
                    stats.hits += 1;
                    stats.hit_bytes += entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                }
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Keys become file names, so anything that could escape the directory or
/// collide with the temp-file naming is rejected.
fn validate_key(key: &str) -> AcquireResult<()> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !key.contains("..");
    if ok {
        Ok(())
    } else {
        Err(AcquireError::InvalidKey(key.to_string()))
    }
}

async fn remove_if_exists(path: &Path) -> AcquireResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
