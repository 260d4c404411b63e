use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// On-disk response cache keyed by request URL.
#[derive(Debug)]
pub struct HttpCache {
    dir: PathBuf,
    ttl: Duration,
    enabled: bool,
    tmp_counter: AtomicU64,
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    written_at_ms: i64,
    body: String,
}

impl HttpCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            enabled,
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{:016x}.bin", seahash::hash(key.as_bytes())))
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }

        let path = self.entry_path(key);
        let bytes = tokio::fs::read(&path).await.ok()?;

        let entry: CacheEntry = match postcard::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(?path, error = %e, "discarding unreadable cache entry");
                return None;
            }
        };

        if entry.key != key {
            return None;
        }

        let age_ms = Utc::now().timestamp_millis() - entry.written_at_ms;
        if age_ms < 0 || age_ms as u128 >= self.ttl.as_millis() {
            debug!(key, age_ms, "cache entry expired");
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        serde_json::from_str(&entry.body).ok()
    }

    /// Best effort: failures are logged and otherwise ignored.
    pub async fn set(&self, key: &str, value: &Value) {
        if !self.enabled {
            return;
        }

        if let Err(e) = self.write_entry(key, value).await {
            warn!(key, error = %e, "failed to write cache entry");
        }
    }

    async fn write_entry(&self, key: &str, value: &Value) -> anyhow::Result<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            written_at_ms: Utc::now().timestamp_millis(),
            body: serde_json::to_string(value)?,
        };
        let bytes = postcard::to_stdvec(&entry)?;

        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.entry_path(key);
        let tmp = path.with_extension(format!(
            "tmp{}.{}",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Removes every entry and leftover temp file, whether or not lookups are
    /// enabled. Anything else in the directory is left alone.
    pub async fn clear(&self) -> std::io::Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Ok(());
        }

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let ours = entry.file_name().to_str().is_some_and(is_cache_file_name);
            if ours && entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        debug!(dir = ?self.dir, removed, "cleared http cache");

        Ok(())
    }
}

/// Matches `<16 hex digits>.bin` entries and their `<16 hex digits>.tmp*`
/// temp files.
fn is_cache_file_name(name: &str) -> bool {
    let Some((stem, extension)) = name.split_once('.') else {
        return false;
    };
    stem.len() == 16
        && stem.bytes().all(|b| b.is_ascii_hexdigit())
        && (extension == "bin" || extension.starts_with("tmp"))
}
