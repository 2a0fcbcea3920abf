//! Per-peer message history on local disk.
//!
//! Each `(own id, peer id)` pair maps to one append-only text file, one
//! message per line. Files are created lazily on first append, never
//! truncated while the session runs, and removed wholesale when the
//! session ends so a later login that reuses an id does not inherit a
//! dead session's history.

use async_std::fs::{self, OpenOptions};
use async_std::path::{Path, PathBuf};
use async_std::prelude::*;
use std::io;
use thiserror::Error;

/// A history file could not be created, read, written, or removed.
#[derive(Debug, Error)]
#[error("message cache i/o on {}: {source}", path.display())]
pub struct CacheError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl CacheError {
    fn new(path: &Path, source: io::Error) -> CacheError {
        CacheError {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The on-disk message history for one client session.
#[derive(Debug, Clone)]
pub struct MessageCache {
    dir: PathBuf,
}

impl MessageCache {
    /// Use `dir` as the history directory, creating files under it as
    /// needed.
    pub fn new(dir: impl Into<PathBuf>) -> MessageCache {
        MessageCache { dir: dir.into() }
    }

    /// The history file for the conversation between `self_id` and
    /// `peer_id`. The name is a pure function of the two ids, so every
    /// append and read for the pair lands on the same file.
    fn file_path(&self, self_id: u32, peer_id: u32) -> PathBuf {
        self.dir.join(format!("{}-{}-messages.txt", self_id, peer_id))
    }

    /// Append one message line to the conversation with `peer_id`.
    ///
    /// The line and its terminating newline go out in a single write so a
    /// concurrent reader never sees a torn line.
    pub async fn append_line(&self, self_id: u32, peer_id: u32, line: &str) -> Result<(), CacheError> {
        let path = self.file_path(self_id, peer_id);
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::new(&self.dir, e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| CacheError::new(&path, e))?;

        let mut record = line.to_string();
        record.push('\n');
        file.write_all(record.as_bytes())
            .await
            .map_err(|e| CacheError::new(&path, e))?;
        file.flush().await.map_err(|e| CacheError::new(&path, e))?;
        Ok(())
    }

    /// The full recorded conversation with `peer_id`, or an empty string
    /// if nothing has been exchanged yet.
    pub async fn read_all(&self, self_id: u32, peer_id: u32) -> Result<String, CacheError> {
        let path = self.file_path(self_id, peer_id);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(CacheError::new(&path, err)),
        }
    }

    /// Remove every history file belonging to `self_id`, leaving other
    /// sessions' files alone.
    pub async fn delete_all(&self, self_id: u32) -> Result<(), CacheError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(CacheError::new(&self.dir, err)),
        };

        let prefix = format!("{}-", self_id);
        while let Some(entry) = entries.next().await {
            let entry = entry.map_err(|e| CacheError::new(&self.dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with("-messages.txt") {
                let path = entry.path();
                fs::remove_file(&path)
                    .await
                    .map_err(|e| CacheError::new(&path, e))?;
            }
        }
        Ok(())
    }
}
