//! Content-addressed file registry.
//!
//! Maps a stable `fileId` to the local path holding its bytes and tracks
//! three kinds of references:
//! - ideas (logical projects) a file belongs to,
//! - media instances currently using the file,
//! - remote clients the file has been confirmedly delivered to.
//!
//! A file becomes eligible for deletion once no idea and no media instance
//! reference it. The delivery ledger lets the sender skip re-uploading
//! content a client already holds.

use anyhow::{Context, Result};
use bytes::Bytes;
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::core::config::{DEFAULT_IDEA_ID, VIDEO_EXTENSIONS};

// ── File record ──────────────────────────────────────────────────────────────

/// Everything known about one piece of content.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Lowercase extension without the dot, empty when the path has none.
    pub extension: String,
    pub ideas: BTreeSet<String>,
    pub delivered_to: HashSet<String>,
    pub media: HashSet<String>,
}

impl FileRecord {
    fn new(file_id: String, local_path: PathBuf) -> Self {
        let size_bytes = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
        let extension = extension_of(&local_path);
        Self {
            file_id,
            local_path,
            size_bytes,
            extension,
            ideas: BTreeSet::new(),
            delivered_to: HashSet::new(),
            media: HashSet::new(),
        }
    }

    pub fn is_video(&self) -> bool {
        is_video_extension(&self.extension)
    }

    /// No idea and no media instance references this file.
    pub fn is_unused(&self) -> bool {
        self.ideas.is_empty() && self.media.is_empty()
    }
}

/// Lowercase extension of `path`, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn is_video_extension(extension: &str) -> bool {
    VIDEO_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

/// Derive a stable identifier from the canonical path, size and mtime.
///
/// The same file keeps its id until it is moved or modified.
pub fn file_id_for(path: &Path) -> Result<String> {
    let canonical = std::fs::canonicalize(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    let meta = std::fs::metadata(&canonical)
        .with_context(|| format!("cannot stat {}", canonical.display()))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha3_256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(modified.to_le_bytes());
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}

/// Ideas other than the default sentinel take part in reference counting.
pub fn is_scoped_idea(idea_id: &str) -> bool {
    !idea_id.is_empty() && idea_id != DEFAULT_IDEA_ID
}

// ── Content store ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ContentStore {
    records: HashMap<String, FileRecord>,
    /// mediaId → fileId, so a media instance can be detached by id alone.
    media_index: HashMap<String, String>,
    memory: MemoryCache,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// Map `file_id` to `path`. Idempotent: an existing mapping is kept.
    ///
    /// Returns `false` (and logs) when `path` does not exist.
    pub fn register(&mut self, file_id: &str, path: &Path) -> bool {
        if self.records.contains_key(file_id) {
            return true;
        }
        if !path.exists() {
            warn!(event = "register_missing_path", file_id = %file_id, path = %path.display(), "Cannot register file: path does not exist");
            return false;
        }
        self.records.insert(
            file_id.to_string(),
            FileRecord::new(file_id.to_string(), path.to_path_buf()),
        );
        debug!(event = "file_registered", file_id = %file_id, path = %path.display(), "File registered");
        true
    }

    /// Point `file_id` at `path`, keeping the idea, delivery and media
    /// references an existing record already holds.
    pub fn relocate(&mut self, file_id: &str, path: &Path) -> bool {
        let Some(record) = self.records.get_mut(file_id) else {
            return self.register(file_id, path);
        };
        if !path.exists() {
            warn!(event = "relocate_missing_path", file_id = %file_id, path = %path.display(), "Cannot relocate file: path does not exist");
            return false;
        }
        let refreshed = FileRecord::new(file_id.to_string(), path.to_path_buf());
        record.local_path = refreshed.local_path;
        record.size_bytes = refreshed.size_bytes;
        record.extension = refreshed.extension;
        debug!(event = "file_relocated", file_id = %file_id, path = %path.display(), "File mapping updated");
        true
    }

    /// Register a local (sender-side) file under its derived id.
    pub fn register_local(&mut self, path: &Path) -> Result<FileRecord> {
        let file_id = file_id_for(path)?;
        if !self.register(&file_id, path) {
            anyhow::bail!("file not found: {}", path.display());
        }
        self.records
            .get(&file_id)
            .cloned()
            .with_context(|| format!("record vanished for {}", file_id))
    }

    pub fn record(&self, file_id: &str) -> Option<&FileRecord> {
        self.records.get(file_id)
    }

    pub fn path_of(&self, file_id: &str) -> Option<&Path> {
        self.records.get(file_id).map(|r| r.local_path.as_path())
    }

    /// Path of `file_id` only when the bytes are actually on disk.
    pub fn resolve_existing(&self, file_id: &str) -> Option<PathBuf> {
        self.path_of(file_id)
            .filter(|p| p.exists())
            .map(Path::to_path_buf)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    // ── Ideas ────────────────────────────────────────────────────────────

    pub fn associate(&mut self, file_id: &str, idea_id: &str) -> bool {
        match self.records.get_mut(file_id) {
            Some(record) => {
                record.ideas.insert(idea_id.to_string());
                true
            }
            None => {
                debug!(event = "associate_unknown_file", file_id = %file_id, idea_id = %idea_id, "Association ignored: unknown file");
                false
            }
        }
    }

    /// Drop the idea reference. Returns `true` when the file is now unused
    /// and may be deleted.
    pub fn dissociate(&mut self, file_id: &str, idea_id: &str) -> bool {
        match self.records.get_mut(file_id) {
            Some(record) => {
                record.ideas.remove(idea_id);
                record.is_unused()
            }
            None => false,
        }
    }

    pub fn ideas_of(&self, file_id: &str) -> Vec<String> {
        self.records
            .get(file_id)
            .map(|r| r.ideas.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Media instances ──────────────────────────────────────────────────

    pub fn attach_media(&mut self, file_id: &str, media_id: &str) -> bool {
        let Some(record) = self.records.get_mut(file_id) else {
            return false;
        };
        record.media.insert(media_id.to_string());
        self.media_index
            .insert(media_id.to_string(), file_id.to_string());
        true
    }

    /// Detach a media instance. Returns the file it referenced.
    pub fn detach_media(&mut self, media_id: &str) -> Option<String> {
        let file_id = self.media_index.remove(media_id)?;
        if let Some(record) = self.records.get_mut(&file_id) {
            record.media.remove(media_id);
        }
        Some(file_id)
    }

    /// Forget (and delete from disk) a file no idea or media still uses.
    /// Returns `true` when the file was removed.
    pub fn remove_file_if_unused(&mut self, file_id: &str) -> bool {
        let unused = self
            .records
            .get(file_id)
            .map(FileRecord::is_unused)
            .unwrap_or(false);
        if !unused {
            return false;
        }
        if let Some(record) = self.remove(file_id) {
            delete_quietly(&record.local_path);
        }
        true
    }

    // ── Delivery ledger ──────────────────────────────────────────────────

    pub fn mark_delivered(&mut self, file_id: &str, client_id: &str) -> bool {
        match self.records.get_mut(file_id) {
            Some(record) => record.delivered_to.insert(client_id.to_string()),
            None => false,
        }
    }

    pub fn unmark_delivered(&mut self, file_id: &str, client_id: &str) -> bool {
        match self.records.get_mut(file_id) {
            Some(record) => record.delivered_to.remove(client_id),
            None => false,
        }
    }

    pub fn is_delivered(&self, file_id: &str, client_id: &str) -> bool {
        self.records
            .get(file_id)
            .map(|r| r.delivered_to.contains(client_id))
            .unwrap_or(false)
    }

    /// Drop every delivery mark held for `client_id`.
    pub fn forget_client(&mut self, client_id: &str) -> usize {
        let mut forgotten = 0;
        for record in self.records.values_mut() {
            if record.delivered_to.remove(client_id) {
                forgotten += 1;
            }
        }
        if forgotten > 0 {
            info!(event = "client_ledger_cleared", client_id = %client_id, files = forgotten, "Delivery marks cleared for client");
        }
        forgotten
    }

    // ── Removal ──────────────────────────────────────────────────────────

    /// Forget the mapping (bytes on disk are left alone).
    pub fn remove(&mut self, file_id: &str) -> Option<FileRecord> {
        let record = self.records.remove(file_id)?;
        for media_id in &record.media {
            self.media_index.remove(media_id);
        }
        self.memory.release(file_id);
        Some(record)
    }

    pub fn file_ids_under_prefix(&self, prefix: &Path) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.local_path.starts_with(prefix))
            .map(|r| r.file_id.clone())
            .collect()
    }

    /// Forget every mapping whose path lies under `prefix`.
    pub fn remove_under_prefix(&mut self, prefix: &Path) -> Vec<String> {
        let ids = self.file_ids_under_prefix(prefix);
        for id in &ids {
            self.remove(id);
        }
        ids
    }

    // ── Memory cache ─────────────────────────────────────────────────────

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryCache {
        &mut self.memory
    }
}

/// Remove a file, logging (not failing) when that is impossible.
pub fn delete_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(event = "file_deleted", path = %path.display(), "Deleted file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(event = "file_delete_failure", path = %path.display(), error = %e, "Failed to delete file")
        }
    }
}

// ── Memory cache ─────────────────────────────────────────────────────────────

/// In-memory copies of recently received videos for low-latency first play.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<String, Bytes>,
}

impl MemoryCache {
    /// Read the whole file into memory. A second preload is a no-op.
    pub async fn preload(&mut self, file_id: &str, path: &Path) -> Result<usize> {
        if let Some(existing) = self.entries.get(file_id) {
            return Ok(existing.len());
        }
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("preload read failed for {}", path.display()))?;
        let len = data.len();
        self.entries.insert(file_id.to_string(), Bytes::from(data));
        debug!(event = "file_preloaded", file_id = %file_id, bytes = len, "File preloaded into memory");
        Ok(len)
    }

    pub fn insert(&mut self, file_id: &str, data: Bytes) {
        self.entries.insert(file_id.to_string(), data);
    }

    /// Cheap clone of the cached bytes.
    pub fn bytes(&self, file_id: &str) -> Option<Bytes> {
        self.entries.get(file_id).cloned()
    }

    pub fn release(&mut self, file_id: &str) -> bool {
        self.entries.remove(file_id).is_some()
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.entries.contains_key(file_id)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
