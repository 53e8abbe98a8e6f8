//! IngestManager: the receiver side of an upload.
//!
//! One [`IngestSession`] per `uploadId`. Files are written straight to
//! `<cache>/Uploads/<senderId>/<fileId>.<ext>`; chunks are appended in
//! strict per-file order and anything else is dropped.
//!
//! Every handler returns the replies to send back to the uploading peer.
//! Removal requests are always acknowledged with `all_files_removed`,
//! whether or not anything was found to remove.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::config::{CANCELLED_UPLOADS_REMEMBERED, DEFAULT_IDEA_ID, UPLOADS_DIR};
use crate::core::content_store::{delete_quietly, is_scoped_idea, is_video_extension, ContentStore};
use crate::core::protocol::manifest::{percent_of, sanitize_file_id, FileProgress};
use crate::core::protocol::{
    RemoveAllFiles, RemoveFile, UploadAbort, UploadChunk, UploadComplete, UploadFinished,
    UploadProgress, UploadStart, WireMessage,
};

// ── Session state ────────────────────────────────────────────────────────────

struct IncomingFile {
    path: PathBuf,
    extension: String,
    expected_size: u64,
    received: u64,
    expected_next_chunk: u32,
    handle: Option<tokio::fs::File>,
    write_failed: bool,
}

impl IncomingFile {
    fn is_complete(&self) -> bool {
        self.expected_size > 0 && self.received >= self.expected_size
    }

    /// Every announced byte landed on disk. Empty files qualify once the
    /// upload completes.
    fn is_delivered(&self) -> bool {
        !self.write_failed && (self.is_complete() || self.expected_size == 0)
    }
}

struct IngestSession {
    sender_id: String,
    idea_id: String,
    /// Manifest order, for stable progress lists.
    order: Vec<String>,
    files: HashMap<String, IncomingFile>,
}

impl IngestSession {
    fn total_expected(&self) -> u64 {
        self.files.values().map(|f| f.expected_size).sum()
    }

    fn total_received(&self) -> u64 {
        self.files.values().map(|f| f.received).sum()
    }

    fn completed_count(&self) -> usize {
        self.files.values().filter(|f| f.is_complete()).count()
    }
}

/// Replies addressed to the peer that sent the handled message.
pub type Replies = Vec<WireMessage>;

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct IngestManager {
    cache_root: PathBuf,
    sessions: HashMap<String, IngestSession>,
    /// `(upload_id, sender_id)` of recent aborts, oldest first.
    cancelled: VecDeque<(String, String)>,
}

impl IngestManager {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            sessions: HashMap::new(),
            cancelled: VecDeque::new(),
        }
    }

    /// `<cache>/Uploads/<senderId>`.
    pub fn sender_dir(&self, sender_id: &str) -> PathBuf {
        self.cache_root
            .join(UPLOADS_DIR)
            .join(sanitize_file_id(sender_id))
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn is_cancelled(&self, upload_id: &str) -> bool {
        self.cancelled.iter().any(|(id, _)| id == upload_id)
    }

    fn mark_cancelled(&mut self, upload_id: &str, sender_id: &str) {
        if self.is_cancelled(upload_id) {
            return;
        }
        if self.cancelled.len() >= CANCELLED_UPLOADS_REMEMBERED {
            self.cancelled.pop_front();
        }
        self.cancelled
            .push_back((upload_id.to_string(), sender_id.to_string()));
    }

    // ── upload_start ─────────────────────────────────────────────────────

    pub async fn on_upload_start(
        &mut self,
        sender_id: &str,
        start: UploadStart,
        store: &mut ContentStore,
    ) -> Replies {
        let dir = self.sender_dir(sender_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(event = "ingest_dir_failure", dir = %dir.display(), error = %e, "Cannot create upload directory");
        }
        self.cancelled.retain(|(id, _)| *id != start.upload_id);

        let idea_id = if start.idea_id.is_empty() {
            DEFAULT_IDEA_ID.to_string()
        } else {
            start.idea_id.clone()
        };

        let mut session = IngestSession {
            sender_id: sender_id.to_string(),
            idea_id: idea_id.clone(),
            order: Vec::new(),
            files: HashMap::new(),
        };

        for entry in &start.files {
            if session.files.contains_key(&entry.file_id) {
                continue;
            }
            let path = dir.join(entry.storage_name());
            let handle = match create_file(&path).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(event = "ingest_file_create_failure", upload_id = %start.upload_id, file_id = %entry.file_id, error = %format!("{:#}", e), "Skipping file that cannot be created");
                    continue;
                }
            };

            // Provisional mapping: in-flight files are resolvable right away.
            // Manifest media ids are informational here; only ideas keep
            // received files alive.
            store.relocate(&entry.file_id, &path);
            if is_scoped_idea(&idea_id) {
                store.associate(&entry.file_id, &idea_id);
            }

            session.order.push(entry.file_id.clone());
            session.files.insert(
                entry.file_id.clone(),
                IncomingFile {
                    path,
                    extension: entry.extension.clone(),
                    expected_size: entry.size_bytes,
                    received: 0,
                    expected_next_chunk: 0,
                    handle: Some(handle),
                    write_failed: false,
                },
            );
        }

        info!(event = "ingest_started", upload_id = %start.upload_id, sender = %sender_id, idea_id = %idea_id, files = session.files.len(), total_bytes = session.total_expected(), "Incoming upload");

        let total_files = session.files.len();
        self.sessions.insert(start.upload_id.clone(), session);

        vec![WireMessage::UploadProgress(UploadProgress {
            upload_id: start.upload_id,
            percent: 0,
            files_completed: 0,
            total_files,
            completed_file_ids: Vec::new(),
            per_file_progress: Vec::new(),
        })]
    }

    // ── upload_chunk ─────────────────────────────────────────────────────

    pub async fn on_upload_chunk(&mut self, sender_id: &str, chunk: UploadChunk) -> Replies {
        if self.is_cancelled(&chunk.upload_id) {
            debug!(event = "chunk_after_abort", upload_id = %chunk.upload_id, "Chunk for cancelled upload dropped");
            return Vec::new();
        }
        let Some(session) = self.sessions.get_mut(&chunk.upload_id) else {
            debug!(event = "chunk_unknown_upload", upload_id = %chunk.upload_id, "Chunk for unknown upload dropped");
            return Vec::new();
        };
        if session.sender_id != sender_id {
            warn!(event = "chunk_foreign_sender", upload_id = %chunk.upload_id, owner = %session.sender_id, got = %sender_id, "Chunk from another peer dropped");
            return Vec::new();
        }
        if is_scoped_idea(&chunk.idea_id) && chunk.idea_id != session.idea_id {
            warn!(event = "chunk_idea_mismatch", upload_id = %chunk.upload_id, expected = %session.idea_id, got = %chunk.idea_id, "Chunk for another idea dropped");
            return Vec::new();
        }
        let Some(file) = session.files.get_mut(&chunk.file_id) else {
            debug!(event = "chunk_unknown_file", upload_id = %chunk.upload_id, file_id = %chunk.file_id, "Chunk for unknown file dropped");
            return Vec::new();
        };
        if chunk.chunk_index != file.expected_next_chunk {
            warn!(event = "chunk_out_of_order", upload_id = %chunk.upload_id, file_id = %chunk.file_id, expected = file.expected_next_chunk, got = chunk.chunk_index, "Out-of-order chunk dropped");
            return Vec::new();
        }
        let was_complete = file.is_complete();
        let Some(handle) = file.handle.as_mut() else {
            debug!(event = "chunk_closed_file", file_id = %chunk.file_id, "Chunk for closed file dropped");
            return Vec::new();
        };
        let written = handle.write_all(&chunk.data).await;
        if let Err(e) = written {
            warn!(event = "chunk_write_failure", upload_id = %chunk.upload_id, file_id = %chunk.file_id, error = %e, "Write failed, dropping file from upload");
            file.handle = None;
            file.write_failed = true;
            return Vec::new();
        }
        file.expected_next_chunk += 1;
        file.received += chunk.data.len() as u64;

        let file_percent = percent_of(file.received, file.expected_size);
        let just_completed = !was_complete && file.is_complete();

        let mut completed_file_ids = Vec::new();
        if just_completed {
            completed_file_ids.push(chunk.file_id.clone());
        }

        vec![WireMessage::UploadProgress(UploadProgress {
            upload_id: chunk.upload_id.clone(),
            percent: percent_of(session.total_received(), session.total_expected()),
            files_completed: session.completed_count(),
            total_files: session.files.len(),
            completed_file_ids,
            per_file_progress: vec![FileProgress {
                file_id: chunk.file_id,
                percent: file_percent,
            }],
        })]
    }

    // ── upload_complete ──────────────────────────────────────────────────

    pub async fn on_upload_complete(
        &mut self,
        complete: UploadComplete,
        store: &mut ContentStore,
    ) -> Replies {
        let Some(mut session) = self.sessions.remove(&complete.upload_id) else {
            debug!(event = "complete_unknown_upload", upload_id = %complete.upload_id, "Completion for unknown upload ignored");
            return Vec::new();
        };

        for file_id in &session.order {
            let Some(file) = session.files.get_mut(file_id) else {
                continue;
            };
            if let Some(mut handle) = file.handle.take() {
                if let Err(e) = handle.flush().await {
                    warn!(event = "ingest_flush_failure", file_id = %file_id, error = %e, "Flush failed");
                }
            }
            if is_video_extension(&file.extension) {
                match store.memory_mut().preload(file_id, &file.path).await {
                    Ok(bytes) => {
                        debug!(event = "video_preloaded", file_id = %file_id, bytes, "Video cached in memory")
                    }
                    Err(e) => {
                        warn!(event = "video_preload_failure", file_id = %file_id, error = %format!("{:#}", e), "Video preload failed")
                    }
                }
            }
        }

        let delivered: Vec<String> = session
            .order
            .iter()
            .filter(|id| session.files.get(*id).is_some_and(IncomingFile::is_delivered))
            .cloned()
            .collect();
        let total_files = session.files.len();
        let percent = if delivered.len() == total_files {
            100
        } else {
            percent_of(session.total_received(), session.total_expected()).min(99)
        };
        if delivered.len() < total_files {
            warn!(event = "ingest_incomplete_files", upload_id = %complete.upload_id, delivered = delivered.len(), total_files, "Some files did not arrive in full");
        }

        info!(event = "ingest_complete", upload_id = %complete.upload_id, sender = %session.sender_id, files = delivered.len(), bytes = session.total_received(), "Upload received");

        vec![
            WireMessage::UploadProgress(UploadProgress {
                upload_id: complete.upload_id.clone(),
                percent,
                files_completed: delivered.len(),
                total_files,
                completed_file_ids: delivered,
                per_file_progress: Vec::new(),
            }),
            WireMessage::UploadFinished(UploadFinished {
                upload_id: complete.upload_id,
            }),
        ]
    }

    // ── Abort / removal ──────────────────────────────────────────────────

    pub async fn on_upload_abort(
        &mut self,
        sender_id: &str,
        abort: UploadAbort,
        store: &mut ContentStore,
    ) -> Replies {
        info!(event = "ingest_aborted", upload_id = %abort.upload_id, sender = %sender_id, reason = %abort.reason, "Upload aborted by sender");
        self.mark_cancelled(&abort.upload_id, sender_id);
        let idea_id = self
            .sessions
            .get(&abort.upload_id)
            .map(|s| s.idea_id.clone())
            .unwrap_or_else(|| abort.idea_id.clone());
        self.sessions.remove(&abort.upload_id);
        self.cleanup(sender_id, &idea_id, store).await;
        vec![WireMessage::AllFilesRemoved]
    }

    pub async fn on_remove_all_files(
        &mut self,
        sender_id: &str,
        request: RemoveAllFiles,
        store: &mut ContentStore,
    ) -> Replies {
        let upload_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.sender_id == sender_id)
            .map(|(id, _)| id.clone())
            .collect();
        for upload_id in upload_ids {
            self.sessions.remove(&upload_id);
            self.mark_cancelled(&upload_id, sender_id);
        }
        self.cleanup(sender_id, &request.idea_id, store).await;
        vec![WireMessage::AllFilesRemoved]
    }

    pub async fn on_remove_file(
        &mut self,
        sender_id: &str,
        request: RemoveFile,
        store: &mut ContentStore,
    ) -> Replies {
        let dir = self.sender_dir(sender_id);
        let file_id = request.file_id;

        let unused = if is_scoped_idea(&request.idea_id) {
            store.dissociate(&file_id, &request.idea_id)
        } else {
            store.record(&file_id).map(|r| r.is_unused()).unwrap_or(true)
        };
        if !unused {
            debug!(event = "remove_file_still_referenced", file_id = %file_id, ideas = ?store.ideas_of(&file_id), "File still referenced, kept on disk");
            return Vec::new();
        }

        match store.remove(&file_id) {
            Some(record) => delete_quietly(&record.local_path),
            None => remove_matching(&dir, &sanitize_file_id(&file_id)).await,
        }
        remove_dir_if_empty(&dir).await;
        info!(event = "file_removed", file_id = %file_id, sender = %sender_id, "File removed on request");
        Vec::new()
    }

    /// The connection to `sender_id` dropped: discard its partial cache.
    pub async fn on_connection_lost(&mut self, sender_id: &str, store: &mut ContentStore) {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.sender_id != sender_id);
        self.cancelled.retain(|(_, sender)| sender != sender_id);
        let dir = self.sender_dir(sender_id);
        let forgotten = store.remove_under_prefix(&dir);
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(event = "sender_cache_cleanup_failure", dir = %dir.display(), error = %e, "Failed to remove sender cache");
            }
        }
        info!(event = "ingest_connection_lost", sender = %sender_id, sessions = before - self.sessions.len(), files = forgotten.len(), "Sender disconnected, cache discarded");
    }

    async fn cleanup(&mut self, sender_id: &str, idea_id: &str, store: &mut ContentStore) {
        let dir = self.sender_dir(sender_id);
        if is_scoped_idea(idea_id) {
            let mut deleted = 0usize;
            for file_id in store.file_ids_under_prefix(&dir) {
                store.dissociate(&file_id, idea_id);
                if store.remove_file_if_unused(&file_id) {
                    deleted += 1;
                }
            }
            remove_dir_if_empty(&dir).await;
            info!(event = "idea_files_removed", sender = %sender_id, idea_id = %idea_id, deleted, "Idea-scoped cleanup done");
        } else {
            let removed = store.remove_under_prefix(&dir);
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(event = "sender_cache_cleanup_failure", dir = %dir.display(), error = %e, "Failed to remove sender cache");
                }
            }
            info!(event = "sender_files_removed", sender = %sender_id, removed = removed.len(), "Sender cache cleared");
        }
    }
}

// ── File helpers ─────────────────────────────────────────────────────────────

async fn create_file(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .with_context(|| format!("cannot create {}", path.display()))
}

/// Delete files in `dir` whose name starts with `prefix`.
async fn remove_matching(dir: &Path, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            delete_quietly(&entry.path());
        }
    }
}

async fn remove_dir_if_empty(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    if let Ok(None) = entries.next_entry().await {
        let _ = tokio::fs::remove_dir(dir).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::manifest::ManifestEntry;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("scenecast_test")
            .join("receiver")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    fn entry(file_id: &str, ext: &str, size: u64) -> ManifestEntry {
        ManifestEntry {
            file_id: file_id.into(),
            name: format!("{}.{}", file_id, ext),
            extension: ext.into(),
            size_bytes: size,
            media_ids: vec![],
        }
    }

    fn start(upload_id: &str, idea_id: &str, files: Vec<ManifestEntry>) -> UploadStart {
        UploadStart {
            upload_id: upload_id.into(),
            target_client_id: "me".into(),
            idea_id: idea_id.into(),
            files,
        }
    }

    fn chunk(upload_id: &str, file_id: &str, index: u32, data: &[u8]) -> UploadChunk {
        UploadChunk {
            upload_id: upload_id.into(),
            file_id: file_id.into(),
            chunk_index: index,
            data: data.to_vec(),
            idea_id: "I1".into(),
        }
    }

    #[tokio::test]
    async fn start_registers_provisional_paths_and_reports_zero() {
        let dir = test_dir("start");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);

        let replies = ingest
            .on_upload_start("S", start("u1", "I1", vec![entry("a", "png", 4)]), &mut store)
            .await;
        match &replies[0] {
            WireMessage::UploadProgress(p) => {
                assert_eq!(p.percent, 0);
                assert_eq!(p.total_files, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        let path = store.resolve_existing("a").unwrap();
        assert_eq!(path, dir.join("Uploads").join("S").join("a.png"));
        assert_eq!(store.ideas_of("a"), vec!["I1".to_string()]);

        cleanup(&dir);
    }

    #[tokio::test]
    async fn out_of_order_chunks_are_dropped() {
        let dir = test_dir("order");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start("S", start("u1", "I1", vec![entry("f", "bin", 8)]), &mut store)
            .await;

        assert_eq!(ingest.on_upload_chunk("S", chunk("u1", "f", 0, b"aa")).await.len(), 1);
        assert_eq!(ingest.on_upload_chunk("S", chunk("u1", "f", 1, b"bb")).await.len(), 1);
        assert!(ingest.on_upload_chunk("S", chunk("u1", "f", 3, b"dd")).await.is_empty());
        assert_eq!(ingest.on_upload_chunk("S", chunk("u1", "f", 2, b"cc")).await.len(), 1);
        assert!(ingest.on_upload_chunk("S", chunk("u1", "f", 2, b"cc")).await.is_empty());

        ingest
            .on_upload_complete(
                UploadComplete {
                    upload_id: "u1".into(),
                    idea_id: "I1".into(),
                },
                &mut store,
            )
            .await;
        let bytes = std::fs::read(store.path_of("f").unwrap()).unwrap();
        assert_eq!(bytes, b"aabbcc");

        cleanup(&dir);
    }

    #[tokio::test]
    async fn progress_lists_only_files_that_just_completed() {
        let dir = test_dir("progress");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start(
                "S",
                start("u1", "I1", vec![entry("a", "bin", 2), entry("b", "bin", 2)]),
                &mut store,
            )
            .await;

        let replies = ingest.on_upload_chunk("S", chunk("u1", "a", 0, b"xx")).await;
        match &replies[0] {
            WireMessage::UploadProgress(p) => {
                assert_eq!(p.percent, 50);
                assert_eq!(p.files_completed, 1);
                assert_eq!(p.completed_file_ids, vec!["a".to_string()]);
                assert_eq!(p.per_file_progress.len(), 1);
                assert_eq!(p.per_file_progress[0].percent, 100);
            }
            other => panic!("unexpected {:?}", other),
        }

        let replies = ingest.on_upload_chunk("S", chunk("u1", "b", 0, b"y")).await;
        match &replies[0] {
            WireMessage::UploadProgress(p) => {
                assert_eq!(p.percent, 75);
                assert!(p.completed_file_ids.is_empty());
                assert_eq!(p.per_file_progress[0].file_id, "b");
            }
            other => panic!("unexpected {:?}", other),
        }

        cleanup(&dir);
    }

    #[tokio::test]
    async fn complete_sends_final_progress_then_finished() {
        let dir = test_dir("complete");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start("S", start("u1", "I1", vec![entry("v", "mp4", 3)]), &mut store)
            .await;
        ingest.on_upload_chunk("S", chunk("u1", "v", 0, b"vid")).await;

        let replies = ingest
            .on_upload_complete(
                UploadComplete {
                    upload_id: "u1".into(),
                    idea_id: "I1".into(),
                },
                &mut store,
            )
            .await;
        assert!(matches!(&replies[0], WireMessage::UploadProgress(p) if p.percent == 100 && p.completed_file_ids == vec!["v".to_string()]));
        assert!(matches!(&replies[1], WireMessage::UploadFinished(f) if f.upload_id == "u1"));
        assert!(store.memory().contains("v"));
        assert_eq!(ingest.active_sessions(), 0);

        cleanup(&dir);
    }

    #[tokio::test]
    async fn removal_is_acknowledged_without_a_session() {
        let dir = test_dir("ack");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        let replies = ingest
            .on_remove_all_files(
                "nobody",
                RemoveAllFiles {
                    target_client_id: "me".into(),
                    idea_id: "I1".into(),
                },
                &mut store,
            )
            .await;
        assert_eq!(replies, vec![WireMessage::AllFilesRemoved]);
        cleanup(&dir);
    }

    #[tokio::test]
    async fn idea_scoped_removal_keeps_shared_files() {
        let dir = test_dir("shared");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start(
                "S",
                start("u1", "I1", vec![entry("shared", "png", 1), entry("own", "png", 1)]),
                &mut store,
            )
            .await;
        store.associate("shared", "I2");

        let replies = ingest
            .on_upload_abort(
                "S",
                UploadAbort {
                    upload_id: "u1".into(),
                    reason: "cancelled".into(),
                    idea_id: "I1".into(),
                },
                &mut store,
            )
            .await;
        assert_eq!(replies, vec![WireMessage::AllFilesRemoved]);
        assert!(store.resolve_existing("shared").is_some());
        assert!(store.record("own").is_none());
        assert!(!dir.join("Uploads").join("S").join("own.png").exists());

        assert!(ingest.on_upload_chunk("S", chunk("u1", "shared", 0, b"x")).await.is_empty());

        cleanup(&dir);
    }

    #[tokio::test]
    async fn remove_file_deletes_only_unreferenced() {
        let dir = test_dir("remove_file");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start("S", start("u1", "I1", vec![entry("a", "png", 1)]), &mut store)
            .await;
        store.associate("a", "I2");

        let request = |idea: &str| RemoveFile {
            target_client_id: "me".into(),
            file_id: "a".into(),
            idea_id: idea.into(),
        };
        ingest.on_remove_file("S", request("I1"), &mut store).await;
        assert!(store.resolve_existing("a").is_some());

        ingest.on_remove_file("S", request("I2"), &mut store).await;
        assert!(store.record("a").is_none());
        assert!(!dir.join("Uploads").join("S").exists());

        cleanup(&dir);
    }

    #[tokio::test]
    async fn connection_loss_discards_sender_cache() {
        let dir = test_dir("conn_lost");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start("S", start("u1", "", vec![entry("a", "png", 4)]), &mut store)
            .await;
        ingest.on_upload_chunk("S", chunk("u1", "a", 0, b"ab")).await;

        ingest.on_connection_lost("S", &mut store).await;
        assert_eq!(ingest.active_sessions(), 0);
        assert!(store.record("a").is_none());
        assert!(!ingest.sender_dir("S").exists());

        cleanup(&dir);
    }

    #[tokio::test]
    async fn complete_reports_only_fully_received_files() {
        let dir = test_dir("partial");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start(
                "S",
                start("u1", "I1", vec![entry("a", "bin", 2), entry("b", "bin", 4)]),
                &mut store,
            )
            .await;
        ingest.on_upload_chunk("S", chunk("u1", "a", 0, b"aa")).await;
        ingest.on_upload_chunk("S", chunk("u1", "b", 0, b"bb")).await;

        let replies = ingest
            .on_upload_complete(
                UploadComplete {
                    upload_id: "u1".into(),
                    idea_id: "I1".into(),
                },
                &mut store,
            )
            .await;
        match &replies[0] {
            WireMessage::UploadProgress(p) => {
                assert_eq!(p.percent, 67);
                assert_eq!(p.files_completed, 1);
                assert_eq!(p.total_files, 2);
                assert_eq!(p.completed_file_ids, vec!["a".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&replies[1], WireMessage::UploadFinished(_)));

        cleanup(&dir);
    }

    #[tokio::test]
    async fn manifest_media_ids_do_not_pin_received_files() {
        let dir = test_dir("media_ids");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        let mut tagged = entry("clip", "mp4", 4);
        tagged.media_ids = vec!["m1".into()];
        ingest
            .on_upload_start("S", start("u1", "I1", vec![tagged]), &mut store)
            .await;
        assert!(store.record("clip").is_some_and(|r| r.media.is_empty()));

        ingest
            .on_upload_abort(
                "S",
                UploadAbort {
                    upload_id: "u1".into(),
                    reason: "cancelled".into(),
                    idea_id: "I1".into(),
                },
                &mut store,
            )
            .await;
        assert!(store.record("clip").is_none());
        assert!(!dir.join("Uploads").join("S").join("clip.mp4").exists());

        cleanup(&dir);
    }

    #[tokio::test]
    async fn restart_keeps_other_ideas_of_known_files() {
        let dir = test_dir("restart");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start("S", start("u1", "I1", vec![entry("a", "png", 1)]), &mut store)
            .await;
        ingest
            .on_upload_start("S", start("u2", "I2", vec![entry("a", "png", 1)]), &mut store)
            .await;

        let mut ideas = store.ideas_of("a");
        ideas.sort();
        assert_eq!(ideas, vec!["I1".to_string(), "I2".to_string()]);
        assert_eq!(
            store.path_of("a").unwrap(),
            dir.join("Uploads").join("S").join("a.png")
        );

        cleanup(&dir);
    }

    #[tokio::test]
    async fn chunks_from_another_sender_are_dropped() {
        let dir = test_dir("foreign");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        ingest
            .on_upload_start("S", start("u1", "I1", vec![entry("f", "bin", 4)]), &mut store)
            .await;

        assert!(ingest.on_upload_chunk("X", chunk("u1", "f", 0, b"zz")).await.is_empty());
        assert_eq!(ingest.on_upload_chunk("S", chunk("u1", "f", 0, b"ab")).await.len(), 1);
        assert_eq!(ingest.on_upload_chunk("S", chunk("u1", "f", 1, b"cd")).await.len(), 1);

        ingest
            .on_upload_complete(
                UploadComplete {
                    upload_id: "u1".into(),
                    idea_id: "I1".into(),
                },
                &mut store,
            )
            .await;
        assert_eq!(std::fs::read(store.path_of("f").unwrap()).unwrap(), b"abcd");

        cleanup(&dir);
    }

    #[tokio::test]
    async fn cancelled_uploads_are_bounded_and_forgotten_with_the_sender() {
        let dir = test_dir("cancelled");
        let mut store = ContentStore::new();
        let mut ingest = IngestManager::new(&dir);
        let abort = |upload_id: String| UploadAbort {
            upload_id,
            reason: "cancelled".into(),
            idea_id: "I1".into(),
        };

        for n in 0..=CANCELLED_UPLOADS_REMEMBERED {
            ingest
                .on_upload_abort("S", abort(format!("u{}", n)), &mut store)
                .await;
        }
        assert_eq!(ingest.cancelled.len(), CANCELLED_UPLOADS_REMEMBERED);
        assert!(!ingest.is_cancelled("u0"));
        assert!(ingest.is_cancelled(&format!("u{}", CANCELLED_UPLOADS_REMEMBERED)));

        ingest
            .on_upload_abort("T", abort("t1".into()), &mut store)
            .await;
        ingest.on_connection_lost("S", &mut store).await;
        assert_eq!(ingest.cancelled.len(), 1);
        assert!(ingest.is_cancelled("t1"));

        cleanup(&dir);
    }
}
