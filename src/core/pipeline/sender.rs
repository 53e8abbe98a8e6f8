//! TransferSession: the sender side of an upload.
//!
//! ```text
//! Idle ──start──► Streaming ──all chunks read──► Finalizing ──upload_finished──► Active
//!   ▲                 │                              │                             │
//!   │               cancel                         cancel                        unload
//!   │                 ▼                              ▼                             ▼
//!   └──── ack / 3 s fallback / connection loss ── Cancelling ◄─────────────────────┘
//! ```
//!
//! The session is a pure state machine: every operation returns a
//! [`SenderOutcome`] listing the messages to send and the tasks/timers the
//! event loop must start. Local completion is never authoritative; only
//! the receiver's `upload_finished` for the exact `uploadId` moves the
//! session to `Active` and marks files delivered.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::{CANCEL_FALLBACK, CHUNK_SIZE, DEFAULT_IDEA_ID, MIN_ACTION_INTERVAL};
use crate::core::content_store::ContentStore;
use crate::core::pipeline::chunk::StreamFile;
use crate::core::pipeline::progress::{ProgressAggregator, ProgressChange};
use crate::core::protocol::manifest::{percent_of, ManifestEntry};
use crate::core::protocol::{
    RemoveAllFiles, UploadAbort, UploadChunk, UploadComplete, UploadProgress, UploadStart,
    WireMessage,
};
use crate::core::transport::Channel;
use crate::utils::sos::SignalOfStop;

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Streaming,
    Finalizing,
    Active,
    Cancelling,
}

impl SessionState {
    /// Bytes are (or may still be) in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Finalizing)
    }
}

/// Why the remote copy was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// The receiver acknowledged with `all_files_removed`.
    Acknowledged,
    /// No acknowledgment within the fallback window.
    Forced,
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// Observer notifications (progress bars, buttons, toasts).
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    StateChanged(SessionState),
    Progress {
        upload_id: String,
        percent: u8,
        files_completed: usize,
        total_files: usize,
    },
    FileProgress {
        file_id: String,
        percent: u8,
    },
    AlreadySynchronized {
        target_client_id: String,
    },
    Finished {
        upload_id: String,
    },
    RemoteCleared {
        reason: ClearReason,
    },
}

/// Side effects the event loop executes on behalf of the session.
#[derive(Debug)]
pub enum SenderAction {
    Send {
        to: String,
        channel: Channel,
        message: WireMessage,
    },
    StartStream {
        upload_id: String,
        files: Vec<StreamFile>,
        chunk_size: usize,
        stop: SignalOfStop,
    },
    ArmCancelFallback {
        token: String,
        delay: Duration,
    },
    Notify(SenderEvent),
}

pub struct SenderOutcome {
    pub actions: Vec<SenderAction>,
    pub status: Option<String>,
}

impl SenderOutcome {
    pub fn empty() -> Self {
        Self {
            actions: Vec::new(),
            status: None,
        }
    }

    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            actions: Vec::new(),
            status: Some(status.into()),
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub chunk_size: usize,
    pub cancel_fallback: Duration,
    /// Route upload traffic over the dedicated bulk channel.
    pub bulk_channel: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            cancel_fallback: CANCEL_FALLBACK,
            bulk_channel: false,
        }
    }
}

/// A file the caller wants on the remote side.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub media_ids: Vec<String>,
}

impl OutgoingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            media_ids: Vec::new(),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct TransferSession {
    config: SenderConfig,
    state: SessionState,
    upload_id: Option<String>,
    target_client_id: String,
    idea_id: String,
    /// Files streamed by the current upload.
    manifest: Vec<ManifestEntry>,
    /// Every file of the requested set, streamed or already delivered.
    file_set: Vec<String>,
    sent_per_file: HashMap<String, u64>,
    /// Files the reader gave up on; never marked delivered.
    failed: HashSet<String>,
    sent_bytes: u64,
    total_bytes: u64,
    progress: ProgressAggregator,
    stop: SignalOfStop,
    cancel_requested: bool,
    /// Files marked delivered from `completedFileIds` before `upload_finished`.
    optimistic: HashSet<String>,
    cleanup_token: Option<String>,
    last_action: Option<Instant>,
}

impl TransferSession {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            upload_id: None,
            target_client_id: String::new(),
            idea_id: String::new(),
            manifest: Vec::new(),
            file_set: Vec::new(),
            sent_per_file: HashMap::new(),
            failed: HashSet::new(),
            sent_bytes: 0,
            total_bytes: 0,
            progress: ProgressAggregator::default(),
            stop: SignalOfStop::new(),
            cancel_requested: false,
            optimistic: HashSet::new(),
            cleanup_token: None,
            last_action: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn target_client_id(&self) -> &str {
        &self.target_client_id
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn overall_percent(&self) -> u8 {
        self.progress.overall()
    }

    fn channel(&self) -> Channel {
        if self.config.bulk_channel {
            Channel::Bulk
        } else {
            Channel::Control
        }
    }

    fn send(&self, message: WireMessage) -> SenderAction {
        let channel = if message.is_upload_stream() {
            self.channel()
        } else {
            Channel::Control
        };
        SenderAction::Send {
            to: self.target_client_id.clone(),
            channel,
            message,
        }
    }

    fn set_state(&mut self, state: SessionState, actions: &mut Vec<SenderAction>) {
        if self.state != state {
            debug!(event = "sender_state_changed", from = ?self.state, to = ?state, "Transfer session state changed");
            self.state = state;
            actions.push(SenderAction::Notify(SenderEvent::StateChanged(state)));
        }
    }

    // ── Starting ─────────────────────────────────────────────────────────

    /// Begin uploading `files` to `target_client_id` under `idea_id`.
    ///
    /// Files the target already holds are not streamed again; when every
    /// file is already there the session goes straight to `Active`.
    pub fn start(
        &mut self,
        files: Vec<OutgoingFile>,
        target_client_id: &str,
        idea_id: &str,
        store: &mut ContentStore,
    ) -> Result<SenderOutcome> {
        if self.state.is_busy() {
            bail!("An upload is already in progress");
        }
        if self.state == SessionState::Cancelling {
            bail!("Previous upload is still being cancelled");
        }
        if files.is_empty() {
            bail!("Nothing to upload");
        }

        let idea_id = if idea_id.is_empty() {
            warn!(event = "idea_defaulted", target = %target_client_id, "Upload without idea scope, using default idea");
            DEFAULT_IDEA_ID.to_string()
        } else {
            idea_id.to_string()
        };

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut paths = HashMap::new();
        for file in files {
            let record = store.register_local(&file.path)?;
            if !seen.insert(record.file_id.clone()) {
                continue;
            }
            let name = file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| record.file_id.clone());
            paths.insert(record.file_id.clone(), record.local_path.clone());
            entries.push(ManifestEntry {
                file_id: record.file_id.clone(),
                name,
                extension: record.extension.clone(),
                size_bytes: record.size_bytes,
                media_ids: file.media_ids,
            });
        }

        self.reset();
        self.target_client_id = target_client_id.to_string();
        self.idea_id = idea_id;
        self.file_set = entries.iter().map(|e| e.file_id.clone()).collect();
        self.last_action = Some(Instant::now());

        let pending: Vec<ManifestEntry> = entries
            .into_iter()
            .filter(|e| !store.is_delivered(&e.file_id, target_client_id))
            .collect();

        let mut actions = Vec::new();
        if pending.is_empty() {
            info!(event = "upload_skipped_synchronized", target = %target_client_id, files = self.file_set.len(), "All files already on target");
            self.set_state(SessionState::Active, &mut actions);
            actions.push(SenderAction::Notify(SenderEvent::AlreadySynchronized {
                target_client_id: target_client_id.to_string(),
            }));
            return Ok(SenderOutcome {
                actions,
                status: Some("Already synchronized".to_string()),
            });
        }

        let upload_id = Uuid::new_v4().to_string();
        self.total_bytes = pending.iter().map(|e| e.size_bytes).sum();
        self.progress = ProgressAggregator::new(pending.iter().map(|e| e.file_id.clone()));
        self.stop = SignalOfStop::new();
        self.upload_id = Some(upload_id.clone());
        self.manifest = pending;

        let stream_files: Vec<StreamFile> = self
            .manifest
            .iter()
            .filter_map(|e| {
                paths.get(&e.file_id).map(|p| StreamFile {
                    file_id: e.file_id.clone(),
                    path: p.clone(),
                    size_bytes: e.size_bytes,
                })
            })
            .collect();

        info!(event = "upload_started", upload_id = %upload_id, target = %target_client_id, idea_id = %self.idea_id, files = self.manifest.len(), total_bytes = self.total_bytes, "Upload started");

        self.set_state(SessionState::Streaming, &mut actions);
        actions.push(self.send(WireMessage::UploadStart(UploadStart {
            upload_id: upload_id.clone(),
            target_client_id: target_client_id.to_string(),
            idea_id: self.idea_id.clone(),
            files: self.manifest.clone(),
        })));
        actions.push(SenderAction::StartStream {
            upload_id,
            files: stream_files,
            chunk_size: self.config.chunk_size,
            stop: self.stop.clone(),
        });

        Ok(SenderOutcome {
            actions,
            status: Some(format!("Uploading {} file(s)...", self.manifest.len())),
        })
    }

    /// Single-button behaviour: cancel a running upload, unload an active
    /// one, or start a new upload. Repeated presses are rate limited.
    pub fn toggle(
        &mut self,
        files: Vec<OutgoingFile>,
        target_client_id: &str,
        idea_id: &str,
        store: &mut ContentStore,
        now: Instant,
    ) -> Result<SenderOutcome> {
        if let Some(last) = self.last_action {
            if now.saturating_duration_since(last) < MIN_ACTION_INTERVAL {
                debug!(event = "toggle_rate_limited", "Upload toggle ignored: too soon after previous action");
                return Ok(SenderOutcome::with_status("Please wait"));
            }
        }

        match self.state {
            SessionState::Streaming | SessionState::Finalizing => {
                self.last_action = Some(now);
                Ok(self.cancel(store))
            }
            SessionState::Cancelling => Ok(SenderOutcome::with_status("Cancellation in progress")),
            SessionState::Active => {
                let mut requested = Vec::new();
                for file in &files {
                    requested.push(crate::core::content_store::file_id_for(&file.path)?);
                }
                requested.sort();
                requested.dedup();
                let mut current = self.file_set.clone();
                current.sort();
                if requested == current && target_client_id == self.target_client_id {
                    self.last_action = Some(now);
                    Ok(self.unload(store))
                } else {
                    self.start(files, target_client_id, idea_id, store)
                }
            }
            SessionState::Idle => self.start(files, target_client_id, idea_id, store),
        }
    }

    // ── Streaming ────────────────────────────────────────────────────────

    /// A chunk came off the disk reader: forward it and account for it.
    pub fn on_chunk_read(
        &mut self,
        upload_id: &str,
        file_id: &str,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> SenderOutcome {
        if self.state != SessionState::Streaming || self.upload_id.as_deref() != Some(upload_id) {
            debug!(event = "stale_chunk_dropped", upload_id = %upload_id, file_id = %file_id, "Chunk from stale stream dropped");
            return SenderOutcome::empty();
        }

        let len = data.len() as u64;
        let mut actions = vec![self.send(WireMessage::UploadChunk(UploadChunk {
            upload_id: upload_id.to_string(),
            file_id: file_id.to_string(),
            chunk_index,
            data,
            idea_id: self.idea_id.clone(),
        }))];

        self.sent_bytes += len;
        let sent = self.sent_per_file.entry(file_id.to_string()).or_insert(0);
        *sent += len;
        let sent = *sent;
        let size = self
            .manifest
            .iter()
            .find(|e| e.file_id == file_id)
            .map(|e| e.size_bytes)
            .unwrap_or(0);

        if let Some(change) = self.progress.update_file_local(file_id, percent_of(sent, size)) {
            actions.push(SenderAction::Notify(file_event(change)));
        }
        if let Some(percent) = self
            .progress
            .update_local(percent_of(self.sent_bytes, self.total_bytes))
        {
            actions.push(SenderAction::Notify(self.progress_event(upload_id, percent)));
        }

        SenderOutcome {
            actions,
            status: None,
        }
    }

    /// The reader could not read a file; exclude its bytes from the total.
    pub fn on_file_failed(
        &mut self,
        upload_id: &str,
        file_id: &str,
        store: &mut ContentStore,
    ) -> SenderOutcome {
        if self.upload_id.as_deref() != Some(upload_id) {
            return SenderOutcome::empty();
        }
        let size = self
            .manifest
            .iter()
            .find(|e| e.file_id == file_id)
            .map(|e| e.size_bytes)
            .unwrap_or(0);
        let sent = self.sent_per_file.get(file_id).copied().unwrap_or(0);
        self.total_bytes = self.total_bytes.saturating_sub(size - sent.min(size));
        self.failed.insert(file_id.to_string());
        self.progress.drop_file(file_id);
        if self.optimistic.remove(file_id) {
            store.unmark_delivered(file_id, &self.target_client_id);
        }
        warn!(event = "upload_file_skipped", upload_id = %upload_id, file_id = %file_id, "File skipped after read failure");
        SenderOutcome::with_status(format!("Skipped unreadable file {}", file_id))
    }

    /// The reader reached the end of the last file.
    pub fn on_stream_finished(&mut self, upload_id: &str) -> SenderOutcome {
        if self.state != SessionState::Streaming || self.upload_id.as_deref() != Some(upload_id) {
            return SenderOutcome::empty();
        }
        let mut actions = Vec::new();
        self.set_state(SessionState::Finalizing, &mut actions);
        actions.push(self.send(WireMessage::UploadComplete(UploadComplete {
            upload_id: upload_id.to_string(),
            idea_id: self.idea_id.clone(),
        })));
        info!(event = "upload_stream_complete", upload_id = %upload_id, sent_bytes = self.sent_bytes, "All chunks sent, awaiting receiver confirmation");
        SenderOutcome {
            actions,
            status: Some("Finalizing...".to_string()),
        }
    }

    // ── Remote feedback ──────────────────────────────────────────────────

    pub fn on_upload_progress(
        &mut self,
        progress: &UploadProgress,
        store: &mut ContentStore,
    ) -> SenderOutcome {
        if self.upload_id.as_deref() != Some(progress.upload_id.as_str()) {
            debug!(event = "foreign_progress_ignored", upload_id = %progress.upload_id, "Progress for another upload ignored");
            return SenderOutcome::empty();
        }
        if self.cancel_requested || !self.state.is_busy() {
            return SenderOutcome::empty();
        }

        let mut actions = Vec::new();
        for file in &progress.per_file_progress {
            if let Some(change) = self.progress.update_file_remote(&file.file_id, file.percent) {
                actions.push(SenderAction::Notify(file_event(change)));
            }
        }
        for file_id in &progress.completed_file_ids {
            if self.failed.contains(file_id) {
                continue;
            }
            if let Some(change) = self.progress.update_file_remote(file_id, 100) {
                actions.push(SenderAction::Notify(file_event(change)));
            }
            if store.mark_delivered(file_id, &self.target_client_id) {
                self.optimistic.insert(file_id.clone());
            }
        }
        self.progress
            .set_remote_files_completed(progress.files_completed);
        if let Some(percent) = self.progress.update_remote(progress.percent) {
            actions.push(SenderAction::Notify(
                self.progress_event(&progress.upload_id, percent),
            ));
        }
        SenderOutcome {
            actions,
            status: None,
        }
    }

    /// The receiver confirmed every file of `upload_id`.
    pub fn on_upload_finished(&mut self, upload_id: &str, store: &mut ContentStore) -> SenderOutcome {
        if self.upload_id.as_deref() != Some(upload_id) || !self.state.is_busy() || self.cancel_requested
        {
            debug!(event = "finished_ignored", upload_id = %upload_id, state = ?self.state, "upload_finished ignored");
            return SenderOutcome::empty();
        }

        let mut delivered = 0usize;
        for entry in &self.manifest {
            if self.failed.contains(&entry.file_id) {
                continue;
            }
            store.mark_delivered(&entry.file_id, &self.target_client_id);
            delivered += 1;
        }
        self.optimistic.clear();

        let mut actions = Vec::new();
        for change in self.progress.confirm() {
            match change {
                ProgressChange::Overall(percent) => {
                    actions.push(SenderAction::Notify(self.progress_event(upload_id, percent)))
                }
                other => actions.push(SenderAction::Notify(file_event(other))),
            }
        }
        self.set_state(SessionState::Active, &mut actions);
        actions.push(SenderAction::Notify(SenderEvent::Finished {
            upload_id: upload_id.to_string(),
        }));
        info!(event = "upload_finished", upload_id = %upload_id, target = %self.target_client_id, files = delivered, skipped = self.failed.len(), "Receiver confirmed upload");

        SenderOutcome {
            actions,
            status: Some("Upload complete".to_string()),
        }
    }

    // ── Cancel / unload ──────────────────────────────────────────────────

    /// Stop streaming after the current chunk and ask the receiver to drop
    /// everything it got so far.
    pub fn cancel(&mut self, store: &mut ContentStore) -> SenderOutcome {
        if !self.state.is_busy() {
            return SenderOutcome::empty();
        }
        let upload_id = self.upload_id.clone().unwrap_or_default();
        self.cancel_requested = true;
        self.stop.cancel();
        self.unmark_optimistic(store);

        let mut actions = Vec::new();
        self.set_state(SessionState::Cancelling, &mut actions);
        actions.push(self.send(WireMessage::UploadAbort(UploadAbort {
            upload_id: upload_id.clone(),
            reason: "cancelled".to_string(),
            idea_id: self.idea_id.clone(),
        })));
        actions.push(self.send(WireMessage::RemoveAllFiles(RemoveAllFiles {
            target_client_id: self.target_client_id.clone(),
            idea_id: self.idea_id.clone(),
        })));
        actions.push(self.arm_fallback());

        info!(event = "upload_cancelled", upload_id = %upload_id, sent_bytes = self.sent_bytes, "Upload cancelled by user");
        SenderOutcome {
            actions,
            status: Some("Cancelling...".to_string()),
        }
    }

    /// Remove a delivered file set from the target again.
    pub fn unload(&mut self, store: &mut ContentStore) -> SenderOutcome {
        if self.state != SessionState::Active {
            return SenderOutcome::empty();
        }
        for file_id in &self.file_set {
            store.unmark_delivered(file_id, &self.target_client_id);
        }
        self.optimistic.clear();

        let mut actions = Vec::new();
        self.set_state(SessionState::Cancelling, &mut actions);
        actions.push(self.send(WireMessage::RemoveAllFiles(RemoveAllFiles {
            target_client_id: self.target_client_id.clone(),
            idea_id: self.idea_id.clone(),
        })));
        actions.push(self.arm_fallback());

        info!(event = "upload_unloaded", target = %self.target_client_id, files = self.file_set.len(), "Unloading files from target");
        SenderOutcome {
            actions,
            status: Some("Unloading...".to_string()),
        }
    }

    fn arm_fallback(&mut self) -> SenderAction {
        let token = Uuid::new_v4().to_string();
        self.cleanup_token = Some(token.clone());
        SenderAction::ArmCancelFallback {
            token,
            delay: self.config.cancel_fallback,
        }
    }

    /// `all_files_removed` from the target.
    pub fn on_all_files_removed(&mut self, from: &str) -> SenderOutcome {
        if self.state != SessionState::Cancelling || from != self.target_client_id {
            return SenderOutcome::empty();
        }
        self.finish_cleanup(ClearReason::Acknowledged)
    }

    /// The fallback timer fired; reset unless an ack already did.
    pub fn on_cancel_fallback(&mut self, token: &str) -> SenderOutcome {
        if self.state != SessionState::Cancelling || self.cleanup_token.as_deref() != Some(token) {
            return SenderOutcome::empty();
        }
        warn!(event = "cancel_fallback_fired", target = %self.target_client_id, "No removal acknowledgment, forcing local reset");
        self.finish_cleanup(ClearReason::Forced)
    }

    fn finish_cleanup(&mut self, reason: ClearReason) -> SenderOutcome {
        self.reset();
        let mut actions = vec![SenderAction::Notify(SenderEvent::RemoteCleared { reason })];
        actions.push(SenderAction::Notify(SenderEvent::StateChanged(
            SessionState::Idle,
        )));
        SenderOutcome {
            actions,
            status: Some("Remote files removed".to_string()),
        }
    }

    /// The link to `peer_id` dropped: unwind immediately, no ack expected.
    pub fn on_connection_lost(&mut self, peer_id: &str, store: &mut ContentStore) -> SenderOutcome {
        if self.state == SessionState::Idle || peer_id != self.target_client_id {
            return SenderOutcome::empty();
        }
        warn!(event = "upload_connection_lost", target = %peer_id, state = ?self.state, "Connection lost, resetting transfer session");
        self.stop.cancel();
        self.unmark_optimistic(store);
        self.reset();
        SenderOutcome {
            actions: vec![SenderAction::Notify(SenderEvent::StateChanged(
                SessionState::Idle,
            ))],
            status: Some("Connection lost".to_string()),
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn unmark_optimistic(&mut self, store: &mut ContentStore) {
        for file_id in self.optimistic.drain() {
            store.unmark_delivered(&file_id, &self.target_client_id);
        }
    }

    fn progress_event(&self, upload_id: &str, percent: u8) -> SenderEvent {
        SenderEvent::Progress {
            upload_id: upload_id.to_string(),
            percent,
            files_completed: self.progress.files_completed(),
            total_files: self.progress.total_files(),
        }
    }

    fn reset(&mut self) {
        self.stop.cancel();
        self.state = SessionState::Idle;
        self.upload_id = None;
        self.manifest.clear();
        self.file_set.clear();
        self.sent_per_file.clear();
        self.failed.clear();
        self.sent_bytes = 0;
        self.total_bytes = 0;
        self.progress = ProgressAggregator::default();
        self.cancel_requested = false;
        self.optimistic.clear();
        self.cleanup_token = None;
    }
}

fn file_event(change: ProgressChange) -> SenderEvent {
    match change {
        ProgressChange::File { file_id, percent } => SenderEvent::FileProgress { file_id, percent },
        ProgressChange::Overall(percent) => SenderEvent::Progress {
            upload_id: String::new(),
            percent,
            files_completed: 0,
            total_files: 0,
        },
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::manifest::FileProgress;
    use std::path::Path;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("scenecast_test")
            .join("sender")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    fn session() -> TransferSession {
        TransferSession::new(SenderConfig {
            chunk_size: 4,
            cancel_fallback: Duration::from_millis(50),
            bulk_channel: false,
        })
    }

    fn sent_messages(outcome: &SenderOutcome) -> Vec<&WireMessage> {
        outcome
            .actions
            .iter()
            .filter_map(|a| match a {
                SenderAction::Send { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn two_files(dir: &Path) -> Vec<OutgoingFile> {
        let big = dir.join("big.mp4");
        let tiny = dir.join("tiny.txt");
        std::fs::write(&big, vec![9u8; 10]).unwrap();
        std::fs::write(&tiny, vec![1u8; 1]).unwrap();
        vec![OutgoingFile::new(big), OutgoingFile::new(tiny)]
    }

    #[test]
    fn start_announces_manifest_and_streams() {
        let dir = test_dir("start");
        let mut store = ContentStore::new();
        let mut s = session();

        let outcome = s.start(two_files(&dir), "C", "I1", &mut store).unwrap();
        assert_eq!(s.state(), SessionState::Streaming);

        let msgs = sent_messages(&outcome);
        match msgs[0] {
            WireMessage::UploadStart(start) => {
                assert_eq!(start.files.len(), 2);
                assert_eq!(start.idea_id, "I1");
                assert_eq!(start.target_client_id, "C");
                assert_eq!(start.files[0].extension, "mp4");
            }
            other => panic!("unexpected {:?}", other),
        }
        let stream = outcome
            .actions
            .iter()
            .find_map(|a| match a {
                SenderAction::StartStream { files, chunk_size, .. } => Some((files.len(), *chunk_size)),
                _ => None,
            })
            .unwrap();
        assert_eq!(stream, (2, 4));

        cleanup(&dir);
    }

    #[test]
    fn empty_idea_uses_default_sentinel() {
        let dir = test_dir("default_idea");
        let mut store = ContentStore::new();
        let mut s = session();
        let outcome = s.start(two_files(&dir), "C", "", &mut store).unwrap();
        match sent_messages(&outcome)[0] {
            WireMessage::UploadStart(start) => assert_eq!(start.idea_id, DEFAULT_IDEA_ID),
            other => panic!("unexpected {:?}", other),
        }
        cleanup(&dir);
    }

    #[test]
    fn second_start_is_rejected_while_streaming() {
        let dir = test_dir("reject");
        let mut store = ContentStore::new();
        let mut s = session();
        s.start(two_files(&dir), "C", "I1", &mut store).unwrap();
        assert!(s.start(two_files(&dir), "C", "I1", &mut store).is_err());
        cleanup(&dir);
    }

    #[test]
    fn delivered_files_are_not_resent() {
        let dir = test_dir("dedup");
        let mut store = ContentStore::new();
        let files = two_files(&dir);
        for f in &files {
            let record = store.register_local(&f.path).unwrap();
            store.mark_delivered(&record.file_id, "C");
        }

        let mut s = session();
        let outcome = s.start(files, "C", "I1", &mut store).unwrap();
        assert!(sent_messages(&outcome).is_empty());
        assert!(outcome.actions.iter().any(|a| matches!(
            a,
            SenderAction::Notify(SenderEvent::AlreadySynchronized { .. })
        )));
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.sent_bytes(), 0);

        cleanup(&dir);
    }

    #[test]
    fn full_upload_marks_delivered_only_after_remote_confirmation() {
        let dir = test_dir("full");
        let mut store = ContentStore::new();
        let mut s = session();
        s.start(two_files(&dir), "C", "I1", &mut store).unwrap();
        let upload_id = s.upload_id().unwrap().to_string();
        let ids: Vec<String> = s.manifest.iter().map(|e| e.file_id.clone()).collect();

        let mut chunk_count = 0;
        for (i, len) in [4usize, 4, 2].iter().enumerate() {
            let out = s.on_chunk_read(&upload_id, &ids[0], i as u32, vec![0; *len]);
            chunk_count += sent_messages(&out).len();
        }
        let out = s.on_chunk_read(&upload_id, &ids[1], 0, vec![0; 1]);
        chunk_count += sent_messages(&out).len();
        assert_eq!(chunk_count, 4);
        assert_eq!(s.sent_bytes(), 11);
        assert_eq!(s.overall_percent(), 99);

        let out = s.on_stream_finished(&upload_id);
        assert!(matches!(sent_messages(&out)[0], WireMessage::UploadComplete(_)));
        assert_eq!(s.state(), SessionState::Finalizing);
        assert!(!store.is_delivered(&ids[0], "C"));

        s.on_upload_finished("some-other-upload", &mut store);
        assert_eq!(s.state(), SessionState::Finalizing);

        s.on_upload_finished(&upload_id, &mut store);
        assert_eq!(s.state(), SessionState::Active);
        assert!(store.is_delivered(&ids[0], "C"));
        assert!(store.is_delivered(&ids[1], "C"));
        assert_eq!(s.overall_percent(), 100);

        cleanup(&dir);
    }

    #[test]
    fn unreadable_file_is_not_marked_delivered_and_is_resent() {
        let dir = test_dir("unreadable");
        let mut store = ContentStore::new();
        let mut s = session();
        let files = two_files(&dir);
        s.start(files.clone(), "C", "I1", &mut store).unwrap();
        let upload_id = s.upload_id().unwrap().to_string();
        let ids: Vec<String> = s.manifest.iter().map(|e| e.file_id.clone()).collect();

        for (i, len) in [4usize, 4, 2].iter().enumerate() {
            s.on_chunk_read(&upload_id, &ids[0], i as u32, vec![0; *len]);
        }
        let out = s.on_file_failed(&upload_id, &ids[1], &mut store);
        assert!(out.status.is_some());
        assert_eq!(s.progress.total_files(), 1);

        s.on_stream_finished(&upload_id);
        s.on_upload_progress(
            &UploadProgress {
                upload_id: upload_id.clone(),
                percent: 100,
                files_completed: 1,
                total_files: 2,
                completed_file_ids: vec![ids[0].clone(), ids[1].clone()],
                per_file_progress: vec![],
            },
            &mut store,
        );
        s.on_upload_finished(&upload_id, &mut store);
        assert_eq!(s.state(), SessionState::Active);
        assert!(store.is_delivered(&ids[0], "C"));
        assert!(!store.is_delivered(&ids[1], "C"));

        let out = s.start(files, "C", "I1", &mut store).unwrap();
        match sent_messages(&out)[0] {
            WireMessage::UploadStart(start) => {
                assert_eq!(start.files.len(), 1);
                assert_eq!(start.files[0].file_id, ids[1]);
            }
            other => panic!("unexpected {:?}", other),
        }

        cleanup(&dir);
    }

    #[test]
    fn foreign_progress_is_ignored() {
        let dir = test_dir("foreign");
        let mut store = ContentStore::new();
        let mut s = session();
        s.start(two_files(&dir), "C", "I1", &mut store).unwrap();

        let out = s.on_upload_progress(
            &UploadProgress {
                upload_id: "nope".into(),
                percent: 80,
                files_completed: 1,
                total_files: 2,
                completed_file_ids: vec![],
                per_file_progress: vec![],
            },
            &mut store,
        );
        assert!(out.actions.is_empty());
        assert_eq!(s.overall_percent(), 0);

        cleanup(&dir);
    }

    #[test]
    fn cancel_sends_abort_and_removal_then_ack_resets_once() {
        let dir = test_dir("cancel_ack");
        let mut store = ContentStore::new();
        let mut s = session();
        s.start(two_files(&dir), "C", "I1", &mut store).unwrap();
        let upload_id = s.upload_id().unwrap().to_string();
        let first = s.manifest[0].file_id.clone();

        s.on_upload_progress(
            &UploadProgress {
                upload_id: upload_id.clone(),
                percent: 50,
                files_completed: 1,
                total_files: 2,
                completed_file_ids: vec![first.clone()],
                per_file_progress: vec![FileProgress {
                    file_id: first.clone(),
                    percent: 100,
                }],
            },
            &mut store,
        );
        assert!(store.is_delivered(&first, "C"));

        let out = s.cancel(&mut store);
        let msgs = sent_messages(&out);
        assert!(matches!(msgs[0], WireMessage::UploadAbort(_)));
        assert!(matches!(msgs[1], WireMessage::RemoveAllFiles(_)));
        assert_eq!(s.state(), SessionState::Cancelling);
        assert!(!store.is_delivered(&first, "C"));

        let token = out
            .actions
            .iter()
            .find_map(|a| match a {
                SenderAction::ArmCancelFallback { token, .. } => Some(token.clone()),
                _ => None,
            })
            .unwrap();

        let ack = s.on_all_files_removed("C");
        assert!(ack.actions.iter().any(|a| matches!(
            a,
            SenderAction::Notify(SenderEvent::RemoteCleared {
                reason: ClearReason::Acknowledged
            })
        )));
        assert_eq!(s.state(), SessionState::Idle);

        assert!(s.on_cancel_fallback(&token).actions.is_empty());

        cleanup(&dir);
    }

    #[test]
    fn fallback_forces_reset_without_ack() {
        let dir = test_dir("cancel_fallback");
        let mut store = ContentStore::new();
        let mut s = session();
        s.start(two_files(&dir), "C", "I1", &mut store).unwrap();
        let out = s.cancel(&mut store);
        let token = out
            .actions
            .iter()
            .find_map(|a| match a {
                SenderAction::ArmCancelFallback { token, delay } => {
                    assert_eq!(*delay, Duration::from_millis(50));
                    Some(token.clone())
                }
                _ => None,
            })
            .unwrap();

        assert!(s.on_cancel_fallback("stale-token").actions.is_empty());
        let forced = s.on_cancel_fallback(&token);
        let cleared = forced
            .actions
            .iter()
            .filter(|a| matches!(a, SenderAction::Notify(SenderEvent::RemoteCleared { .. })))
            .count();
        assert_eq!(cleared, 1);
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.on_all_files_removed("C").actions.is_empty());

        cleanup(&dir);
    }

    #[test]
    fn connection_loss_unwinds_optimistic_marks() {
        let dir = test_dir("conn_lost");
        let mut store = ContentStore::new();
        let mut s = session();
        s.start(two_files(&dir), "C", "I1", &mut store).unwrap();
        let upload_id = s.upload_id().unwrap().to_string();
        let first = s.manifest[0].file_id.clone();
        s.on_upload_progress(
            &UploadProgress {
                upload_id,
                percent: 90,
                files_completed: 1,
                total_files: 2,
                completed_file_ids: vec![first.clone()],
                per_file_progress: vec![],
            },
            &mut store,
        );
        assert!(store.is_delivered(&first, "C"));

        assert!(s.on_connection_lost("someone-else", &mut store).actions.is_empty());
        s.on_connection_lost("C", &mut store);
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!store.is_delivered(&first, "C"));

        cleanup(&dir);
    }

    #[test]
    fn toggle_is_rate_limited_and_unloads_same_set() {
        let dir = test_dir("toggle");
        let mut store = ContentStore::new();
        let files = two_files(&dir);
        for f in &files {
            let record = store.register_local(&f.path).unwrap();
            store.mark_delivered(&record.file_id, "C");
        }
        let mut s = session();
        let t0 = Instant::now();
        s.toggle(files.clone(), "C", "I1", &mut store, t0).unwrap();
        assert_eq!(s.state(), SessionState::Active);

        let early = s.toggle(files.clone(), "C", "I1", &mut store, t0).unwrap();
        assert_eq!(early.status.as_deref(), Some("Please wait"));
        assert_eq!(s.state(), SessionState::Active);

        let later = t0 + MIN_ACTION_INTERVAL + Duration::from_millis(1);
        let out = s.toggle(files, "C", "I1", &mut store, later).unwrap();
        assert!(matches!(sent_messages(&out)[0], WireMessage::RemoveAllFiles(_)));
        assert_eq!(s.state(), SessionState::Cancelling);

        cleanup(&dir);
    }
}
