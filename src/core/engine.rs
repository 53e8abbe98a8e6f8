//! Engine: the single-consumer event loop that owns all core state.
//!
//! Every state machine (transfer session, ingest manager, scene director)
//! lives here and is only ever touched from this loop. Transport I/O,
//! the chunk reader, timers and the media backend run as their own tasks
//! and post [`LoopEvent`]s back; the engine feeds them to the state
//! machines and executes the declarative actions they return.
//!
//! ```text
//!  transport ─┐
//!  backend  ──┤   LoopEvent    ┌────────┐   actions   ┌── transport.send
//!  timers   ──┼──────────────► │ Engine │ ──────────► ├── backend commands
//!  commands ──┘                └────────┘             ├── timers (spawned sleeps)
//!  chunk stream ─(bounded)───────►  ▲                 └── EngineEvent observers
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::content_store::ContentStore;
use crate::core::pipeline::chunk::{spawn_chunk_stream, StreamEvent};
use crate::core::pipeline::receiver::IngestManager;
use crate::core::pipeline::sender::{
    OutgoingFile, SenderAction, SenderConfig, SenderEvent, SenderOutcome, TransferSession,
};
use crate::core::protocol::{
    RemoteSceneStart, RemoteSceneStop, RemoveAllFiles, SceneResult, WireMessage,
};
use crate::core::scene::backend::{BackendEvent, MediaBackend};
use crate::core::scene::descriptor::SceneDescriptor;
use crate::core::scene::director::{DirectorAction, SceneDirector, SceneEvent, SceneTimer};
use crate::core::transport::{Channel, Transport, TransportEvent};
use crate::utils::sos::SignalOfStop;

// ── Loop input ───────────────────────────────────────────────────────────────

/// Local requests, from the CLI drivers.
#[derive(Debug)]
pub enum Command {
    Push {
        files: Vec<OutgoingFile>,
        target: String,
        idea_id: String,
    },
    /// Upload button: start, cancel or unload depending on the session.
    Toggle {
        files: Vec<OutgoingFile>,
        target: String,
        idea_id: String,
    },
    CancelUpload,
    Unload,
    StartScene {
        target: String,
        scene: SceneDescriptor,
    },
    StopScene {
        target: String,
    },
    Clear {
        target: String,
        idea_id: String,
    },
}

#[derive(Debug)]
pub enum LoopEvent {
    Transport(TransportEvent),
    Backend(BackendEvent),
    SceneTimer { epoch: u64, timer: SceneTimer },
    CancelFallback { token: String },
    Command(Command),
}

/// What the engine reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PeerConnected { peer: String },
    PeerLost { peer: String },
    Upload(SenderEvent),
    Scene(SceneEvent),
    /// Scene replies received from a remote receiver.
    RemoteValidation { peer: String, result: SceneResult },
    RemoteLaunched { peer: String },
    RemoteStopped { peer: String, result: SceneResult },
    RemoteFilesRemoved { peer: String },
    Status(String),
}

/// Wrap a typed channel so its items land on the loop.
pub fn forward<T: Send + 'static>(
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    wrap: fn(T) -> LoopEvent,
) -> mpsc::UnboundedSender<T> {
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if loop_tx.send(wrap(item)).is_err() {
                break;
            }
        }
    });
    tx
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct EngineConfig {
    pub client_id: String,
    /// Receiver cache root (`<data_dir>/cache`).
    pub cache_root: PathBuf,
    pub sender: SenderConfig,
}

type ChunkStream = (mpsc::Receiver<StreamEvent>, JoinHandle<()>);

pub struct Engine {
    client_id: String,
    transport: Arc<dyn Transport>,
    backend: Box<dyn MediaBackend>,
    store: ContentStore,
    ingest: IngestManager,
    director: SceneDirector,
    session: TransferSession,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    events: mpsc::UnboundedSender<EngineEvent>,
    timers: HashMap<(u64, SceneTimer), JoinHandle<()>>,
    fallback: Option<JoinHandle<()>>,
    stream: Option<ChunkStream>,
}

async fn next_stream_event(stream: &mut Option<ChunkStream>) -> Option<StreamEvent> {
    match stream {
        Some((rx, _)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        backend: Box<dyn MediaBackend>,
        loop_tx: mpsc::UnboundedSender<LoopEvent>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            client_id: config.client_id,
            transport,
            backend,
            store: ContentStore::new(),
            ingest: IngestManager::new(config.cache_root),
            director: SceneDirector::new(),
            session: TransferSession::new(config.sender),
            loop_tx,
            events,
            timers: HashMap::new(),
            fallback: None,
            stream: None,
        }
    }

    /// Drain `rx` until the stop signal fires or every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LoopEvent>, sos: SignalOfStop) -> Result<()> {
        info!(event = "engine_started", client_id = %self.client_id, "Engine running");
        loop {
            tokio::select! {
                biased;
                _ = sos.wait() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                chunk = next_stream_event(&mut self.stream), if self.stream.is_some() => match chunk {
                    Some(chunk) => self.on_stream_event(chunk),
                    None => self.stream = None,
                },
            }
        }
        self.shutdown();
        info!(event = "engine_stopped", "Engine stopped");
        Ok(())
    }

    fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        if let Some(handle) = self.fallback.take() {
            handle.abort();
        }
        if let Some((_, handle)) = self.stream.take() {
            handle.abort();
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, to: &str, channel: Channel, message: &WireMessage) {
        debug!(event = "message_out", to = %to, kind = message.kind(), channel = ?channel, "Sending message");
        if let Err(e) = self.transport.send(to, channel, message) {
            warn!(event = "send_failure", to = %to, kind = message.kind(), error = %e, "Message not sent");
        }
    }

    async fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Transport(TransportEvent::Connected { peer, channel }) => {
                if channel == Channel::Control {
                    self.emit(EngineEvent::PeerConnected { peer });
                }
            }
            LoopEvent::Transport(TransportEvent::Message { peer, message, .. }) => {
                self.dispatch(&peer, message).await;
            }
            LoopEvent::Transport(TransportEvent::Disconnected { peer }) => {
                self.on_connection_lost(&peer).await;
            }
            LoopEvent::Backend(event) => {
                let actions = self.director.on_backend_event(event);
                self.execute_scene(actions);
            }
            LoopEvent::SceneTimer { epoch, timer } => {
                self.timers.remove(&(epoch, timer.clone()));
                let actions = self.director.on_timer(epoch, timer, &mut self.store);
                self.execute_scene(actions);
            }
            LoopEvent::CancelFallback { token } => {
                self.fallback = None;
                let outcome = self.session.on_cancel_fallback(&token);
                self.execute_upload(outcome);
            }
            LoopEvent::Command(command) => self.on_command(command),
        }
    }

    // ── Incoming messages ────────────────────────────────────────────────

    async fn dispatch(&mut self, peer: &str, message: WireMessage) {
        debug!(event = "message_in", from = %peer, kind = message.kind(), "Message received");
        let replies = match message {
            WireMessage::UploadStart(start) => {
                self.ingest.on_upload_start(peer, start, &mut self.store).await
            }
            WireMessage::UploadChunk(chunk) => self.ingest.on_upload_chunk(peer, chunk).await,
            WireMessage::UploadComplete(complete) => {
                self.ingest.on_upload_complete(complete, &mut self.store).await
            }
            WireMessage::UploadAbort(abort) => {
                self.ingest.on_upload_abort(peer, abort, &mut self.store).await
            }
            WireMessage::RemoveAllFiles(request) => {
                self.ingest
                    .on_remove_all_files(peer, request, &mut self.store)
                    .await
            }
            WireMessage::RemoveFile(request) => {
                self.ingest.on_remove_file(peer, request, &mut self.store).await
            }
            WireMessage::UploadProgress(progress) => {
                let outcome = self.session.on_upload_progress(&progress, &mut self.store);
                self.execute_upload(outcome);
                Vec::new()
            }
            WireMessage::UploadFinished(finished) => {
                let outcome = self
                    .session
                    .on_upload_finished(&finished.upload_id, &mut self.store);
                self.execute_upload(outcome);
                Vec::new()
            }
            WireMessage::AllFilesRemoved => {
                let outcome = self.session.on_all_files_removed(peer);
                self.execute_upload(outcome);
                self.emit(EngineEvent::RemoteFilesRemoved {
                    peer: peer.to_string(),
                });
                Vec::new()
            }
            WireMessage::RemoteSceneStart(start) => {
                let actions = self
                    .director
                    .on_scene_start(peer, start.scene, &mut self.store);
                self.execute_scene(actions);
                Vec::new()
            }
            WireMessage::RemoteSceneStop(_) => {
                let actions = self.director.on_scene_stop(peer, &mut self.store);
                self.execute_scene(actions);
                Vec::new()
            }
            WireMessage::RemoteSceneValidation(result) => {
                self.emit(EngineEvent::RemoteValidation {
                    peer: peer.to_string(),
                    result,
                });
                Vec::new()
            }
            WireMessage::RemoteSceneLaunched => {
                self.emit(EngineEvent::RemoteLaunched {
                    peer: peer.to_string(),
                });
                Vec::new()
            }
            WireMessage::RemoteSceneStopped(result) => {
                self.emit(EngineEvent::RemoteStopped {
                    peer: peer.to_string(),
                    result,
                });
                Vec::new()
            }
        };
        for reply in replies {
            self.send(peer, Channel::Control, &reply);
        }
    }

    async fn on_connection_lost(&mut self, peer: &str) {
        info!(event = "peer_lost", peer = %peer, "Peer disconnected");
        self.ingest.on_connection_lost(peer, &mut self.store).await;

        let outcome = self.session.on_connection_lost(peer, &mut self.store);
        if !outcome.actions.is_empty() {
            if let Some((_, handle)) = self.stream.take() {
                handle.abort();
            }
            if let Some(handle) = self.fallback.take() {
                handle.abort();
            }
        }
        self.execute_upload(outcome);
        // The receiver wipes its cache for us on disconnect.
        let forgotten = self.store.forget_client(peer);
        if forgotten > 0 {
            debug!(event = "deliveries_forgotten", peer = %peer, files = forgotten, "Delivery marks dropped");
        }

        let actions = self.director.on_connection_lost(peer, &mut self.store);
        self.execute_scene(actions);
        self.emit(EngineEvent::PeerLost {
            peer: peer.to_string(),
        });
    }

    // ── Local commands ───────────────────────────────────────────────────

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Push {
                files,
                target,
                idea_id,
            } => match self.session.start(files, &target, &idea_id, &mut self.store) {
                Ok(outcome) => self.execute_upload(outcome),
                Err(e) => {
                    warn!(event = "upload_start_rejected", target = %target, error = %e, "Upload not started");
                    self.emit(EngineEvent::Status(format!("{:#}", e)));
                }
            },
            Command::Toggle {
                files,
                target,
                idea_id,
            } => {
                let toggled =
                    self.session
                        .toggle(files, &target, &idea_id, &mut self.store, Instant::now());
                match toggled {
                    Ok(outcome) => self.execute_upload(outcome),
                    Err(e) => self.emit(EngineEvent::Status(format!("{:#}", e))),
                }
            }
            Command::CancelUpload => {
                let outcome = self.session.cancel(&mut self.store);
                self.execute_upload(outcome);
            }
            Command::Unload => {
                let outcome = self.session.unload(&mut self.store);
                self.execute_upload(outcome);
            }
            Command::StartScene { target, scene } => {
                let message = WireMessage::RemoteSceneStart(RemoteSceneStart {
                    target_client_id: target.clone(),
                    scene,
                });
                self.send(&target, Channel::Control, &message);
            }
            Command::StopScene { target } => {
                let message = WireMessage::RemoteSceneStop(RemoteSceneStop {
                    target_client_id: target.clone(),
                });
                self.send(&target, Channel::Control, &message);
            }
            Command::Clear { target, idea_id } => {
                let message = WireMessage::RemoveAllFiles(RemoveAllFiles {
                    target_client_id: target.clone(),
                    idea_id,
                });
                self.send(&target, Channel::Control, &message);
            }
        }
    }

    // ── Upload side effects ──────────────────────────────────────────────

    fn on_stream_event(&mut self, event: StreamEvent) {
        let outcome = match event {
            StreamEvent::Chunk {
                upload_id,
                file_id,
                chunk_index,
                data,
            } => self
                .session
                .on_chunk_read(&upload_id, &file_id, chunk_index, data),
            StreamEvent::FileFailed {
                upload_id,
                file_id,
                error,
            } => {
                warn!(event = "upload_file_skipped", upload_id = %upload_id, file_id = %file_id, error = %error, "File skipped");
                self.session
                    .on_file_failed(&upload_id, &file_id, &mut self.store)
            }
            StreamEvent::Finished { upload_id } => {
                self.stream = None;
                self.session.on_stream_finished(&upload_id)
            }
            StreamEvent::Cancelled { upload_id } => {
                debug!(event = "chunk_stream_cancelled", upload_id = %upload_id, "Chunk stream stopped");
                self.stream = None;
                SenderOutcome::empty()
            }
        };
        self.execute_upload(outcome);
    }

    fn execute_upload(&mut self, outcome: SenderOutcome) {
        for action in outcome.actions {
            match action {
                SenderAction::Send {
                    to,
                    channel,
                    message,
                } => self.send(&to, channel, &message),
                SenderAction::StartStream {
                    upload_id,
                    files,
                    chunk_size,
                    stop,
                } => {
                    if let Some((_, previous)) = self.stream.take() {
                        previous.abort();
                    }
                    self.stream = Some(spawn_chunk_stream(upload_id, files, chunk_size, stop));
                }
                SenderAction::ArmCancelFallback { token, delay } => {
                    if let Some(previous) = self.fallback.take() {
                        previous.abort();
                    }
                    let tx = self.loop_tx.clone();
                    self.fallback = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(LoopEvent::CancelFallback { token });
                    }));
                }
                SenderAction::Notify(event) => self.emit(EngineEvent::Upload(event)),
            }
        }
        if let Some(status) = outcome.status {
            self.emit(EngineEvent::Status(status));
        }
    }

    // ── Scene side effects ───────────────────────────────────────────────

    fn execute_scene(&mut self, actions: Vec<DirectorAction>) {
        for action in actions {
            match action {
                DirectorAction::Send { to, message } => self.send(&to, Channel::Control, &message),
                DirectorAction::Player {
                    epoch,
                    media_id,
                    command,
                } => self.backend.player(epoch, &media_id, command),
                DirectorAction::Visual {
                    epoch,
                    media_id,
                    command,
                } => self.backend.visual(epoch, &media_id, command),
                DirectorAction::Screen(command) => self.backend.screen(command),
                DirectorAction::Arm {
                    epoch,
                    timer,
                    delay,
                } => self.arm_timer(epoch, timer, delay),
                DirectorAction::Disarm { epoch, timer } => {
                    if let Some(handle) = self.timers.remove(&(epoch, timer)) {
                        handle.abort();
                    }
                }
                DirectorAction::CancelAllTimers => {
                    let count = self.timers.len();
                    for (_, handle) in self.timers.drain() {
                        handle.abort();
                    }
                    debug!(event = "scene_timers_cancelled", count, "Scene timers cancelled");
                }
                DirectorAction::Notify(event) => self.emit(EngineEvent::Scene(event)),
            }
        }
    }

    /// Single-shot timer; re-arming the same key replaces the old one.
    fn arm_timer(&mut self, epoch: u64, timer: SceneTimer, delay: Duration) {
        let tx = self.loop_tx.clone();
        let fired = timer.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LoopEvent::SceneTimer {
                epoch,
                timer: fired,
            });
        });
        if let Some(previous) = self.timers.insert((epoch, timer), handle) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::manifest::ManifestEntry;
    use crate::core::protocol::{UploadChunk, UploadComplete, UploadStart};
    use crate::core::scene::backend::RecordingBackend;
    use crate::core::scene::clock::SimulatedBackend;
    use crate::core::scene::descriptor::{MediaItem, MediaKind, ScreenSpec, SpanSpec};
    use crate::core::transport::RecordingTransport;
    use std::path::Path;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("scenecast_test")
            .join("engine")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    struct Harness {
        engine: Engine,
        transport: Arc<RecordingTransport>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        _loop_rx: mpsc::UnboundedReceiver<LoopEvent>,
    }

    fn harness(cache_root: PathBuf) -> Harness {
        let transport = Arc::new(RecordingTransport::new());
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let engine = Engine::new(
            EngineConfig {
                client_id: "receiver".into(),
                cache_root,
                sender: SenderConfig::default(),
            },
            transport.clone(),
            Box::new(RecordingBackend::default()),
            loop_tx,
            events_tx,
        );
        Harness {
            engine,
            transport,
            events,
            _loop_rx: loop_rx,
        }
    }

    fn message(peer: &str, message: WireMessage) -> LoopEvent {
        LoopEvent::Transport(TransportEvent::Message {
            peer: peer.into(),
            channel: Channel::Control,
            message,
        })
    }

    fn text_scene() -> SceneDescriptor {
        SceneDescriptor {
            screens: vec![ScreenSpec {
                id: 0,
                width: 800,
                height: 600,
                primary: true,
            }],
            media: vec![MediaItem {
                media_id: "caption".into(),
                kind: MediaKind::Text,
                text: "hi".into(),
                spans: vec![SpanSpec {
                    screen_id: 0,
                    norm_x: 0.1,
                    norm_y: 0.1,
                    norm_w: 0.5,
                    norm_h: 0.2,
                }],
                ..MediaItem::default()
            }],
        }
    }

    #[tokio::test]
    async fn ingest_replies_go_back_to_the_sender() {
        let dir = test_dir("ingest");
        let mut h = harness(dir.clone());

        let start = UploadStart {
            upload_id: "u1".into(),
            target_client_id: "receiver".into(),
            idea_id: "I1".into(),
            files: vec![ManifestEntry {
                file_id: "f1".into(),
                name: "a.txt".into(),
                extension: "txt".into(),
                size_bytes: 3,
                media_ids: vec![],
            }],
        };
        h.engine.handle(message("S", WireMessage::UploadStart(start))).await;
        h.engine
            .handle(message(
                "S",
                WireMessage::UploadChunk(UploadChunk {
                    upload_id: "u1".into(),
                    file_id: "f1".into(),
                    chunk_index: 0,
                    data: b"abc".to_vec(),
                    idea_id: "I1".into(),
                }),
            ))
            .await;
        h.engine
            .handle(message(
                "S",
                WireMessage::UploadComplete(UploadComplete {
                    upload_id: "u1".into(),
                    idea_id: "I1".into(),
                }),
            ))
            .await;

        let sent = h.transport.take();
        assert!(sent.iter().all(|(to, channel, _)| to == "S" && *channel == Channel::Control));
        assert!(matches!(sent.last(), Some((_, _, WireMessage::UploadFinished(f))) if f.upload_id == "u1"));
        let path = h.engine.store.resolve_existing("f1").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
        cleanup(&dir);
    }

    #[tokio::test]
    async fn scene_start_is_answered_and_disconnect_tears_down() {
        let dir = test_dir("scene");
        let mut h = harness(dir.clone());

        h.engine
            .handle(message(
                "S",
                WireMessage::RemoteSceneStart(RemoteSceneStart {
                    target_client_id: "receiver".into(),
                    scene: text_scene(),
                }),
            ))
            .await;
        let sent: Vec<WireMessage> = h.transport.take().into_iter().map(|(_, _, m)| m).collect();
        assert_eq!(
            sent,
            vec![
                WireMessage::RemoteSceneValidation(SceneResult::ok()),
                WireMessage::RemoteSceneLaunched
            ]
        );
        // Only the ready timeout was armed and then disarmed.
        assert!(h.engine.timers.is_empty());

        h.engine
            .handle(LoopEvent::Transport(TransportEvent::Disconnected {
                peer: "S".into(),
            }))
            .await;
        // Cooldown is the only live timer.
        assert_eq!(h.engine.timers.len(), 1);
        assert!(h.engine.timers.keys().all(|(_, t)| *t == SceneTimer::Cooldown));

        let mut lost = false;
        while let Ok(event) = h.events.try_recv() {
            if event == (EngineEvent::PeerLost { peer: "S".into() }) {
                lost = true;
            }
        }
        assert!(lost);
        h.engine.shutdown();
        cleanup(&dir);
    }

    #[tokio::test]
    async fn stop_while_idle_still_answers() {
        let dir = test_dir("stop_idle");
        let mut h = harness(dir.clone());
        for _ in 0..2 {
            h.engine
                .handle(message(
                    "S",
                    WireMessage::RemoteSceneStop(RemoteSceneStop {
                        target_client_id: "receiver".into(),
                    }),
                ))
                .await;
        }
        let sent = h.transport.take();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, _, m)| *m == WireMessage::RemoteSceneStopped(SceneResult::ok())));
        assert!(h.engine.timers.is_empty());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn push_with_nothing_reports_status() {
        let dir = test_dir("push_empty");
        let mut h = harness(dir.clone());
        h.engine.on_command(Command::Push {
            files: vec![],
            target: "R".into(),
            idea_id: "I1".into(),
        });
        assert!(matches!(h.events.try_recv(), Ok(EngineEvent::Status(_))));
        assert!(h.transport.take().is_empty());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn toggle_starts_then_rate_limits() {
        let dir = test_dir("toggle");
        let file = dir.join("still.png");
        std::fs::write(&file, b"png").unwrap();
        let mut h = harness(dir.join("cache"));

        let toggle = || Command::Toggle {
            files: vec![OutgoingFile::new(&file)],
            target: "R".into(),
            idea_id: "I1".into(),
        };
        h.engine.on_command(toggle());
        let sent = h.transport.take();
        assert!(matches!(sent.first(), Some((to, _, WireMessage::UploadStart(_))) if to == "R"));

        // A second press right away is ignored.
        h.engine.on_command(toggle());
        assert!(h.transport.take().is_empty());
        h.engine.shutdown();
        cleanup(&dir);
    }

    #[tokio::test]
    async fn video_scene_launches_on_simulated_backend() {
        let dir = test_dir("video");
        let clip = dir.join("clip.mp4");
        std::fs::write(&clip, b"not really a video").unwrap();

        let transport = Arc::new(RecordingTransport::new());
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let backend_tx = forward(loop_tx.clone(), LoopEvent::Backend);
        let mut engine = Engine::new(
            EngineConfig {
                client_id: "receiver".into(),
                cache_root: dir.clone(),
                sender: SenderConfig::default(),
            },
            transport.clone(),
            Box::new(SimulatedBackend::new(backend_tx)),
            loop_tx.clone(),
            events_tx,
        );
        engine.store.register("f1", &clip);

        let mut scene = text_scene();
        scene.media = vec![MediaItem {
            media_id: "v".into(),
            file_id: "f1".into(),
            kind: MediaKind::Video,
            spans: scene.media[0].spans.clone(),
            auto_display: true,
            auto_play: true,
            start_position_ms: Some(2000),
            ..MediaItem::default()
        }];
        loop_tx
            .send(message(
                "S",
                WireMessage::RemoteSceneStart(RemoteSceneStart {
                    target_client_id: "receiver".into(),
                    scene,
                }),
            ))
            .unwrap();

        let sos = SignalOfStop::new();
        let run = tokio::spawn(engine.run(loop_rx, sos.clone()));

        let launched = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let EngineEvent::Scene(SceneEvent::Launched { .. }) = event {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(launched);

        sos.cancel();
        run.await.unwrap().unwrap();
        let sent: Vec<WireMessage> = transport.take().into_iter().map(|(_, _, m)| m).collect();
        assert!(sent.contains(&WireMessage::RemoteSceneLaunched));
        cleanup(&dir);
    }
}
