//! Simulated playback backend.
//!
//! Runs a headless "player" task per video item: it advances a position
//! clock while playing, decodes a frame every tick through the
//! [`FrameGate`], and posts [`BackendEvent`]s back to the event loop.
//! Visual commands only update an in-memory surface model. This is what
//! `scenecast serve` drives; it is also what the engine tests run against.

use std::collections::HashMap;
use std::future::pending;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::core::config::{SIMULATED_FRAME_INTERVAL, SIMULATED_VIDEO_DURATION_MS};
use crate::core::scene::backend::{
    BackendEvent, FrameRoute, MediaBackend, MediaEvent, PlayerCommand, ScreenCommand,
    VisualCommand,
};
use crate::core::scene::descriptor::ScreenSpec;
use crate::core::scene::frames::{spawn_conversion, ConvertedFrame, FrameGate, RawFrame};

const FRAME_WIDTH: u32 = 64;
const FRAME_HEIGHT: u32 = 36;

type MediaKey = (u64, String);

/// What a span currently shows, as far as the backend knows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Surface {
    pub visible: bool,
    pub opacity: f64,
    /// Timestamps handed to `PresentFrame`, in order.
    pub presented: Vec<i64>,
    pub spans: usize,
}

pub struct SimulatedBackend {
    events: mpsc::UnboundedSender<BackendEvent>,
    video_duration_ms: i64,
    players: HashMap<MediaKey, mpsc::UnboundedSender<PlayerCommand>>,
    surfaces: HashMap<MediaKey, Surface>,
    screens: HashMap<i64, ScreenSpec>,
}

impl SimulatedBackend {
    pub fn new(events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self::with_duration(events, SIMULATED_VIDEO_DURATION_MS)
    }

    /// Backend whose videos last `video_duration_ms`.
    pub fn with_duration(events: mpsc::UnboundedSender<BackendEvent>, video_duration_ms: i64) -> Self {
        Self {
            events,
            video_duration_ms,
            players: HashMap::new(),
            surfaces: HashMap::new(),
            screens: HashMap::new(),
        }
    }

    pub fn surface(&self, epoch: u64, media_id: &str) -> Option<&Surface> {
        self.surfaces.get(&(epoch, media_id.to_string()))
    }

    pub fn screen_count(&self) -> usize {
        self.screens.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    fn spawn_player(&mut self, epoch: u64, media_id: &str) -> mpsc::UnboundedSender<PlayerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let player = Player {
            epoch,
            media_id: media_id.to_string(),
            duration_ms: self.video_duration_ms,
            events: self.events.clone(),
            loaded: false,
            playing: false,
            position_ms: 0,
            route: FrameRoute::Display,
            gate: FrameGate::new(),
            in_flight: None,
        };
        tokio::spawn(player.run(rx));
        tx
    }
}

impl MediaBackend for SimulatedBackend {
    fn player(&mut self, epoch: u64, media_id: &str, command: PlayerCommand) {
        let key = (epoch, media_id.to_string());
        let release = matches!(command, PlayerCommand::Release);
        let tx = match self.players.get(&key) {
            Some(tx) => tx.clone(),
            None if release => return,
            None => {
                let tx = self.spawn_player(epoch, media_id);
                self.players.insert(key.clone(), tx.clone());
                tx
            }
        };
        if tx.send(command).is_err() {
            debug!(event = "player_gone", epoch, media_id = %media_id, "Player task already exited");
        }
        if release {
            self.players.remove(&key);
        }
    }

    fn visual(&mut self, epoch: u64, media_id: &str, command: VisualCommand) {
        let key = (epoch, media_id.to_string());
        trace!(event = "visual_command", epoch, media_id = %media_id, command = ?command, "Visual command");
        if let VisualCommand::Destroy = command {
            self.surfaces.remove(&key);
            return;
        }
        let surface = self.surfaces.entry(key).or_default();
        match command {
            VisualCommand::CreateSpans { spans, .. } => surface.spans = spans.len(),
            VisualCommand::LoadImage(path) => {
                let events = self.events.clone();
                let media_id = media_id.to_string();
                tokio::spawn(async move {
                    let event = match tokio::fs::metadata(&path).await {
                        Ok(_) => MediaEvent::Loaded { duration_ms: 0 },
                        Err(e) => MediaEvent::LoadFailed {
                            error: format!("{}: {}", path.display(), e),
                        },
                    };
                    let _ = events.send(BackendEvent {
                        epoch,
                        media_id,
                        event,
                    });
                });
            }
            VisualCommand::PresentFrame { timestamp_ms } => surface.presented.push(timestamp_ms),
            VisualCommand::Show { opacity } | VisualCommand::FadeIn { opacity, .. } => {
                surface.visible = true;
                surface.opacity = opacity;
            }
            VisualCommand::FadeOut { .. } | VisualCommand::Hide => {
                surface.visible = false;
                surface.opacity = 0.0;
            }
            VisualCommand::ReleasePrimedFrame | VisualCommand::Destroy => {}
        }
    }

    fn screen(&mut self, command: ScreenCommand) {
        match command {
            ScreenCommand::Create(spec) => {
                debug!(event = "screen_created", screen_id = spec.id, width = spec.width, height = spec.height, "Screen container created");
                self.screens.insert(spec.id, spec);
            }
            ScreenCommand::Destroy(id) => {
                if self.screens.remove(&id).is_some() {
                    debug!(event = "screen_destroyed", screen_id = id, "Screen container destroyed");
                }
            }
        }
    }
}

// ── Player task ──────────────────────────────────────────────────────────────

struct Player {
    epoch: u64,
    media_id: String,
    duration_ms: i64,
    events: mpsc::UnboundedSender<BackendEvent>,
    loaded: bool,
    playing: bool,
    position_ms: i64,
    route: FrameRoute,
    gate: FrameGate,
    in_flight: Option<JoinHandle<ConvertedFrame>>,
}

async fn next_conversion(
    slot: &mut Option<JoinHandle<ConvertedFrame>>,
) -> Result<ConvertedFrame, tokio::task::JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

impl Player {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PlayerCommand>) {
        let mut ticker = tokio::time::interval(SIMULATED_FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let alive = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(PlayerCommand::Release) | None => false,
                    Some(cmd) => self.handle(cmd, &mut ticker).await,
                },
                _ = ticker.tick(), if self.playing => self.advance(),
                done = next_conversion(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    self.on_converted(done)
                }
            };
            if !alive {
                break;
            }
        }

        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
        debug!(event = "player_released", epoch = self.epoch, media_id = %self.media_id, dropped_frames = self.gate.dropped(), "Player released");
    }

    fn emit(&self, event: MediaEvent) -> bool {
        self.events
            .send(BackendEvent {
                epoch: self.epoch,
                media_id: self.media_id.clone(),
                event,
            })
            .is_ok()
    }

    async fn handle(&mut self, command: PlayerCommand, ticker: &mut tokio::time::Interval) -> bool {
        match command {
            PlayerCommand::Load(path) => return self.load(path).await,
            PlayerCommand::Seek(ms) => {
                if !self.loaded {
                    return true;
                }
                self.position_ms = ms.clamp(0, self.duration_ms);
                self.gate.reset();
                self.decode();
            }
            PlayerCommand::Play => {
                if self.loaded && self.position_ms < self.duration_ms {
                    self.playing = true;
                    ticker.reset();
                }
            }
            PlayerCommand::Pause => self.playing = false,
            PlayerCommand::SetVolume(volume) => {
                trace!(event = "player_volume", media_id = %self.media_id, volume, "Volume set");
            }
            PlayerCommand::SetMuted(muted) => {
                trace!(event = "player_muted", media_id = %self.media_id, muted, "Mute set");
            }
            PlayerCommand::RouteFrames(route) => {
                self.route = route;
                self.gate.reset();
            }
            PlayerCommand::FreezeLastFrame => {
                debug!(event = "player_frozen", media_id = %self.media_id, position = self.position_ms, "Holding last frame");
            }
            PlayerCommand::Release => return false,
        }
        true
    }

    async fn load(&mut self, path: PathBuf) -> bool {
        let event = match tokio::fs::metadata(&path).await {
            Ok(_) => {
                self.loaded = true;
                self.position_ms = 0;
                MediaEvent::Loaded {
                    duration_ms: self.duration_ms,
                }
            }
            Err(e) => {
                warn!(event = "player_load_failure", media_id = %self.media_id, path = %path.display(), error = %e, "Cannot open media");
                MediaEvent::LoadFailed {
                    error: e.to_string(),
                }
            }
        };
        self.emit(event)
    }

    fn advance(&mut self) -> bool {
        self.position_ms += SIMULATED_FRAME_INTERVAL.as_millis() as i64;
        if self.position_ms >= self.duration_ms {
            self.position_ms = self.duration_ms;
            self.playing = false;
            return self.emit(MediaEvent::EndOfMedia);
        }
        self.decode();
        self.emit(MediaEvent::Position(self.position_ms))
    }

    /// Push a frame at the current position through the gate.
    fn decode(&mut self) {
        let frame = RawFrame {
            route: self.route,
            timestamp_ms: Some(self.position_ms),
            position_ms: self.position_ms,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
        };
        if let Some(frame) = self.gate.submit(frame) {
            self.in_flight = Some(spawn_conversion(frame));
        }
    }

    fn on_converted(&mut self, done: Result<ConvertedFrame, tokio::task::JoinError>) -> bool {
        let alive = match done {
            Ok(converted) => {
                trace!(event = "frame_converted", media_id = %self.media_id, ts = ?converted.frame.timestamp_ms, digest = %converted.digest, "Frame converted");
                self.emit(MediaEvent::Frame {
                    route: converted.frame.route,
                    timestamp_ms: converted.frame.timestamp_ms,
                    position_ms: converted.frame.position_ms,
                })
            }
            Err(e) => {
                warn!(event = "frame_conversion_failure", media_id = %self.media_id, error = %e, "Frame conversion failed");
                true
            }
        };
        if let Some(next) = self.gate.complete() {
            self.in_flight = Some(spawn_conversion(next));
        }
        alive
    }
}
