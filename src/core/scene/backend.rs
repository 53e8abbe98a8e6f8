//! Media backend: the rendering/playback collaborator of the scene engine.
//!
//! The scene state machines never touch players or windows directly. They
//! emit typed commands addressed by `(epoch, mediaId)`; a [`MediaBackend`]
//! carries them out and reports back through [`BackendEvent`]s posted onto
//! the event loop. Events keep the epoch they were produced under so the
//! director can discard anything from an older scene generation.

use std::path::PathBuf;

use crate::core::scene::descriptor::{PixelRect, ScreenSpec};

// ── Commands ─────────────────────────────────────────────────────────────────

/// Where decoded video frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRoute {
    /// Side sink used while priming and during decoder sync. Not visible.
    Priming,
    /// The visible spans.
    Display,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Load(PathBuf),
    Seek(i64),
    Play,
    Pause,
    SetVolume(f64),
    SetMuted(bool),
    RouteFrames(FrameRoute),
    /// Keep the last presented frame on screen while the player is idle.
    FreezeLastFrame,
    Release,
}

/// What a span shows.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanContent {
    Image,
    Video,
    Text {
        text: String,
        font_family: String,
        font_size: f64,
        bold: bool,
        italic: bool,
        color: String,
    },
}

/// One on-screen placement of a media item.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanPlacement {
    pub screen_id: i64,
    pub rect: PixelRect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VisualCommand {
    CreateSpans {
        content: SpanContent,
        spans: Vec<SpanPlacement>,
    },
    LoadImage(PathBuf),
    /// Put a decoded frame (by timestamp) on the spans without showing them.
    PresentFrame { timestamp_ms: i64 },
    Show { opacity: f64 },
    FadeIn { duration_ms: u64, opacity: f64 },
    FadeOut { duration_ms: u64 },
    Hide,
    ReleasePrimedFrame,
    Destroy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScreenCommand {
    Create(ScreenSpec),
    Destroy(i64),
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// The source opened. `duration_ms` is 0 for still images.
    Loaded { duration_ms: i64 },
    LoadFailed { error: String },
    /// A decoded frame reached `route`. `timestamp_ms` is `None` when the
    /// decoder did not stamp it; `position_ms` is the player position.
    Frame {
        route: FrameRoute,
        timestamp_ms: Option<i64>,
        position_ms: i64,
    },
    Position(i64),
    EndOfMedia,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendEvent {
    pub epoch: u64,
    pub media_id: String,
    pub event: MediaEvent,
}

// ── Backend trait ────────────────────────────────────────────────────────────

/// Executes scene commands. Implementations post [`BackendEvent`]s back to
/// the event loop asynchronously; no method may block.
pub trait MediaBackend: Send {
    fn player(&mut self, epoch: u64, media_id: &str, command: PlayerCommand);
    fn visual(&mut self, epoch: u64, media_id: &str, command: VisualCommand);
    fn screen(&mut self, command: ScreenCommand);
}

// ── Recording backend ────────────────────────────────────────────────────────

/// A backend call, as recorded by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Player(u64, String, PlayerCommand),
    Visual(u64, String, VisualCommand),
    Screen(ScreenCommand),
}

/// Backend that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub calls: Vec<BackendCall>,
}

impl MediaBackend for RecordingBackend {
    fn player(&mut self, epoch: u64, media_id: &str, command: PlayerCommand) {
        self.calls
            .push(BackendCall::Player(epoch, media_id.to_string(), command));
    }

    fn visual(&mut self, epoch: u64, media_id: &str, command: VisualCommand) {
        self.calls
            .push(BackendCall::Visual(epoch, media_id.to_string(), command));
    }

    fn screen(&mut self, command: ScreenCommand) {
        self.calls.push(BackendCall::Screen(command));
    }
}
