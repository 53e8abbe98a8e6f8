//! Centralized configuration constants for scenecast.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format names (message type tags, JSON field
//! names) stay in `core::protocol`.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Size of one `upload_chunk` payload before base64 encoding (128 KiB).
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Chunks the disk reader may prefetch ahead of the event loop.
/// Bounded so a slow transport applies backpressure to disk reads.
pub const CHUNK_READ_AHEAD: usize = 8;

/// The chunk reader yields to the scheduler after this many chunks so the
/// loop keeps servicing cancellation and inbound messages.
pub const CHUNK_YIELD_EVERY: u32 = 4;

/// How long a cancelled or unloading sender waits for `all_files_removed`
/// before force-resetting its local state.
pub const CANCEL_FALLBACK: Duration = Duration::from_secs(3);

/// Minimum interval between two user-initiated upload toggles.
pub const MIN_ACTION_INTERVAL: Duration = Duration::from_millis(500);

/// Local progress is capped here until the receiver confirms completion.
pub const UNCONFIRMED_PERCENT_CAP: u8 = 99;

// ── Ideas / Storage ──────────────────────────────────────────────────────────

/// Scope used when a caller does not name an idea.
pub const DEFAULT_IDEA_ID: &str = "default";

/// Subdirectory of the cache root holding one directory per sender.
pub const UPLOADS_DIR: &str = "Uploads";

/// Aborted upload ids remembered so their late chunks can be dropped.
pub const CANCELLED_UPLOADS_REMEMBERED: usize = 64;

/// Extensions treated as video for eager preload on ingest.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "mkv", "webm", "avi", "wmv", "flv", "mpg", "mpeg", "3gp", "3g2", "ts",
    "m2ts", "mts",
];

// ── Scene ────────────────────────────────────────────────────────────────────

/// Every item of a scene must be ready within this window or the start fails.
pub const SCENE_READY_TIMEOUT: Duration = Duration::from_secs(11);

/// Quiet period after a teardown before a queued start is dispatched.
pub const TEARDOWN_COOLDOWN: Duration = Duration::from_millis(150);

/// Missing file names listed in a validation error before truncation.
pub const MISSING_FILES_LISTED: usize = 3;

/// Failed image/video loads are retried this many times.
pub const LOAD_RETRY_ATTEMPTS: u32 = 5;

/// Delay between two load retries.
pub const LOAD_RETRY_INTERVAL: Duration = Duration::from_millis(500);

// ── Playback sync ────────────────────────────────────────────────────────────

/// A priming frame is accepted when it lies within this distance of the
/// configured start position.
pub const START_POSITION_TOLERANCE_MS: i64 = 120;

/// Live decoding is considered caught up with the primed frame once it is
/// at most this far behind.
pub const DECODER_SYNC_TOLERANCE_MS: i64 = 25;

/// Live frames swallowed after decoder sync before the primed still frame
/// is released.
pub const LIVE_WARMUP_FRAMES: u32 = 2;

/// Distance from the end of the media at which a repeat is re-armed.
pub const REPEAT_WINDOW_MS: i64 = 120;

/// Visibility fades shorter than this are applied instantly.
pub const INSTANT_FADE_THRESHOLD_MS: u64 = 10;

/// Step interval of linear audio volume fades.
pub const AUDIO_FADE_TICK: Duration = Duration::from_millis(20);

// ── Simulated playback ───────────────────────────────────────────────────────

/// Duration reported for every video by the simulated playback backend.
pub const SIMULATED_VIDEO_DURATION_MS: i64 = 10_000;

/// Frame interval of the simulated playback backend (25 fps).
pub const SIMULATED_FRAME_INTERVAL: Duration = Duration::from_millis(40);

// ── Logging ──────────────────────────────────────────────────────────────────

/// Log file name under `<data_dir>/logs/`.
pub const LOG_FILE_NAME: &str = "scenecast.log";
