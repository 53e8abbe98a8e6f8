//! Off-loop frame conversion with a one-slot drop policy.
//!
//! At most one conversion runs per media item. A frame arriving while one
//! is in flight replaces any frame already waiting, so under load the
//! newest frame wins and older ones are dropped instead of queued.

use bytes::Bytes;
use sha3::{Digest, Sha3_256};
use tokio::task::JoinHandle;

use crate::core::scene::backend::FrameRoute;

/// A decoded frame before conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub route: FrameRoute,
    pub timestamp_ms: Option<i64>,
    pub position_ms: i64,
    pub width: u32,
    pub height: u32,
}

/// A frame ready for the sinks.
#[derive(Debug, Clone)]
pub struct ConvertedFrame {
    pub frame: RawFrame,
    pub rgba: Bytes,
    /// Short hex digest of the pixels, for logging.
    pub digest: String,
}

// ── Gate ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FrameGate {
    busy: bool,
    pending: Option<RawFrame>,
    dropped: u64,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a frame. Returns it back when it should be converted now;
    /// otherwise it is parked (replacing any parked frame).
    pub fn submit(&mut self, frame: RawFrame) -> Option<RawFrame> {
        if !self.busy {
            self.busy = true;
            return Some(frame);
        }
        if self.pending.replace(frame).is_some() {
            self.dropped += 1;
        }
        None
    }

    /// The in-flight conversion finished. Returns the parked frame to
    /// convert next, if any; the gate stays busy in that case.
    pub fn complete(&mut self) -> Option<RawFrame> {
        let next = self.pending.take();
        self.busy = next.is_some();
        next
    }

    /// Forget the parked frame (seek, route change, release).
    pub fn reset(&mut self) {
        if self.pending.take().is_some() {
            self.dropped += 1;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ── Conversion ───────────────────────────────────────────────────────────────

/// Convert `frame` on the blocking pool.
pub fn spawn_conversion(frame: RawFrame) -> JoinHandle<ConvertedFrame> {
    tokio::task::spawn_blocking(move || convert(frame))
}

/// Produce an RGBA buffer for `frame`. The simulated decoder has no real
/// pixels, so the image is a gradient seeded by the timestamp.
fn convert(frame: RawFrame) -> ConvertedFrame {
    let seed = frame.timestamp_ms.unwrap_or(frame.position_ms) as u64;
    let pixels = frame.width as usize * frame.height as usize;
    let mut rgba = Vec::with_capacity(pixels * 4);
    for i in 0..pixels {
        let v = (seed.wrapping_add(i as u64) & 0xff) as u8;
        rgba.extend_from_slice(&[v, v.wrapping_mul(3), v.wrapping_mul(7), 0xff]);
    }
    let digest = hex::encode(&Sha3_256::digest(&rgba)[..4]);
    ConvertedFrame {
        frame,
        rgba: Bytes::from(rgba),
        digest,
    }
}
