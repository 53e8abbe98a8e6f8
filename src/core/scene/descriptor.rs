//! Declarative scene snapshot: screens, media items and their timing rules.
//!
//! Parsing is deliberately lenient. Every field has a default so a sender
//! omitting options still yields a usable descriptor; structural problems
//! (no screens, no media, missing files) are reported by the director's
//! validation step rather than by the JSON decoder.

use serde::{Deserialize, Serialize};

use crate::core::config::VIDEO_EXTENSIONS;

/// Screens and media of one scene generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneDescriptor {
    pub screens: Vec<ScreenSpec>,
    pub media: Vec<MediaItem>,
}

impl SceneDescriptor {
    pub fn screen(&self, screen_id: i64) -> Option<&ScreenSpec> {
        self.screens.iter().find(|s| s.id == screen_id)
    }

    /// Media indices in build order. Items are built back-to-front so that
    /// later entries of the array end up lower in the stacking order.
    pub fn build_order(&self) -> impl Iterator<Item = usize> {
        (0..self.media.len()).rev()
    }

    /// Screens at least one span is placed on, in descriptor order.
    pub fn target_screens(&self) -> Vec<&ScreenSpec> {
        self.screens
            .iter()
            .filter(|screen| {
                self.media
                    .iter()
                    .any(|m| m.spans.iter().any(|s| s.screen_id == screen.id))
            })
            .collect()
    }
}

/// One physical display on the receiving host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScreenSpec {
    #[serde(alias = "hostScreenId")]
    pub id: i64,
    pub width: i64,
    pub height: i64,
    pub primary: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Image,
    Video,
    Text,
}

/// Placement of a media item on one screen, as a normalized rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpanSpec {
    pub screen_id: i64,
    pub norm_x: f64,
    pub norm_y: f64,
    pub norm_w: f64,
    pub norm_h: f64,
}

impl Default for SpanSpec {
    fn default() -> Self {
        Self {
            screen_id: -1,
            norm_x: 0.0,
            norm_y: 0.0,
            norm_w: 0.0,
            norm_h: 0.0,
        }
    }
}

/// Pixel rectangle of a span on its screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl SpanSpec {
    /// Resolve the normalized rectangle against the screen size. Degenerate
    /// sizes fall back to 10×10 so the span is still addressable.
    pub fn pixel_rect(&self, screen: &ScreenSpec) -> PixelRect {
        let sw = screen.width as f64;
        let sh = screen.height as f64;
        let mut width = (self.norm_w * sw).round() as i64;
        let mut height = (self.norm_h * sh).round() as i64;
        if width <= 0 {
            width = 10;
        }
        if height <= 0 {
            height = 10;
        }
        PixelRect {
            x: (self.norm_x * sw).round() as i64,
            y: (self.norm_y * sh).round() as i64,
            width,
            height,
        }
    }
}

/// A media item with its timing, fade and audio configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaItem {
    pub media_id: String,
    /// Empty for text items.
    pub file_id: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub spans: Vec<SpanSpec>,

    pub auto_display: bool,
    pub auto_display_delay_ms: i64,
    pub auto_play: bool,
    pub auto_play_delay_ms: i64,
    pub auto_pause: bool,
    pub auto_pause_delay_ms: i64,
    pub auto_hide: bool,
    /// With `hide_when_video_ends` this is the delay after the end;
    /// negative means that many milliseconds before the end.
    pub auto_hide_delay_ms: i64,
    pub hide_when_video_ends: bool,
    pub fade_in_seconds: f64,
    pub fade_out_seconds: f64,
    pub content_opacity: f64,

    pub muted: bool,
    pub volume: f64,
    pub auto_unmute: bool,
    pub auto_unmute_delay_ms: i64,
    pub auto_mute: bool,
    /// Same end-relative semantics as `auto_hide_delay_ms`.
    pub auto_mute_delay_ms: i64,
    pub mute_when_video_ends: bool,
    pub audio_fade_in_seconds: f64,
    pub audio_fade_out_seconds: f64,

    pub repeat_enabled: bool,
    pub repeat_count: u32,
    pub start_position_ms: Option<i64>,
    pub displayed_frame_timestamp_ms: Option<i64>,

    pub text: String,
    pub font_family: String,
    pub font_size: f64,
    pub font_bold: bool,
    pub font_italic: bool,
    pub text_color: String,
}

impl Default for MediaItem {
    fn default() -> Self {
        Self {
            media_id: String::new(),
            file_id: String::new(),
            file_name: String::new(),
            kind: MediaKind::Image,
            spans: Vec::new(),
            auto_display: false,
            auto_display_delay_ms: 0,
            auto_play: false,
            auto_play_delay_ms: 0,
            auto_pause: false,
            auto_pause_delay_ms: 0,
            auto_hide: false,
            auto_hide_delay_ms: 0,
            hide_when_video_ends: false,
            fade_in_seconds: 0.0,
            fade_out_seconds: 0.0,
            content_opacity: 1.0,
            muted: false,
            volume: 1.0,
            auto_unmute: false,
            auto_unmute_delay_ms: 0,
            auto_mute: false,
            auto_mute_delay_ms: 0,
            mute_when_video_ends: false,
            audio_fade_in_seconds: 0.0,
            audio_fade_out_seconds: 0.0,
            repeat_enabled: false,
            repeat_count: 0,
            start_position_ms: None,
            displayed_frame_timestamp_ms: None,
            text: String::new(),
            font_family: "Arial".to_string(),
            font_size: 12.0,
            font_bold: false,
            font_italic: false,
            text_color: "#FFFFFF".to_string(),
        }
    }
}

impl MediaItem {
    pub fn is_text(&self) -> bool {
        self.kind == MediaKind::Text
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Name used in user-facing messages.
    pub fn display_name(&self) -> &str {
        if self.file_name.is_empty() {
            &self.file_id
        } else {
            &self.file_name
        }
    }

    /// Position the first visible frame must show: the explicit displayed
    /// frame timestamp, else the start position, else 0.
    pub fn target_position_ms(&self) -> i64 {
        match (self.displayed_frame_timestamp_ms, self.start_position_ms) {
            (Some(ts), _) if ts >= 0 => ts,
            (_, Some(start)) => start.max(0),
            _ => 0,
        }
    }

    /// Guess the kind from the file name when a sender sent `image` for a
    /// video file.
    pub fn looks_like_video(&self) -> bool {
        let name = if self.file_name.is_empty() {
            &self.file_id
        } else {
            &self.file_name
        };
        name.rsplit_once('.')
            .map(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    pub fn fade_in_ms(&self) -> u64 {
        seconds_to_ms(self.fade_in_seconds)
    }

    pub fn fade_out_ms(&self) -> u64 {
        seconds_to_ms(self.fade_out_seconds)
    }

    pub fn clamped_volume(&self) -> f64 {
        self.volume.clamp(0.0, 1.0)
    }
}

fn seconds_to_ms(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0) as u64
    } else {
        0
    }
}
