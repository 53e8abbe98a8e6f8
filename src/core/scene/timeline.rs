//! MediaTimeline: per-item scheduling, frame priming and playback sync.
//!
//! One timeline per media item of the running scene. It is a pure state
//! machine: player/visual callbacks and timer fires go in, a list of
//! [`TimelineEffect`]s comes out. The director stamps every effect with the
//! scene epoch before handing it to the backend or the timer wheel.
//!
//! ```text
//!  build ──► loading ──► priming ──► ready ──(activate)──► scheduled
//!                          │                                  │
//!                   frames on side sink                play authorized
//!                   until within ±120 ms                      │
//!                                                  decoder sync (±25 ms)
//!                                                             │
//!                                               display sink + warmup frames
//!                                                             │
//!                                                            live
//! ```
//!
//! Timers requested before activation are recorded, not armed; `activate`
//! starts them. Zero delays run inline.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::config::{
    AUDIO_FADE_TICK, DECODER_SYNC_TOLERANCE_MS, INSTANT_FADE_THRESHOLD_MS, LIVE_WARMUP_FRAMES,
    LOAD_RETRY_ATTEMPTS, LOAD_RETRY_INTERVAL, REPEAT_WINDOW_MS, START_POSITION_TOLERANCE_MS,
};
use crate::core::scene::backend::{
    FrameRoute, MediaEvent, PlayerCommand, SpanContent, SpanPlacement, VisualCommand,
};
use crate::core::scene::descriptor::{MediaItem, MediaKind, SceneDescriptor};

const VOLUME_EPSILON: f64 = 0.0001;

// ── Effects ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimelineTimer {
    Display,
    Play,
    Pause,
    Hide,
    Mute,
    Unmute,
    /// Hide after the end of the media (`hideWhenVideoEnds`).
    EndHide,
    /// Mute after the end of the media (`muteWhenVideoEnds`).
    EndMute,
    AudioFade,
    LoadRetry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEffect {
    Player(PlayerCommand),
    Visual(VisualCommand),
    /// Arm (or re-arm) a single-shot timer.
    Arm(TimelineTimer, Duration),
    Disarm(TimelineTimer),
    /// The item became ready for activation. Emitted once.
    Ready,
}

type Effects = Vec<TimelineEffect>;

#[derive(Debug, Clone)]
struct AudioFade {
    from: f64,
    to: f64,
    muted: bool,
    elapsed_ms: u64,
    duration_ms: u64,
}

fn delay_of(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

// ── Timeline ─────────────────────────────────────────────────────────────────

pub struct MediaTimeline {
    item: MediaItem,
    source: Option<PathBuf>,
    activated: bool,

    loaded: bool,
    load_attempts: u32,
    duration_ms: i64,
    position_ms: i64,

    primed: bool,
    awaiting_start_frame: bool,
    /// Last accepted frame, kept for presentation and the end freeze.
    frame_ms: Option<i64>,
    primed_sticky: bool,
    decoder_sync_target: Option<i64>,
    ready_notified: bool,

    display_ready: bool,
    display_started: bool,
    fade_in_pending: bool,

    playing: bool,
    play_authorized: bool,
    awaiting_live: bool,
    live_started: bool,
    awaiting_decoder_sync: bool,
    warmup_remaining: u32,
    last_live_ts: Option<i64>,
    paused_at_end: bool,
    holding_last_frame: bool,
    repeat_remaining: u32,

    pending_display: Option<Duration>,
    pending_play: Option<Duration>,
    pending_pause: Option<Duration>,

    muted: bool,
    device_muted: bool,
    device_volume: f64,
    audio_fade: Option<AudioFade>,
    hide_end_triggered: bool,
    mute_end_triggered: bool,
}

impl MediaTimeline {
    /// `source` is the resolved local path (`None` for text items).
    pub fn new(item: MediaItem, source: Option<PathBuf>) -> Self {
        let muted = item.muted;
        let volume = item.clamped_volume();
        Self {
            item,
            source,
            activated: false,
            loaded: false,
            load_attempts: 0,
            duration_ms: 0,
            position_ms: 0,
            primed: false,
            awaiting_start_frame: false,
            frame_ms: None,
            primed_sticky: false,
            decoder_sync_target: None,
            ready_notified: false,
            display_ready: false,
            display_started: false,
            fade_in_pending: false,
            playing: false,
            play_authorized: false,
            awaiting_live: false,
            live_started: false,
            awaiting_decoder_sync: false,
            warmup_remaining: 0,
            last_live_ts: None,
            paused_at_end: false,
            holding_last_frame: false,
            repeat_remaining: 0,
            pending_display: None,
            pending_play: None,
            pending_pause: None,
            muted,
            device_muted: muted,
            device_volume: if muted { 0.0 } else { volume },
            audio_fade: None,
            hide_end_triggered: false,
            mute_end_triggered: false,
        }
    }

    pub fn media_id(&self) -> &str {
        &self.item.media_id
    }

    pub fn item(&self) -> &MediaItem {
        &self.item
    }

    pub fn is_ready(&self) -> bool {
        self.ready_notified
    }

    pub fn is_displayed(&self) -> bool {
        self.display_started
    }

    pub fn is_live(&self) -> bool {
        self.live_started
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn volume(&self) -> f64 {
        self.device_volume
    }

    fn is_video(&self) -> bool {
        self.item.kind == MediaKind::Video
    }

    /// Target frame position, clamped to the media once its length is known.
    fn target(&self) -> i64 {
        let target = self.item.target_position_ms();
        if self.duration_ms > 0 {
            target.min(self.duration_ms - 1).max(0)
        } else {
            target
        }
    }

    fn player(&mut self, command: PlayerCommand, out: &mut Effects) {
        match command {
            PlayerCommand::Play => self.playing = true,
            PlayerCommand::Pause | PlayerCommand::Release => self.playing = false,
            PlayerCommand::Seek(ms) => self.position_ms = ms,
            _ => {}
        }
        out.push(TimelineEffect::Player(command));
    }

    fn visual(&self, command: VisualCommand, out: &mut Effects) {
        out.push(TimelineEffect::Visual(command));
    }

    /// Arm `timer`, or run it right away when `delay` is zero.
    fn schedule(&mut self, timer: TimelineTimer, delay: Duration, out: &mut Effects) {
        if delay.is_zero() {
            self.fire(timer, out);
        } else {
            out.push(TimelineEffect::Arm(timer, delay));
        }
    }

    // ── Build ────────────────────────────────────────────────────────────

    /// Create the spans, start loading and record the deferred timers.
    pub fn build(&mut self, scene: &SceneDescriptor) -> Effects {
        let mut out = Vec::new();

        let spans: Vec<SpanPlacement> = self
            .item
            .spans
            .iter()
            .filter_map(|span| {
                scene.screen(span.screen_id).map(|screen| SpanPlacement {
                    screen_id: span.screen_id,
                    rect: span.pixel_rect(screen),
                })
            })
            .collect();
        if spans.is_empty() {
            warn!(event = "media_without_spans", media_id = %self.item.media_id, "Media item has no span on a known screen");
        }
        let content = match self.item.kind {
            MediaKind::Image => SpanContent::Image,
            MediaKind::Video => SpanContent::Video,
            MediaKind::Text => SpanContent::Text {
                text: self.item.text.clone(),
                font_family: self.item.font_family.clone(),
                font_size: self.item.font_size,
                bold: self.item.font_bold,
                italic: self.item.font_italic,
                color: self.item.text_color.clone(),
            },
        };
        self.visual(VisualCommand::CreateSpans { content, spans }, &mut out);

        match self.item.kind {
            MediaKind::Text => self.loaded = true,
            MediaKind::Image | MediaKind::Video => self.load_source(&mut out),
        }

        if self.item.auto_display {
            self.display_ready = true;
            self.pending_display = Some(delay_of(self.item.auto_display_delay_ms));
        }
        if self.is_video() && self.item.auto_play {
            self.pending_play = Some(delay_of(self.item.auto_play_delay_ms));
            if self.item.auto_pause {
                self.pending_pause = Some(delay_of(self.item.auto_pause_delay_ms));
            }
        }

        self.evaluate_readiness(&mut out);
        out
    }

    fn load_source(&mut self, out: &mut Effects) {
        match self.source.clone() {
            Some(path) if self.is_video() => self.player(PlayerCommand::Load(path), out),
            Some(path) => self.visual(VisualCommand::LoadImage(path), out),
            None => self.on_load_failed("no local file", out),
        }
    }

    fn on_load_failed(&mut self, error: &str, out: &mut Effects) {
        if self.load_attempts < LOAD_RETRY_ATTEMPTS {
            self.load_attempts += 1;
            debug!(event = "media_load_retry", media_id = %self.item.media_id, attempt = self.load_attempts, error = %error, "Retrying media load");
            out.push(TimelineEffect::Arm(
                TimelineTimer::LoadRetry,
                LOAD_RETRY_INTERVAL,
            ));
        } else {
            warn!(event = "media_load_failure", media_id = %self.item.media_id, error = %error, "Giving up loading media");
        }
    }

    fn evaluate_readiness(&mut self, out: &mut Effects) {
        if self.ready_notified {
            return;
        }
        let ready = match self.item.kind {
            MediaKind::Image => self.loaded,
            MediaKind::Video => self.loaded && self.primed,
            MediaKind::Text => true,
        };
        if ready {
            self.ready_notified = true;
            out.push(TimelineEffect::Ready);
            self.start_pending_pause(out);
        }
    }

    // ── Activation ───────────────────────────────────────────────────────

    /// The whole scene is ready: apply audio defaults and start every
    /// deferred timer.
    pub fn activate(&mut self) -> Effects {
        let mut out = Vec::new();
        if self.activated {
            return out;
        }
        self.activated = true;

        if self.is_video() {
            if !self.item.mute_when_video_ends {
                self.apply_mute(true, true, &mut out);
            }
            if self.item.auto_unmute {
                let delay = delay_of(self.item.auto_unmute_delay_ms);
                self.schedule(TimelineTimer::Unmute, delay, &mut out);
            }
            self.hide_end_triggered = false;
            self.mute_end_triggered = false;
            if self.item.auto_mute && !self.item.mute_when_video_ends {
                let delay = delay_of(self.item.auto_mute_delay_ms);
                self.schedule(TimelineTimer::Mute, delay, &mut out);
            } else {
                out.push(TimelineEffect::Disarm(TimelineTimer::Mute));
            }
        }

        if let Some(delay) = self.pending_display.take() {
            self.schedule(TimelineTimer::Display, delay, &mut out);
        }
        if let Some(delay) = self.pending_play.take() {
            self.schedule(TimelineTimer::Play, delay, &mut out);
        }
        self.start_pending_pause(&mut out);
        if self.fade_in_pending && self.display_ready && !self.display_started {
            self.fade_in(&mut out);
        }
        out
    }

    fn start_pending_pause(&mut self, out: &mut Effects) {
        if !self.activated
            || self.awaiting_start_frame
            || self.awaiting_decoder_sync
            || (self.awaiting_live && !self.live_started)
        {
            return;
        }
        if let Some(delay) = self.pending_pause.take() {
            self.schedule(TimelineTimer::Pause, delay, out);
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────

    pub fn on_timer(&mut self, timer: TimelineTimer) -> Effects {
        let mut out = Vec::new();
        self.fire(timer, &mut out);
        out
    }

    fn fire(&mut self, timer: TimelineTimer, out: &mut Effects) {
        match timer {
            TimelineTimer::Display => self.fade_in(out),
            TimelineTimer::Play => self.trigger_play(out),
            TimelineTimer::Pause => {
                if self.playing {
                    debug!(event = "media_auto_paused", media_id = %self.item.media_id, "Auto pause");
                    self.player(PlayerCommand::Pause, out);
                }
            }
            TimelineTimer::Hide => self.fade_out_and_hide(out),
            TimelineTimer::Mute => self.apply_mute(true, false, out),
            TimelineTimer::Unmute => {
                if self.activated {
                    self.apply_mute(false, false, out);
                }
            }
            TimelineTimer::EndHide => {
                self.hide_end_triggered = true;
                self.fade_out_and_hide(out);
            }
            TimelineTimer::EndMute => {
                self.apply_mute(true, false, out);
                self.mute_end_triggered = true;
            }
            TimelineTimer::AudioFade => self.audio_fade_tick(out),
            TimelineTimer::LoadRetry => {
                if !self.loaded {
                    self.load_source(out);
                }
            }
        }
    }

    // ── Backend events ───────────────────────────────────────────────────

    pub fn on_event(&mut self, event: MediaEvent) -> Effects {
        let mut out = Vec::new();
        match event {
            MediaEvent::Loaded { duration_ms } => self.on_loaded(duration_ms, &mut out),
            MediaEvent::LoadFailed { error } => self.on_load_failed(&error, &mut out),
            MediaEvent::Frame {
                route,
                timestamp_ms,
                position_ms,
            } => self.on_frame(route, timestamp_ms, position_ms, &mut out),
            MediaEvent::Position(position) => self.on_position(position, &mut out),
            MediaEvent::EndOfMedia => self.on_end(&mut out),
        }
        out
    }

    fn on_loaded(&mut self, duration_ms: i64, out: &mut Effects) {
        self.loaded = true;
        self.duration_ms = duration_ms.max(0);
        if self.is_video() {
            self.repeat_remaining = self.initial_repeats();
            if !self.primed {
                self.player(PlayerCommand::RouteFrames(FrameRoute::Priming), out);
                self.apply_mute(true, true, out);
                self.paused_at_end = false;
                self.seek_to_configured_start(out);
                self.player(PlayerCommand::Play, out);
            }
        }
        self.evaluate_readiness(out);
    }

    fn initial_repeats(&self) -> u32 {
        if self.item.repeat_enabled && self.item.repeat_count > 0 {
            self.item.repeat_count
        } else {
            0
        }
    }

    fn seek_to_configured_start(&mut self, out: &mut Effects) {
        let target = self.target();
        let current = self.position_ms;
        if (current - target).abs() > START_POSITION_TOLERANCE_MS {
            self.awaiting_start_frame = target > 0;
            self.player(PlayerCommand::Seek(target), out);
        } else {
            self.awaiting_start_frame = false;
            if current != target {
                self.player(PlayerCommand::Seek(target), out);
            }
        }
        if !self.awaiting_start_frame {
            self.start_pending_pause(out);
        }
    }

    fn on_frame(
        &mut self,
        route: FrameRoute,
        timestamp_ms: Option<i64>,
        position_ms: i64,
        out: &mut Effects,
    ) {
        self.position_ms = position_ms;
        if self.holding_last_frame {
            return;
        }
        let reference = timestamp_ms.unwrap_or(position_ms);

        match route {
            FrameRoute::Priming if !self.primed => self.on_priming_frame(reference, out),
            FrameRoute::Priming => {
                if !self.awaiting_decoder_sync {
                    return;
                }
                let target = self.decoder_sync_target.unwrap_or_else(|| self.target());
                if reference >= target - DECODER_SYNC_TOLERANCE_MS {
                    debug!(event = "decoder_sync_reached", media_id = %self.item.media_id, target, reference, "Decoder caught up with primed frame");
                    self.awaiting_decoder_sync = false;
                    self.decoder_sync_target = None;
                    self.frame_ms = Some(reference);
                    self.primed_sticky = false;
                    if self.warmup_remaining == 0 {
                        self.warmup_remaining = LIVE_WARMUP_FRAMES;
                    }
                    self.player(PlayerCommand::RouteFrames(FrameRoute::Display), out);
                    if !self.playing {
                        self.player(PlayerCommand::Play, out);
                    }
                    self.start_pending_pause(out);
                }
            }
            FrameRoute::Display => {
                self.frame_ms = Some(reference);
                if self.awaiting_live && !self.live_started {
                    let advanced = match timestamp_ms {
                        Some(ts) if self.last_live_ts != Some(ts) => {
                            self.last_live_ts = Some(ts);
                            true
                        }
                        Some(_) => false,
                        None => true,
                    };
                    if advanced && self.warmup_remaining > 0 {
                        self.warmup_remaining -= 1;
                    }
                    if self.warmup_remaining == 0 {
                        self.finish_live_start(out);
                    }
                }
            }
        }
    }

    fn on_priming_frame(&mut self, reference: i64, out: &mut Effects) {
        let desired = self.target();
        if self.awaiting_start_frame {
            if reference < desired - START_POSITION_TOLERANCE_MS {
                // Still decoding towards the target.
                if !self.playing {
                    self.player(PlayerCommand::Play, out);
                }
                return;
            }
            if reference > desired + START_POSITION_TOLERANCE_MS {
                debug!(event = "priming_overshoot", media_id = %self.item.media_id, desired, reference, "Priming frame past target, seeking back");
                self.player(PlayerCommand::Pause, out);
                self.player(PlayerCommand::Seek(desired), out);
                self.player(PlayerCommand::Play, out);
                return;
            }
        }

        debug!(event = "priming_accepted", media_id = %self.item.media_id, desired, reference, "First frame primed");
        self.awaiting_start_frame = false;
        self.primed = true;
        self.frame_ms = Some(reference);
        self.primed_sticky = true;
        self.decoder_sync_target = Some(desired);
        self.live_started = false;
        self.last_live_ts = None;
        if self.item.auto_play {
            self.awaiting_live = true;
            self.warmup_remaining = LIVE_WARMUP_FRAMES;
        } else {
            self.awaiting_live = false;
            self.warmup_remaining = 0;
        }
        self.player(PlayerCommand::Pause, out);
        if self.position_ms != desired {
            self.player(PlayerCommand::Seek(desired), out);
        }
        self.present_primed_frame(out);
        self.evaluate_readiness(out);
        // Before activation the Display timer owns the fade-in; afterwards
        // only a fade the timer already requested is resumed.
        if self.activated && self.fade_in_pending && self.display_ready && !self.display_started {
            self.fade_in(out);
        }
        if self.play_authorized {
            self.start_live(out);
        }
    }

    fn present_primed_frame(&self, out: &mut Effects) {
        let Some(timestamp_ms) = self.frame_ms else {
            return;
        };
        if !self.primed_sticky {
            return;
        }
        if self.awaiting_live && !self.live_started && !self.item.auto_display {
            return;
        }
        self.visual(VisualCommand::PresentFrame { timestamp_ms }, out);
    }

    fn finish_live_start(&mut self, out: &mut Effects) {
        if self.live_started {
            return;
        }
        debug!(event = "live_playback_started", media_id = %self.item.media_id, frame = ?self.frame_ms, "Live playback visible");
        self.awaiting_live = false;
        self.live_started = true;
        self.warmup_remaining = 0;
        self.visual(VisualCommand::ReleasePrimedFrame, out);
        if self.display_ready && !self.display_started {
            self.fade_in(out);
        }
        self.start_pending_pause(out);
    }

    fn on_position(&mut self, position: i64, out: &mut Effects) {
        self.position_ms = position;
        let duration = self.duration_ms;
        if duration <= 0 || position <= 0 {
            return;
        }
        let remaining = duration - position;

        if self.item.repeat_enabled && self.repeat_remaining > 0 {
            if remaining < REPEAT_WINDOW_MS {
                self.repeat_remaining -= 1;
                debug!(event = "media_repeat", media_id = %self.item.media_id, remaining = self.repeat_remaining, "Looping media");
                self.paused_at_end = false;
                if self.audio_fade.is_none() {
                    let volume = if self.muted {
                        0.0
                    } else {
                        self.item.clamped_volume()
                    };
                    self.set_audio(self.muted, volume, out);
                }
                self.player(PlayerCommand::Seek(0), out);
                self.player(PlayerCommand::Play, out);
            }
            return;
        }

        if self.item.mute_when_video_ends
            && !self.mute_end_triggered
            && self.item.auto_mute_delay_ms < 0
            && remaining <= -self.item.auto_mute_delay_ms
        {
            self.apply_mute(true, false, out);
            self.mute_end_triggered = true;
        }
        if self.item.hide_when_video_ends
            && !self.hide_end_triggered
            && self.item.auto_hide_delay_ms < 0
            && remaining <= -self.item.auto_hide_delay_ms
        {
            self.hide_end_triggered = true;
            self.fade_out_and_hide(out);
        }
    }

    fn on_end(&mut self, out: &mut Effects) {
        let can_repeat =
            self.item.repeat_enabled && self.repeat_remaining > 0 && self.play_authorized;
        if can_repeat {
            self.repeat_remaining -= 1;
            self.paused_at_end = false;
            self.holding_last_frame = false;
            self.player(PlayerCommand::Seek(0), out);
            self.player(PlayerCommand::Play, out);
            return;
        }
        if !self.paused_at_end {
            self.paused_at_end = true;
            self.player(PlayerCommand::Pause, out);
        }
        self.freeze(out);
    }

    /// Hold the final frame and run the end-of-media automation.
    fn freeze(&mut self, out: &mut Effects) {
        if !self.is_video() || self.holding_last_frame || self.frame_ms.is_none() {
            return;
        }
        self.holding_last_frame = true;
        self.player(PlayerCommand::FreezeLastFrame, out);

        if self.item.mute_when_video_ends && !self.mute_end_triggered {
            let delay = self.item.auto_mute_delay_ms;
            if delay > 0 {
                out.push(TimelineEffect::Arm(
                    TimelineTimer::EndMute,
                    delay_of(delay),
                ));
            } else {
                self.apply_mute(true, false, out);
                self.mute_end_triggered = true;
            }
        }
        if self.item.hide_when_video_ends && !self.hide_end_triggered {
            let delay = self.item.auto_hide_delay_ms;
            if delay > 0 {
                out.push(TimelineEffect::Arm(
                    TimelineTimer::EndHide,
                    delay_of(delay),
                ));
            } else {
                self.hide_end_triggered = true;
                self.fade_out_and_hide(out);
            }
        }
    }

    // ── Playback ─────────────────────────────────────────────────────────

    fn trigger_play(&mut self, out: &mut Effects) {
        if !self.is_video() {
            return;
        }
        self.play_authorized = true;
        self.holding_last_frame = false;
        if !self.muted && self.audio_fade.is_none() {
            let volume = self.item.clamped_volume();
            self.device_volume = volume;
            self.player(PlayerCommand::SetVolume(volume), out);
        }
        self.paused_at_end = false;
        self.repeat_remaining = self.initial_repeats();
        self.awaiting_live = true;
        self.live_started = false;
        self.warmup_remaining = LIVE_WARMUP_FRAMES;
        self.last_live_ts = None;

        if self.loaded && self.primed {
            self.start_live(out);
        } else {
            debug!(event = "play_deferred", media_id = %self.item.media_id, "Play authorized before priming finished");
        }
    }

    fn start_live(&mut self, out: &mut Effects) {
        let start = self.target();
        if self.position_ms != start {
            self.player(PlayerCommand::Seek(start), out);
        }
        if self.primed {
            self.awaiting_decoder_sync = true;
            if self.decoder_sync_target.is_none() {
                self.decoder_sync_target = Some(start);
            }
            self.player(PlayerCommand::RouteFrames(FrameRoute::Priming), out);
        } else {
            self.player(PlayerCommand::RouteFrames(FrameRoute::Display), out);
        }
        self.present_primed_frame(out);
        self.player(PlayerCommand::Play, out);
    }

    // ── Visibility ───────────────────────────────────────────────────────

    fn fade_in(&mut self, out: &mut Effects) {
        if !self.activated {
            self.fade_in_pending = true;
            self.display_ready = true;
            return;
        }
        if self.awaiting_live && !self.live_started && !self.item.auto_display {
            self.fade_in_pending = true;
            return;
        }
        if self.display_started {
            return;
        }
        self.fade_in_pending = false;
        self.display_started = true;
        self.display_ready = true;
        out.push(TimelineEffect::Disarm(TimelineTimer::Hide));

        let duration_ms = self.item.fade_in_ms();
        let opacity = self.item.content_opacity;
        if duration_ms <= INSTANT_FADE_THRESHOLD_MS {
            self.visual(VisualCommand::Show { opacity }, out);
        } else {
            self.visual(VisualCommand::FadeIn { duration_ms, opacity }, out);
        }

        if self.item.auto_hide && !self.item.hide_when_video_ends {
            if duration_ms <= INSTANT_FADE_THRESHOLD_MS {
                self.schedule_hide(out);
            } else {
                let delay =
                    Duration::from_millis(duration_ms) + delay_of(self.item.auto_hide_delay_ms);
                out.push(TimelineEffect::Arm(TimelineTimer::Hide, delay));
            }
        }
    }

    fn schedule_hide(&mut self, out: &mut Effects) {
        if !self.item.auto_hide || self.item.hide_when_video_ends {
            return;
        }
        let delay = delay_of(self.item.auto_hide_delay_ms);
        if delay.is_zero() {
            self.fade_out_and_hide(out);
        } else {
            out.push(TimelineEffect::Arm(TimelineTimer::Hide, delay));
        }
    }

    fn fade_out_and_hide(&mut self, out: &mut Effects) {
        out.push(TimelineEffect::Disarm(TimelineTimer::Hide));
        self.fade_in_pending = false;
        self.display_ready = false;
        if !self.display_started {
            return;
        }
        self.display_started = false;
        let duration_ms = self.item.fade_out_ms();
        if duration_ms <= INSTANT_FADE_THRESHOLD_MS {
            self.visual(VisualCommand::Hide, out);
        } else {
            self.visual(VisualCommand::FadeOut { duration_ms }, out);
        }
    }

    // ── Audio ────────────────────────────────────────────────────────────

    fn set_audio(&mut self, muted: bool, volume: f64, out: &mut Effects) {
        self.device_muted = muted;
        self.device_volume = volume;
        self.player(PlayerCommand::SetMuted(muted), out);
        self.player(PlayerCommand::SetVolume(volume), out);
    }

    fn cancel_audio_fade(&mut self, out: &mut Effects) {
        if self.audio_fade.take().is_some() {
            out.push(TimelineEffect::Disarm(TimelineTimer::AudioFade));
        }
    }

    /// Move to `muted`, ramping the volume linearly when a fade is set.
    fn apply_mute(&mut self, muted: bool, skip_fade: bool, out: &mut Effects) {
        if !self.is_video() {
            return;
        }
        let target = if muted {
            0.0
        } else {
            self.item.clamped_volume()
        };
        if muted == self.muted
            && self.audio_fade.is_none()
            && self.device_muted == muted
            && (self.device_volume - target).abs() < VOLUME_EPSILON
        {
            return;
        }
        self.cancel_audio_fade(out);

        let fade_seconds = if skip_fade {
            0.0
        } else if muted {
            self.item.audio_fade_out_seconds
        } else {
            self.item.audio_fade_in_seconds
        };
        if !(fade_seconds > 0.0) {
            self.set_audio(muted, target, out);
            self.muted = muted;
            return;
        }

        let start = if !muted && (self.device_muted || self.muted) {
            0.0
        } else {
            self.device_volume
        };
        if (start - target).abs() < VOLUME_EPSILON {
            self.set_audio(muted, target, out);
            self.muted = muted;
            return;
        }

        self.set_audio(false, start, out);
        self.audio_fade = Some(AudioFade {
            from: start,
            to: target,
            muted,
            elapsed_ms: 0,
            duration_ms: (fade_seconds * 1000.0).round() as u64,
        });
        self.muted = muted;
        out.push(TimelineEffect::Arm(TimelineTimer::AudioFade, AUDIO_FADE_TICK));
    }

    fn audio_fade_tick(&mut self, out: &mut Effects) {
        let Some(fade) = self.audio_fade.as_mut() else {
            return;
        };
        fade.elapsed_ms += AUDIO_FADE_TICK.as_millis() as u64;
        if fade.elapsed_ms >= fade.duration_ms {
            let (muted, to) = (fade.muted, fade.to);
            self.audio_fade = None;
            self.set_audio(muted, to, out);
            return;
        }
        let t = fade.elapsed_ms as f64 / fade.duration_ms as f64;
        let volume = (fade.from + (fade.to - fade.from) * t).clamp(0.0, 1.0);
        self.device_volume = volume;
        self.player(PlayerCommand::SetVolume(volume), out);
        out.push(TimelineEffect::Arm(TimelineTimer::AudioFade, AUDIO_FADE_TICK));
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Release everything this item holds. Safe to call more than once.
    pub fn teardown(&mut self) -> Effects {
        let mut out = Vec::new();
        self.cancel_audio_fade(&mut out);
        self.pending_display = None;
        self.pending_play = None;
        self.pending_pause = None;
        self.activated = false;
        if self.is_video() && self.loaded {
            self.player(PlayerCommand::Release, &mut out);
        }
        self.loaded = false;
        self.visual(VisualCommand::Destroy, &mut out);
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
