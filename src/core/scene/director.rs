//! SceneDirector: validates, builds, primes, activates and tears down the
//! remote scene.
//!
//! ```text
//! Idle ──start──► Validating ──ok──► Building ──► Priming ──all ready──► Activated
//!  ▲                  │                              │                      │
//!  │               failure                  11 s timeout / stop        stop / new start
//!  │                  ▼                              ▼                      ▼
//!  └──────────── reply only ──────────── cooldown ◄── TearingDown ◄─────────┘
//! ```
//!
//! One scene generation runs at a time. Every teardown bumps `epoch`; timer
//! fires and backend events carry the epoch they were produced under and
//! are dropped when it no longer matches. A start arriving while a
//! generation is being torn down is queued one deep (newest wins) and
//! dispatched when the cooldown timer fires.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::config::{MISSING_FILES_LISTED, SCENE_READY_TIMEOUT, TEARDOWN_COOLDOWN};
use crate::core::content_store::ContentStore;
use crate::core::protocol::{SceneResult, WireMessage};
use crate::core::scene::backend::{BackendEvent, PlayerCommand, ScreenCommand, VisualCommand};
use crate::core::scene::descriptor::{MediaKind, SceneDescriptor};
use crate::core::scene::timeline::{MediaTimeline, TimelineEffect, TimelineTimer};

const TIMEOUT_ERROR: &str = "Timed out waiting for remote media to load";

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorState {
    Idle,
    Validating,
    Building,
    Priming,
    Activated,
    TearingDown,
}

/// Timers owned by the director, keyed together with the epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SceneTimer {
    ReadyTimeout,
    Cooldown,
    Media {
        media_id: String,
        timer: TimelineTimer,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    StateChanged(DirectorState),
    MediaReady { media_id: String },
    Launched { epoch: u64 },
    Failed { error: String },
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectorAction {
    Send {
        to: String,
        message: WireMessage,
    },
    Player {
        epoch: u64,
        media_id: String,
        command: PlayerCommand,
    },
    Visual {
        epoch: u64,
        media_id: String,
        command: VisualCommand,
    },
    Screen(ScreenCommand),
    Arm {
        epoch: u64,
        timer: SceneTimer,
        delay: Duration,
    },
    Disarm {
        epoch: u64,
        timer: SceneTimer,
    },
    /// Abort every scene timer regardless of epoch.
    CancelAllTimers,
    Notify(SceneEvent),
}

pub type Actions = Vec<DirectorAction>;

struct PendingStart {
    sender_id: String,
    scene: SceneDescriptor,
}

// ── Director ─────────────────────────────────────────────────────────────────

pub struct SceneDirector {
    state: DirectorState,
    epoch: u64,
    /// Client that started the current generation; replies go there.
    owner: Option<String>,
    scene: Option<SceneDescriptor>,
    screens: Vec<i64>,
    timelines: HashMap<String, MediaTimeline>,
    order: Vec<String>,
    pending: Option<PendingStart>,
}

impl Default for SceneDirector {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneDirector {
    pub fn new() -> Self {
        Self {
            state: DirectorState::Idle,
            epoch: 0,
            owner: None,
            scene: None,
            screens: Vec::new(),
            timelines: HashMap::new(),
            order: Vec::new(),
            pending: None,
        }
    }

    pub fn state(&self) -> DirectorState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn timeline(&self, media_id: &str) -> Option<&MediaTimeline> {
        self.timelines.get(media_id)
    }

    pub fn has_pending_start(&self) -> bool {
        self.pending.is_some()
    }

    fn set_state(&mut self, state: DirectorState, out: &mut Actions) {
        if self.state != state {
            debug!(event = "scene_state", from = ?self.state, to = ?state, epoch = self.epoch, "Scene state changed");
            self.state = state;
            out.push(DirectorAction::Notify(SceneEvent::StateChanged(state)));
        }
    }

    fn reply(to: &str, message: WireMessage, out: &mut Actions) {
        out.push(DirectorAction::Send {
            to: to.to_string(),
            message,
        });
    }

    // ── Start ────────────────────────────────────────────────────────────

    /// Handle `remote_scene_start` from `sender_id`.
    pub fn on_scene_start(
        &mut self,
        sender_id: &str,
        scene: SceneDescriptor,
        store: &mut ContentStore,
    ) -> Actions {
        let mut out = Vec::new();

        if self.state == DirectorState::TearingDown {
            if self.pending.is_some() {
                debug!(event = "scene_start_superseded", sender = %sender_id, "Queued scene start replaced by a newer one");
            }
            self.pending = Some(PendingStart {
                sender_id: sender_id.to_string(),
                scene,
            });
            return out;
        }

        let previous = self.state;
        self.set_state(DirectorState::Validating, &mut out);
        if let Err(error) = validate(&scene, store) {
            warn!(event = "scene_validation_failure", sender = %sender_id, error = %error, "Scene rejected");
            Self::reply(
                sender_id,
                WireMessage::RemoteSceneValidation(SceneResult::failed(error.clone())),
                &mut out,
            );
            out.push(DirectorAction::Notify(SceneEvent::Failed { error }));
            // The running scene, if any, is left alone.
            self.set_state(previous, &mut out);
            return out;
        }

        if self.scene.is_some() {
            info!(event = "scene_restart", sender = %sender_id, epoch = self.epoch, "Tearing down current scene before starting the next");
            self.pending = Some(PendingStart {
                sender_id: sender_id.to_string(),
                scene,
            });
            self.teardown(store, &mut out);
            return out;
        }

        self.build(sender_id, scene, store, &mut out);
        out
    }

    fn build(
        &mut self,
        sender_id: &str,
        mut scene: SceneDescriptor,
        store: &mut ContentStore,
        out: &mut Actions,
    ) {
        self.set_state(DirectorState::Building, out);
        self.epoch += 1;
        let epoch = self.epoch;
        info!(event = "scene_build", sender = %sender_id, epoch, screens = scene.screens.len(), media = scene.media.len(), "Building scene");

        for item in scene.media.iter_mut() {
            if item.kind == MediaKind::Image && item.looks_like_video() {
                item.kind = MediaKind::Video;
            }
        }

        for screen in scene.target_screens() {
            self.screens.push(screen.id);
            out.push(DirectorAction::Screen(ScreenCommand::Create(screen.clone())));
        }

        self.owner = Some(sender_id.to_string());
        for index in scene.build_order() {
            let item = scene.media[index].clone();
            let media_id = item.media_id.clone();
            if self.timelines.contains_key(&media_id) {
                warn!(event = "duplicate_media_id", media_id = %media_id, "Media id appears twice, keeping the first");
                continue;
            }
            let source = if item.is_text() {
                None
            } else {
                store.attach_media(&item.file_id, &media_id);
                store.resolve_existing(&item.file_id)
            };
            let mut timeline = MediaTimeline::new(item, source);
            let effects = timeline.build(&scene);
            self.timelines.insert(media_id.clone(), timeline);
            self.order.push(media_id.clone());
            self.apply(&media_id, effects, out);
        }
        self.scene = Some(scene);

        self.set_state(DirectorState::Priming, out);
        out.push(DirectorAction::Arm {
            epoch,
            timer: SceneTimer::ReadyTimeout,
            delay: SCENE_READY_TIMEOUT,
        });
        self.maybe_activate(out);
    }

    /// Translate timeline effects into epoch-stamped actions.
    fn apply(&mut self, media_id: &str, effects: Vec<TimelineEffect>, out: &mut Actions) {
        let epoch = self.epoch;
        for effect in effects {
            out.push(match effect {
                TimelineEffect::Player(command) => DirectorAction::Player {
                    epoch,
                    media_id: media_id.to_string(),
                    command,
                },
                TimelineEffect::Visual(command) => DirectorAction::Visual {
                    epoch,
                    media_id: media_id.to_string(),
                    command,
                },
                TimelineEffect::Arm(timer, delay) => DirectorAction::Arm {
                    epoch,
                    timer: SceneTimer::Media {
                        media_id: media_id.to_string(),
                        timer,
                    },
                    delay,
                },
                TimelineEffect::Disarm(timer) => DirectorAction::Disarm {
                    epoch,
                    timer: SceneTimer::Media {
                        media_id: media_id.to_string(),
                        timer,
                    },
                },
                TimelineEffect::Ready => {
                    debug!(event = "media_ready", media_id = %media_id, epoch, "Media item ready");
                    DirectorAction::Notify(SceneEvent::MediaReady {
                        media_id: media_id.to_string(),
                    })
                }
            });
        }
    }

    fn maybe_activate(&mut self, out: &mut Actions) {
        if self.state != DirectorState::Priming {
            return;
        }
        if !self.timelines.values().all(MediaTimeline::is_ready) {
            return;
        }
        let epoch = self.epoch;
        out.push(DirectorAction::Disarm {
            epoch,
            timer: SceneTimer::ReadyTimeout,
        });
        self.set_state(DirectorState::Activated, out);

        for media_id in self.order.clone() {
            if let Some(timeline) = self.timelines.get_mut(&media_id) {
                let effects = timeline.activate();
                self.apply(&media_id, effects, out);
            }
        }

        info!(event = "scene_launched", epoch, media = self.order.len(), "Scene activated");
        if let Some(owner) = self.owner.clone() {
            Self::reply(
                &owner,
                WireMessage::RemoteSceneValidation(SceneResult::ok()),
                out,
            );
            Self::reply(&owner, WireMessage::RemoteSceneLaunched, out);
        }
        out.push(DirectorAction::Notify(SceneEvent::Launched { epoch }));
    }

    // ── Events ───────────────────────────────────────────────────────────

    pub fn on_backend_event(&mut self, event: BackendEvent) -> Actions {
        let mut out = Vec::new();
        if event.epoch != self.epoch || self.scene.is_none() {
            debug!(event = "stale_backend_event", got = event.epoch, current = self.epoch, media_id = %event.media_id, "Dropping event from another scene generation");
            return out;
        }
        let Some(timeline) = self.timelines.get_mut(&event.media_id) else {
            debug!(event = "unknown_media_event", media_id = %event.media_id, "Event for unknown media item");
            return out;
        };
        let effects = timeline.on_event(event.event);
        self.apply(&event.media_id, effects, &mut out);
        self.maybe_activate(&mut out);
        out
    }

    pub fn on_timer(&mut self, epoch: u64, timer: SceneTimer, store: &mut ContentStore) -> Actions {
        let mut out = Vec::new();
        if epoch != self.epoch {
            debug!(event = "stale_timer", got = epoch, current = self.epoch, timer = ?timer, "Dropping timer from another scene generation");
            return out;
        }
        match timer {
            SceneTimer::ReadyTimeout => {
                if self.state != DirectorState::Priming {
                    return out;
                }
                let waiting: Vec<&str> = self
                    .timelines
                    .values()
                    .filter(|t| !t.is_ready())
                    .map(MediaTimeline::media_id)
                    .collect();
                warn!(event = "scene_ready_timeout", epoch, waiting = ?waiting, "Scene media did not become ready in time");
                if let Some(owner) = self.owner.clone() {
                    Self::reply(
                        &owner,
                        WireMessage::RemoteSceneValidation(SceneResult::failed(TIMEOUT_ERROR)),
                        &mut out,
                    );
                }
                out.push(DirectorAction::Notify(SceneEvent::Failed {
                    error: TIMEOUT_ERROR.to_string(),
                }));
                self.teardown(store, &mut out);
            }
            SceneTimer::Cooldown => {
                if self.state != DirectorState::TearingDown {
                    return out;
                }
                self.set_state(DirectorState::Idle, &mut out);
                if let Some(next) = self.pending.take() {
                    debug!(event = "scene_pending_dispatch", sender = %next.sender_id, "Starting queued scene");
                    out.extend(self.on_scene_start(&next.sender_id, next.scene, store));
                }
            }
            SceneTimer::Media { media_id, timer } => {
                if let Some(timeline) = self.timelines.get_mut(&media_id) {
                    let effects = timeline.on_timer(timer);
                    self.apply(&media_id, effects, &mut out);
                    self.maybe_activate(&mut out);
                }
            }
        }
        out
    }

    // ── Stop ─────────────────────────────────────────────────────────────

    /// Handle `remote_scene_stop`. Always answers with success.
    pub fn on_scene_stop(&mut self, sender_id: &str, store: &mut ContentStore) -> Actions {
        let mut out = Vec::new();
        self.pending = None;
        if self.scene.is_some() {
            info!(event = "scene_stop", sender = %sender_id, epoch = self.epoch, "Stopping scene");
            self.teardown(store, &mut out);
        } else {
            debug!(event = "scene_stop_idle", sender = %sender_id, "Stop requested with no running scene");
        }
        Self::reply(
            sender_id,
            WireMessage::RemoteSceneStopped(SceneResult::ok()),
            &mut out,
        );
        out.push(DirectorAction::Notify(SceneEvent::Stopped));
        out
    }

    /// The connection to `peer` dropped: treat it as an implicit stop of the
    /// scene it owns.
    pub fn on_connection_lost(&mut self, peer: &str, store: &mut ContentStore) -> Actions {
        let mut out = Vec::new();
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.sender_id == peer)
        {
            self.pending = None;
        }
        if self.scene.is_some() && self.owner.as_deref() == Some(peer) {
            info!(event = "scene_owner_lost", peer = %peer, epoch = self.epoch, "Scene owner disconnected, tearing down");
            self.teardown(store, &mut out);
            out.push(DirectorAction::Notify(SceneEvent::Stopped));
        }
        out
    }

    /// Release the current generation and arm the cooldown. Does nothing
    /// when no generation is built.
    fn teardown(&mut self, store: &mut ContentStore, out: &mut Actions) {
        if self.scene.is_none() && self.timelines.is_empty() && self.screens.is_empty() {
            return;
        }
        let old_epoch = self.epoch;
        self.set_state(DirectorState::TearingDown, out);
        out.push(DirectorAction::CancelAllTimers);

        for media_id in std::mem::take(&mut self.order) {
            if let Some(mut timeline) = self.timelines.remove(&media_id) {
                for effect in timeline.teardown() {
                    match effect {
                        TimelineEffect::Player(command) => out.push(DirectorAction::Player {
                            epoch: old_epoch,
                            media_id: media_id.clone(),
                            command,
                        }),
                        TimelineEffect::Visual(command) => out.push(DirectorAction::Visual {
                            epoch: old_epoch,
                            media_id: media_id.clone(),
                            command,
                        }),
                        _ => {}
                    }
                }
            }
            store.detach_media(&media_id);
        }
        self.timelines.clear();
        for screen_id in std::mem::take(&mut self.screens) {
            out.push(DirectorAction::Screen(ScreenCommand::Destroy(screen_id)));
        }
        self.scene = None;
        self.owner = None;

        self.epoch += 1;
        debug!(event = "scene_teardown", old_epoch, epoch = self.epoch, "Scene torn down");
        out.push(DirectorAction::Arm {
            epoch: self.epoch,
            timer: SceneTimer::Cooldown,
            delay: TEARDOWN_COOLDOWN,
        });
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Check a descriptor against the local content. Returns the user-facing
/// error text on failure.
pub fn validate(scene: &SceneDescriptor, store: &ContentStore) -> Result<(), String> {
    if scene.screens.is_empty() {
        return Err("Scene has no screen configuration".to_string());
    }
    if scene.media.is_empty() {
        return Err("Scene has no media items".to_string());
    }
    let missing: Vec<String> = scene
        .media
        .iter()
        .filter(|item| !item.is_text() && !item.file_id.is_empty())
        .filter(|item| store.resolve_existing(&item.file_id).is_none())
        .map(|item| item.display_name().to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing_files_message(&missing))
    }
}

pub fn missing_files_message(names: &[String]) -> String {
    let count = names.len();
    if count <= MISSING_FILES_LISTED {
        let noun = if count == 1 { "file" } else { "files" };
        format!("Missing {} {}: {}", count, noun, names.join(", "))
    } else {
        format!(
            "Missing {} files: {}, {}, and {} more",
            count,
            names[0],
            names[1],
            count - 2
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
