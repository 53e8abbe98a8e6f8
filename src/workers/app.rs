//! Subcommand drivers.
//!
//! Every mode runs a full [`Engine`] behind a TCP transport. `serve` keeps
//! it alive as a receiver; the other modes connect to one receiver, issue
//! a single request and wait for its answer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::{CANCEL_FALLBACK, SCENE_READY_TIMEOUT};
use crate::core::engine::{forward, Command, Engine, EngineConfig, EngineEvent, LoopEvent};
use crate::core::pipeline::sender::{OutgoingFile, SenderConfig, SenderEvent, SessionState};
use crate::core::scene::clock::SimulatedBackend;
use crate::core::scene::descriptor::SceneDescriptor;
use crate::core::scene::director::SceneEvent;
use crate::core::transport::{Channel, TcpTransport};
use crate::utils::data_dir;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{Args, Mode};

/// How long a one-shot request waits for the receiver's answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    let Some(mode) = args.command.clone() else {
        bail!("No command given, see --help");
    };
    let mut node = Node::start(args.client_id(), args.bulk_channel);
    let result = match mode {
        Mode::Serve { listen } => serve(&mut node, &listen, &sos).await,
        Mode::Push { peer, files, idea } => push(&mut node, &peer, &files, &idea, &sos).await,
        Mode::Scene { peer, file } => scene(&mut node, &peer, &file, &sos).await,
        Mode::Stop { peer } => stop(&mut node, &peer, &sos).await,
        Mode::Clear { peer, idea } => clear(&mut node, &peer, &idea, &sos).await,
    };
    node.shutdown().await?;
    result
}

// ── Node ─────────────────────────────────────────────────────────────────────

/// A running engine plus the handles needed to talk to it.
struct Node {
    transport: TcpTransport,
    bulk_channel: bool,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    stop: SignalOfStop,
    engine: JoinHandle<Result<()>>,
}

impl Node {
    fn start(client_id: String, bulk_channel: bool) -> Self {
        // Separate from the Ctrl-C signal so a push can still cancel cleanly.
        let stop = SignalOfStop::new();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let transport = TcpTransport::new(
            client_id.clone(),
            forward(loop_tx.clone(), LoopEvent::Transport),
            stop.clone(),
        );
        let backend = SimulatedBackend::new(forward(loop_tx.clone(), LoopEvent::Backend));
        let config = EngineConfig {
            client_id,
            cache_root: data_dir::cache_dir(),
            sender: SenderConfig {
                bulk_channel,
                ..SenderConfig::default()
            },
        };
        let engine = Engine::new(
            config,
            Arc::new(transport.clone()),
            Box::new(backend),
            loop_tx.clone(),
            events_tx,
        );
        let engine = tokio::spawn(engine.run(loop_rx, stop.clone()));

        Self {
            transport,
            bulk_channel,
            loop_tx,
            events,
            stop,
            engine,
        }
    }

    /// Open the control link (and the bulk link when configured).
    async fn connect(&self, addr: &str) -> Result<String> {
        let peer = self.transport.connect(addr, Channel::Control).await?;
        if self.bulk_channel {
            let bulk_peer = self.transport.connect(addr, Channel::Bulk).await?;
            if bulk_peer != peer {
                bail!("Bulk link reached {} instead of {}", bulk_peer, peer);
            }
        }
        Ok(peer)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.loop_tx
            .send(LoopEvent::Command(command))
            .map_err(|_| anyhow!("Engine is not running"))
    }

    /// Next engine event, or `None` once `sos` fires or the engine is gone.
    async fn next(&mut self, sos: &SignalOfStop) -> Option<EngineEvent> {
        sos.run_until(self.events.recv()).await.flatten()
    }

    /// Wait for the first event `pick` accepts, failing after `timeout`.
    async fn wait_for<T>(
        &mut self,
        sos: &SignalOfStop,
        timeout: Duration,
        mut pick: impl FnMut(EngineEvent) -> Option<Result<T>>,
    ) -> Result<T> {
        let waited = tokio::time::timeout(timeout, async {
            while let Some(event) = self.next(sos).await {
                if let Some(done) = pick(event) {
                    return Some(done);
                }
            }
            None
        })
        .await;
        match waited {
            Ok(Some(done)) => done,
            Ok(None) => bail!("Interrupted"),
            Err(_) => bail!("No answer from receiver within {:?}", timeout),
        }
    }

    async fn shutdown(self) -> Result<()> {
        self.stop.cancel();
        self.engine.await.context("engine task failed")?
    }
}

fn lost(event: &EngineEvent, peer: &str) -> bool {
    matches!(event, EngineEvent::PeerLost { peer: p } if p == peer)
}

// ── Modes ────────────────────────────────────────────────────────────────────

async fn serve(node: &mut Node, listen: &str, sos: &SignalOfStop) -> Result<()> {
    node.transport.listen(listen).await?;
    println!("Serving on {} as {}", listen, node.transport.client_id());
    while let Some(event) = node.next(sos).await {
        match event {
            EngineEvent::PeerConnected { peer } => println!("Peer connected: {}", peer),
            EngineEvent::PeerLost { peer } => println!("Peer disconnected: {}", peer),
            EngineEvent::Scene(SceneEvent::Launched { epoch }) => {
                println!("Scene {} launched", epoch)
            }
            EngineEvent::Scene(SceneEvent::Failed { error }) => println!("Scene failed: {}", error),
            EngineEvent::Scene(SceneEvent::Stopped) => println!("Scene stopped"),
            other => debug!(event = "engine_event", detail = ?other, "Engine event"),
        }
    }
    info!(event = "serve_stopped", "Receiver shutting down");
    Ok(())
}

async fn push(
    node: &mut Node,
    addr: &str,
    files: &[std::path::PathBuf],
    idea: &str,
    sos: &SignalOfStop,
) -> Result<()> {
    let peer = node.connect(addr).await?;
    node.command(Command::Push {
        files: files.iter().map(OutgoingFile::new).collect(),
        target: peer.clone(),
        idea_id: idea.to_string(),
    })?;

    let mut started = false;
    while let Some(event) = node.next(sos).await {
        match event {
            EngineEvent::Upload(SenderEvent::StateChanged(state)) => {
                started |= state != SessionState::Idle;
            }
            EngineEvent::Upload(SenderEvent::Progress {
                percent,
                files_completed,
                total_files,
                ..
            }) => println!("{:>3}%  {}/{} files", percent, files_completed, total_files),
            EngineEvent::Upload(SenderEvent::AlreadySynchronized { .. }) => {
                println!("Receiver already has every file");
                return Ok(());
            }
            EngineEvent::Upload(SenderEvent::Finished { upload_id }) => {
                println!("Upload {} finished", upload_id);
                return Ok(());
            }
            EngineEvent::Status(status) if !started => bail!(status),
            EngineEvent::Status(status) => println!("{}", status),
            ref event if lost(event, &peer) => bail!("Connection to {} lost", peer),
            _ => {}
        }
    }

    // Ctrl-C: withdraw the upload and wait for the receiver to confirm.
    warn!(event = "push_interrupted", peer = %peer, "Cancelling upload");
    node.command(Command::CancelUpload)?;
    let settle = SignalOfStop::new();
    node.wait_for(&settle, CANCEL_FALLBACK + Duration::from_secs(1), |event| {
        match event {
            EngineEvent::Upload(SenderEvent::RemoteCleared { reason }) => {
                println!("Upload cancelled ({:?})", reason);
                Some(Ok(()))
            }
            EngineEvent::Upload(SenderEvent::StateChanged(SessionState::Idle)) => Some(Ok(())),
            _ => None,
        }
    })
    .await
}

async fn scene(node: &mut Node, addr: &str, file: &Path, sos: &SignalOfStop) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let scene: SceneDescriptor = serde_json::from_str(&content)
        .with_context(|| format!("invalid scene file {}", file.display()))?;

    let peer = node.connect(addr).await?;
    node.command(Command::StartScene {
        target: peer.clone(),
        scene,
    })?;

    let wait = SCENE_READY_TIMEOUT + REPLY_TIMEOUT;
    node.wait_for(sos, wait, |event| match event {
        EngineEvent::RemoteValidation { result, .. } if !result.success => Some(Err(anyhow!(
            "Scene rejected: {}",
            result.error.unwrap_or_default()
        ))),
        EngineEvent::RemoteValidation { .. } => {
            println!("Scene validated");
            None
        }
        EngineEvent::RemoteLaunched { .. } => {
            println!("Scene launched on {}", peer);
            Some(Ok(()))
        }
        ref event if lost(event, &peer) => Some(Err(anyhow!("Connection to {} lost", peer))),
        _ => None,
    })
    .await
}

async fn stop(node: &mut Node, addr: &str, sos: &SignalOfStop) -> Result<()> {
    let peer = node.connect(addr).await?;
    node.command(Command::StopScene {
        target: peer.clone(),
    })?;
    node.wait_for(sos, REPLY_TIMEOUT, |event| match event {
        EngineEvent::RemoteStopped { result, .. } if result.success => {
            println!("Scene stopped on {}", peer);
            Some(Ok(()))
        }
        EngineEvent::RemoteStopped { result, .. } => Some(Err(anyhow!(
            "Stop failed: {}",
            result.error.unwrap_or_default()
        ))),
        ref event if lost(event, &peer) => Some(Err(anyhow!("Connection to {} lost", peer))),
        _ => None,
    })
    .await
}

async fn clear(node: &mut Node, addr: &str, idea: &str, sos: &SignalOfStop) -> Result<()> {
    let peer = node.connect(addr).await?;
    node.command(Command::Clear {
        target: peer.clone(),
        idea_id: idea.to_string(),
    })?;
    node.wait_for(sos, REPLY_TIMEOUT, |event| match event {
        EngineEvent::RemoteFilesRemoved { .. } => {
            println!("Files for idea '{}' removed from {}", idea, peer);
            Some(Ok(()))
        }
        ref event if lost(event, &peer) => Some(Err(anyhow!("Connection to {} lost", peer))),
        _ => None,
    })
    .await
}
