//! Transport: moves [`WireMessage`]s between clients.
//!
//! The wire format is newline-delimited JSON over TCP. Each connection
//! starts with one handshake line `{"clientId": ..., "channel": ...}` in
//! both directions. A peer has one `control` connection and optionally a
//! `bulk` one for upload traffic; bulk sends fall back to control when no
//! bulk connection exists.
//!
//! ```text
//!          send()                         reader task
//! engine ─────────► per-link queue ──► writer task ──► socket ──► TransportEvent ──► engine
//! ```
//!
//! `send` never blocks: every link owns an unbounded queue drained by a
//! writer task, which keeps per-channel ordering intact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::protocol::WireMessage;
use crate::utils::sos::SignalOfStop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Control,
    Bulk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub client_id: String,
    pub channel: Channel,
}

/// What the transport reports to the event loop.
#[derive(Debug)]
pub enum TransportEvent {
    Connected { peer: String, channel: Channel },
    Message { peer: String, channel: Channel, message: WireMessage },
    /// The control connection to `peer` closed.
    Disconnected { peer: String },
}

pub trait Transport: Send + Sync {
    /// Queue `message` for `peer`. Fails only when no link to `peer` exists.
    fn send(&self, peer: &str, channel: Channel, message: &WireMessage) -> Result<()>;

    fn is_connected(&self, peer: &str) -> bool;
}

// ── TCP ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PeerLinks {
    control: Option<mpsc::UnboundedSender<String>>,
    bulk: Option<mpsc::UnboundedSender<String>>,
}

impl PeerLinks {
    fn slot(&mut self, channel: Channel) -> &mut Option<mpsc::UnboundedSender<String>> {
        match channel {
            Channel::Control => &mut self.control,
            Channel::Bulk => &mut self.bulk,
        }
    }
}

#[derive(Clone)]
pub struct TcpTransport {
    client_id: String,
    peers: Arc<Mutex<HashMap<String, PeerLinks>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    sos: SignalOfStop,
}

impl TcpTransport {
    pub fn new(
        client_id: impl Into<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
        sos: SignalOfStop,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            events,
            sos,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Bind `addr` and accept connections until the stop signal fires.
    pub async fn listen(&self, addr: &str) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind {}", addr))?;
        let local = listener.local_addr()?;
        info!(event = "transport_listening", addr = %local, client_id = %self.client_id, "Listening for peers");

        let this = self.clone();
        Ok(tokio::spawn(async move { this.accept_loop(listener).await }))
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let Some(accepted) = self.sos.run_until(listener.accept()).await else {
                break;
            };
            match accepted {
                Ok((stream, remote)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_incoming(stream).await {
                            warn!(event = "handshake_failure", remote = %remote, error = %e, "Incoming connection rejected");
                        }
                    });
                }
                Err(e) => {
                    warn!(event = "accept_failure", error = %e, "Accept failed");
                }
            }
        }
        debug!(event = "accept_loop_stopped", "Accept loop stopped");
    }

    async fn handle_incoming(&self, stream: TcpStream) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let theirs = read_handshake(&mut reader).await?;
        write_handshake(&mut write, &self.client_id, theirs.channel).await?;
        self.attach(theirs.client_id, theirs.channel, reader, write);
        Ok(())
    }

    /// Open a `channel` connection to `addr`. Returns the peer's client id.
    pub async fn connect(&self, addr: &str, channel: Channel) -> Result<String> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("cannot connect to {}", addr))?;
        let (read, mut write) = stream.into_split();
        write_handshake(&mut write, &self.client_id, channel).await?;
        let mut reader = BufReader::new(read);
        let theirs = read_handshake(&mut reader).await?;
        let peer = theirs.client_id;
        info!(event = "transport_connected", addr = %addr, peer = %peer, channel = ?channel, "Connected to peer");
        self.attach(peer.clone(), channel, reader, write);
        Ok(peer)
    }

    fn attach(
        &self,
        peer: String,
        channel: Channel,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.peers.lock() {
            Ok(mut peers) => {
                let replaced = peers
                    .entry(peer.clone())
                    .or_default()
                    .slot(channel)
                    .replace(tx.clone());
                if replaced.is_some() {
                    debug!(event = "link_replaced", peer = %peer, channel = ?channel, "Existing link replaced");
                }
            }
            Err(e) => {
                warn!(event = "peer_table_poisoned", error = %e, "Peer table unavailable");
                return;
            }
        }
        let _ = self.events.send(TransportEvent::Connected {
            peer: peer.clone(),
            channel,
        });

        tokio::spawn(write_loop(writer, rx, self.sos.clone()));
        let this = self.clone();
        tokio::spawn(async move {
            this.read_loop(peer.clone(), channel, reader).await;
            this.detach(&peer, channel, &tx);
        });
    }

    async fn read_loop(&self, peer: String, channel: Channel, mut reader: BufReader<OwnedReadHalf>) {
        let mut line = String::new();
        loop {
            line.clear();
            let read = match self.sos.run_until(reader.read_line(&mut line)).await {
                None => break,
                Some(read) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(event = "link_read_failure", peer = %peer, channel = ?channel, error = %e, "Read failed");
                    break;
                }
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            match WireMessage::decode(text) {
                Ok(message) => {
                    let event = TransportEvent::Message {
                        peer: peer.clone(),
                        channel,
                        message,
                    };
                    if self.events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(event = "malformed_message", peer = %peer, error = %e, "Dropping malformed message");
                }
            }
        }
    }

    /// Drop the link if it is still the one this reader belonged to.
    fn detach(&self, peer: &str, channel: Channel, tx: &mpsc::UnboundedSender<String>) {
        let lost_control = match self.peers.lock() {
            Ok(mut peers) => {
                let Some(links) = peers.get_mut(peer) else {
                    return;
                };
                let slot = links.slot(channel);
                if !slot.as_ref().is_some_and(|current| current.same_channel(tx)) {
                    return;
                }
                *slot = None;
                if channel == Channel::Control {
                    peers.remove(peer);
                    true
                } else {
                    false
                }
            }
            Err(_) => return,
        };
        info!(event = "link_closed", peer = %peer, channel = ?channel, "Connection closed");
        if lost_control {
            let _ = self.events.send(TransportEvent::Disconnected {
                peer: peer.to_string(),
            });
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: &str, channel: Channel, message: &WireMessage) -> Result<()> {
        let line = message.encode()?;
        let peers = self
            .peers
            .lock()
            .map_err(|e| anyhow!("peer table poisoned: {}", e))?;
        let Some(links) = peers.get(peer) else {
            bail!("peer {} is not connected", peer);
        };
        let link = match channel {
            Channel::Bulk => links.bulk.as_ref().or(links.control.as_ref()),
            Channel::Control => links.control.as_ref(),
        };
        let Some(link) = link else {
            bail!("no {:?} link to {}", channel, peer);
        };
        link.send(line)
            .map_err(|_| anyhow!("link to {} closed", peer))
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.peers
            .lock()
            .map(|peers| peers.get(peer).is_some_and(|l| l.control.is_some()))
            .unwrap_or(false)
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    sos: SignalOfStop,
) {
    while let Some(Some(mut line)) = sos.run_until(rx.recv()).await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(event = "link_write_failure", error = %e, "Write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_handshake(writer: &mut OwnedWriteHalf, client_id: &str, channel: Channel) -> Result<()> {
    let mut line = serde_json::to_string(&Handshake {
        client_id: client_id.to_string(),
        channel,
    })?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("cannot send handshake")
}

async fn read_handshake(reader: &mut BufReader<OwnedReadHalf>) -> Result<Handshake> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .context("cannot read handshake")?;
    if read == 0 {
        bail!("connection closed before handshake");
    }
    let handshake: Handshake =
        serde_json::from_str(line.trim()).context("malformed handshake")?;
    if handshake.client_id.is_empty() {
        bail!("handshake without client id");
    }
    Ok(handshake)
}

// ── Recording transport ──────────────────────────────────────────────────────

/// In-memory transport that records every send.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Channel, WireMessage)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain what was sent so far.
    pub fn take(&self) -> Vec<(String, Channel, WireMessage)> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, peer: &str, channel: Channel, message: &WireMessage) -> Result<()> {
        self.sent
            .lock()
            .map_err(|e| anyhow!("recording poisoned: {}", e))?
            .push((peer.to_string(), channel, message.clone()));
        Ok(())
    }

    fn is_connected(&self, _peer: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{RemoteSceneStop, SceneResult};
    use std::time::Duration;

    async fn next(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("transport event timed out")
            .expect("transport channel closed")
    }

    #[test]
    fn handshake_uses_lowercase_channel() {
        let json = serde_json::to_string(&Handshake {
            client_id: "A".into(),
            channel: Channel::Bulk,
        })
        .unwrap();
        assert_eq!(json, r#"{"clientId":"A","channel":"bulk"}"#);
    }

    #[tokio::test]
    async fn messages_flow_both_ways_and_close_is_reported() {
        let sos = SignalOfStop::new();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let server = TcpTransport::new("receiver", server_tx, sos.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(server.clone().accept_loop(listener));

        let client_sos = SignalOfStop::new();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client = TcpTransport::new("sender", client_tx, client_sos.clone());
        let peer = client.connect(&addr, Channel::Control).await.unwrap();
        assert_eq!(peer, "receiver");
        assert!(matches!(next(&mut client_rx).await, TransportEvent::Connected { .. }));
        match next(&mut server_rx).await {
            TransportEvent::Connected { peer, channel } => {
                assert_eq!(peer, "sender");
                assert_eq!(channel, Channel::Control);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Bulk falls back to control when no bulk link exists.
        let stop = WireMessage::RemoteSceneStop(RemoteSceneStop {
            target_client_id: "receiver".into(),
        });
        client.send("receiver", Channel::Bulk, &stop).unwrap();
        match next(&mut server_rx).await {
            TransportEvent::Message { peer, message, .. } => {
                assert_eq!(peer, "sender");
                assert_eq!(message, stop);
            }
            other => panic!("unexpected {:?}", other),
        }

        let reply = WireMessage::RemoteSceneStopped(SceneResult::ok());
        server.send("sender", Channel::Control, &reply).unwrap();
        match next(&mut client_rx).await {
            TransportEvent::Message { message, .. } => assert_eq!(message, reply),
            other => panic!("unexpected {:?}", other),
        }

        client_sos.cancel();
        match next(&mut server_rx).await {
            TransportEvent::Disconnected { peer } => assert_eq!(peer, "sender"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!server.is_connected("sender"));
        assert!(server.send("sender", Channel::Control, &reply).is_err());
        sos.cancel();
    }

    #[test]
    fn recording_transport_drains() {
        let transport = RecordingTransport::new();
        transport
            .send("C", Channel::Control, &WireMessage::AllFilesRemoved)
            .unwrap();
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "C");
        assert!(transport.take().is_empty());
    }
}
