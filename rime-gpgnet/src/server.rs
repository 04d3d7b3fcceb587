//! Single-client TCP server for the game side of the adapter.
//!
//! The game is the only expected client; a second connection attempt while
//! one is active is refused. Inbound messages and connection transitions are
//! surfaced over an event channel, outbound messages go through [`GpgNetServer::send`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::GpgNetCodec;
use crate::message::{GpgNetMessage, InitMode};

/// Connection state of the game client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Listening => "Listening",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
        }
    }
}

/// Events surfaced to the owner of the server.
#[derive(Debug)]
pub enum GpgNetEvent {
    Message(GpgNetMessage),
    Connection(ConnectionState),
}

#[derive(Debug, Error)]
pub enum GpgNetError {
    #[error("game is not connected")]
    NotConnected,
}

/// The GPGNet listener plus the send handle for the attached game client.
pub struct GpgNetServer {
    local_addr: SocketAddr,
    connected: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<GpgNetMessage>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl GpgNetServer {
    /// Bind the listener and start accepting. Events arrive on the returned
    /// receiver in arrival order.
    pub async fn bind(
        port: u16,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<GpgNetEvent>)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let local_addr = listener.local_addr()?;
        let connected = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        info!(%local_addr, "gpgnet listening");
        let _ = event_tx.send(GpgNetEvent::Connection(ConnectionState::Listening));

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&connected),
            event_tx,
            outbound_rx,
        ));

        Ok((
            Self {
                local_addr,
                connected,
                outbound: outbound_tx,
                accept_task: task,
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a message for the attached game client.
    pub fn send(&self, msg: GpgNetMessage) -> Result<(), GpgNetError> {
        if !self.is_connected() {
            return Err(GpgNetError::NotConnected);
        }
        self.outbound.send(msg).map_err(|_| GpgNetError::NotConnected)
    }

    pub fn send_create_lobby(
        &self,
        init_mode: InitMode,
        udp_port: u16,
        login: &str,
        player_id: i64,
        nat_traversal: i32,
    ) -> Result<(), GpgNetError> {
        self.send(GpgNetMessage::create_lobby(
            init_mode,
            udp_port,
            login,
            player_id,
            nat_traversal,
        ))
    }

    pub fn send_host_game(&self, map: &str) -> Result<(), GpgNetError> {
        self.send(GpgNetMessage::host_game(map))
    }

    pub fn send_join_game(
        &self,
        addr: &str,
        login: &str,
        player_id: i64,
    ) -> Result<(), GpgNetError> {
        self.send(GpgNetMessage::join_game(addr, login, player_id))
    }

    pub fn send_connect_to_peer(
        &self,
        addr: &str,
        login: &str,
        player_id: i64,
    ) -> Result<(), GpgNetError> {
        self.send(GpgNetMessage::connect_to_peer(addr, login, player_id))
    }

    pub fn send_disconnect_from_peer(&self, player_id: i64) -> Result<(), GpgNetError> {
        self.send(GpgNetMessage::disconnect_from_peer(player_id))
    }
}

impl Drop for GpgNetServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<GpgNetEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<GpgNetMessage>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("gpgnet accept failed: {e}");
                break;
            }
        };
        info!(%peer, "game connected");
        connected.store(true, Ordering::SeqCst);

        // Anything queued while no client was attached belongs to a dead
        // session.
        while outbound_rx.try_recv().is_ok() {}

        if event_tx
            .send(GpgNetEvent::Connection(ConnectionState::Connected))
            .is_err()
        {
            break;
        }

        serve_client(stream, &event_tx, &mut outbound_rx).await;

        connected.store(false, Ordering::SeqCst);
        info!(%peer, "game disconnected");
        if event_tx
            .send(GpgNetEvent::Connection(ConnectionState::Disconnected))
            .is_err()
        {
            break;
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    event_tx: &mpsc::UnboundedSender<GpgNetEvent>,
    outbound_rx: &mut mpsc::UnboundedReceiver<GpgNetMessage>,
) {
    let mut framed = Framed::new(stream, GpgNetCodec);
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(msg) = outbound else { break };
                debug!(header = %msg.header, "gpgnet send");
                if let Err(e) = framed.send(msg).await {
                    warn!("gpgnet write failed: {e}");
                    break;
                }
            }
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        debug!(header = %msg.header, chunks = msg.chunks.len(), "gpgnet recv");
                        if event_tx.send(GpgNetEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("gpgnet read failed: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
