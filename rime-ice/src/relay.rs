//! Per-peer relay: one loopback UDP socket plus one ICE agent.
//!
//! The game keeps talking to `127.0.0.1:<port>` as if the peer were local;
//! the pump tasks move datagrams between that socket and the agent's selected
//! pair. There is no buffering in either direction: a datagram that cannot be
//! forwarded right now is dropped, matching UDP semantics end to end.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use rime_core::IceServers;

use crate::agent::{AgentState, IceAgent, Result, MAX_DATAGRAM};

/// Outbound side of the datagram plane, as seen by the pump. `IceAgent`
/// implements it; tests substitute a mock.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    async fn forward(&self, payload: &[u8]) -> Result<()>;
}

#[async_trait]
impl PeerLink for IceAgent {
    fn is_connected(&self) -> bool {
        IceAgent::is_connected(self)
    }

    async fn forward(&self, payload: &[u8]) -> Result<()> {
        self.send(payload).await
    }
}

/// The relay that makes one remote peer reachable on a loopback port.
pub struct PeerRelay {
    peer_id: i64,
    peer_login: String,
    game_udp_port: u16,
    local_port: u16,
    agent: Arc<IceAgent>,
    pumps: Vec<tokio::task::JoinHandle<()>>,
}

impl PeerRelay {
    /// Bind the loopback socket, build the ICE agent, and start both pump
    /// tasks. The OS-assigned port is fixed for the relay's lifetime.
    pub async fn bind(
        peer_id: i64,
        peer_login: &str,
        game_udp_port: u16,
        servers: &IceServers,
        controlling: bool,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?);
        let local_port = socket.local_addr()?.port();

        let agent = Arc::new(IceAgent::new(servers, controlling).await?);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        agent.set_receive_sink(incoming_tx);

        let game_addr = Arc::new(OnceCell::new());
        let pumps = vec![
            spawn_game_pump(
                Arc::clone(&socket),
                Arc::clone(&agent) as Arc<dyn PeerLink>,
                Arc::clone(&game_addr),
            ),
            spawn_peer_pump(socket, incoming_rx, game_addr),
        ];

        info!(peer = peer_id, port = local_port, "peer relay bound");
        Ok(Self {
            peer_id,
            peer_login: peer_login.to_string(),
            game_udp_port,
            local_port,
            agent,
            pumps,
        })
    }

    /// Delegate candidate gathering; the callback fires once with the local
    /// session description (base64).
    pub async fn gather_candidates(
        &self,
        on_sdp: impl FnOnce(String) + Send + 'static,
    ) -> Result<()> {
        self.agent.gather(on_sdp).await
    }

    /// Observe every state transition of the owned agent.
    pub fn set_ice_state_callback(&self, cb: impl Fn(AgentState) + Send + Sync + 'static) {
        self.agent.set_state_callback(cb);
    }

    /// Loopback port the game should address this peer on.
    pub fn port(&self) -> u16 {
        self.local_port
    }

    pub fn peer_id(&self) -> i64 {
        self.peer_id
    }

    pub fn peer_login(&self) -> &str {
        &self.peer_login
    }

    /// The configured game UDP port, kept for diagnostics.
    pub fn local_game_udp_port(&self) -> u16 {
        self.game_udp_port
    }

    pub fn agent(&self) -> &Arc<IceAgent> {
        &self.agent
    }
}

impl Drop for PeerRelay {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Game → peer: forward datagrams arriving on the loopback socket. The
/// source address of the first datagram is the game's address and is never
/// updated afterwards.
fn spawn_game_pump(
    socket: Arc<UdpSocket>,
    link: Arc<dyn PeerLink>,
    game_addr: Arc<OnceCell<SocketAddr>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    let _ = game_addr.set(src);
                    if !link.is_connected() {
                        trace!("dropping game datagram, peer not connected");
                        continue;
                    }
                    if let Err(e) = link.forward(&buf[..len]).await {
                        debug!("forward to peer failed: {e}");
                    }
                }
                Err(e) => {
                    debug!("relay socket closed: {e}");
                    break;
                }
            }
        }
    })
}

/// Peer → game: deliver datagrams from the agent to the learned game
/// address; dropped until that address is known.
fn spawn_peer_pump(
    socket: Arc<UdpSocket>,
    mut incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    game_addr: Arc<OnceCell<SocketAddr>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = incoming.recv().await {
            let Some(addr) = game_addr.get().copied() else {
                trace!("dropping peer datagram, game address unknown");
                continue;
            };
            if let Err(e) = socket.send_to(&payload, addr).await {
                debug!("forward to game failed: {e}");
            }
        }
    })
}
