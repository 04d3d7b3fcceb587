//! End-to-end connectivity through the real `webrtc-ice` path: two agents on
//! the same host exchange descriptions and datagrams, then the same flow is
//! exercised through a pair of relays the way the game would see it.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use rime_core::IceServers;
use rime_ice::{AgentState, IceAgent, PeerRelay};

const CONNECT_WAIT: Duration = Duration::from_secs(20);

async fn gathered_sdp(agent: &IceAgent) -> String {
    let (tx, rx) = oneshot::channel();
    agent
        .gather(move |sdp64| {
            let _ = tx.send(sdp64);
        })
        .await
        .unwrap();
    timeout(CONNECT_WAIT, rx).await.unwrap().unwrap()
}

async fn wait_connected(agent: &IceAgent) {
    timeout(CONNECT_WAIT, async {
        while !agent.is_connected() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("agent did not reach Connected");
}

#[tokio::test]
async fn two_agents_connect_and_exchange_datagrams() {
    // Host candidates only; no traversal servers needed on one machine.
    let servers = IceServers::default();
    let controlling = Arc::new(IceAgent::new(&servers, true).await.unwrap());
    let controlled = Arc::new(IceAgent::new(&servers, false).await.unwrap());

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    controlling.set_state_callback(move |state| {
        let _ = state_tx.send(state);
    });

    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
    controlled.set_receive_sink(recv_tx);

    let sdp_a = gathered_sdp(&controlling).await;
    let sdp_b = gathered_sdp(&controlled).await;
    assert!(!sdp_a.is_empty());
    assert_eq!(controlling.state(), AgentState::AwaitingRemoteSdp);

    controlling.set_remote_sdp(&sdp_b).await.unwrap();
    controlled.set_remote_sdp(&sdp_a).await.unwrap();

    wait_connected(&controlling).await;
    wait_connected(&controlled).await;

    // The observer saw the walk towards Connected.
    let saw_connected = timeout(CONNECT_WAIT, async {
        while let Some(state) = state_rx.recv().await {
            if state == AgentState::Connected {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(saw_connected);

    controlling.send(b"hello over ice").await.unwrap();
    let payload = timeout(CONNECT_WAIT, recv_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, b"hello over ice");

    assert!(!controlling.local_candidate_info().await.is_empty());
    assert!(!controlling.remote_sdp64().is_empty());

    controlling.close().await;
    controlled.close().await;
}

#[tokio::test]
async fn relays_carry_game_traffic_end_to_end() {
    let servers = IceServers::default();
    // Player 1 talking to player 2: the smaller id controls.
    let relay_a = PeerRelay::bind(2, "bob", 6112, &servers, true).await.unwrap();
    let relay_b = PeerRelay::bind(1, "alice", 6112, &servers, false)
        .await
        .unwrap();

    let (tx_a, rx_a) = oneshot::channel();
    relay_a
        .gather_candidates(move |sdp| {
            let _ = tx_a.send(sdp);
        })
        .await
        .unwrap();
    let (tx_b, rx_b) = oneshot::channel();
    relay_b
        .gather_candidates(move |sdp| {
            let _ = tx_b.send(sdp);
        })
        .await
        .unwrap();
    let sdp_a = timeout(CONNECT_WAIT, rx_a).await.unwrap().unwrap();
    let sdp_b = timeout(CONNECT_WAIT, rx_b).await.unwrap().unwrap();

    relay_a.agent().set_remote_sdp(&sdp_b).await.unwrap();
    relay_b.agent().set_remote_sdp(&sdp_a).await.unwrap();
    wait_connected(relay_a.agent()).await;
    wait_connected(relay_b.agent()).await;

    // Each mock game talks to its local relay port; the first datagram also
    // teaches the relay where the game lives. Prime relay B with a throwaway
    // datagram so it learns game B's address (relay A does not know game A's
    // address yet, so the forwarded copy is dropped there).
    let game_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let game_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    game_b
        .send_to(b"prime", ("127.0.0.1", relay_b.port()))
        .await
        .unwrap();

    game_a
        .send_to(b"hello from a", ("127.0.0.1", relay_a.port()))
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = timeout(CONNECT_WAIT, game_b.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"hello from a");
    assert_eq!(from.port(), relay_b.port());

    // Both addresses are known now; the reverse direction works too.
    game_b
        .send_to(b"hello from b", ("127.0.0.1", relay_b.port()))
        .await
        .unwrap();
    let (len, _) = timeout(CONNECT_WAIT, game_a.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"hello from b");
}
