//! Loopback integration tests for the GPGNet server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use rime_gpgnet::{
    Chunk, ConnectionState, GpgNetCodec, GpgNetEvent, GpgNetMessage, GpgNetServer,
};

const WAIT: Duration = Duration::from_secs(5);

async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<GpgNetEvent>) -> GpgNetEvent {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn message_roundtrip_through_server() {
    let (server, mut events) = GpgNetServer::bind(0).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        GpgNetEvent::Connection(ConnectionState::Listening)
    ));

    assert!(server.send_host_game("scmp").is_err(), "no client yet");

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut game = Framed::new(stream, GpgNetCodec);
    assert!(matches!(
        next_event(&mut events).await,
        GpgNetEvent::Connection(ConnectionState::Connected)
    ));

    // Game -> adapter.
    let sent = GpgNetMessage::new("GameState", vec![Chunk::from("Idle")]);
    game.send(sent.clone()).await.unwrap();
    match next_event(&mut events).await {
        GpgNetEvent::Message(msg) => assert_eq!(msg, sent),
        other => panic!("expected message, got {other:?}"),
    }

    // Adapter -> game.
    server.send_join_game("127.0.0.1:4242", "bob", 2).unwrap();
    let received = timeout(WAIT, game.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(received.header, "JoinGame");
    assert_eq!(
        received.chunks,
        vec![
            Chunk::from("127.0.0.1:4242"),
            Chunk::from("bob"),
            Chunk::Int(2),
        ]
    );

    // Disconnect resets the slot and the server keeps listening.
    drop(game);
    assert!(matches!(
        next_event(&mut events).await,
        GpgNetEvent::Connection(ConnectionState::Disconnected)
    ));
    assert!(!server.is_connected());

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let _game2 = Framed::new(stream, GpgNetCodec);
    assert!(matches!(
        next_event(&mut events).await,
        GpgNetEvent::Connection(ConnectionState::Connected)
    ));
}

#[tokio::test]
async fn messages_queued_without_client_are_discarded() {
    let (server, mut events) = GpgNetServer::bind(0).await.unwrap();
    let _ = next_event(&mut events).await; // Listening

    // A send without a client fails and must not leak into the next session.
    assert!(server.send_host_game("stale").is_err());

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut game = Framed::new(stream, GpgNetCodec);
    let _ = next_event(&mut events).await; // Connected

    server.send_host_game("fresh").unwrap();
    let received = timeout(WAIT, game.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(received.chunks, vec![Chunk::from("fresh")]);
}
