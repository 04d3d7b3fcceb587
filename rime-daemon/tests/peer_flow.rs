//! Peer-connect flow: relay lifecycle, SDP delivery, and the corrected
//! teardown on `disconnectFromPeer`.

mod common;

use serde_json::json;

use common::{spawn_adapter, GameClient};
use rime_gpgnet::Chunk;

#[tokio::test]
async fn connect_to_peer_delivers_sdp_and_tears_down_cleanly() {
    let mut h = spawn_adapter().await;
    let mut game = GameClient::connect(h.gpgnet_port).await;
    h.rpc.notification("onConnectionStateChanged").await;
    game.send_game_state("Lobby").await;

    assert_eq!(
        h.rpc.call("connectToPeer", json!(["eve", 3])).await.unwrap(),
        json!("ok")
    );
    assert_eq!(
        h.rpc.notification("onNeedSdp").await,
        vec![json!(1), json!(3)]
    );

    let connect = game.next_message().await;
    assert_eq!(connect.header, "ConnectToPeer");
    let Chunk::Str(addr) = &connect.chunks[0] else {
        panic!("peer address must be a string");
    };
    assert!(addr.starts_with("127.0.0.1:"), "{addr}");
    assert_eq!(connect.chunks[1], Chunk::from("eve"));
    assert_eq!(connect.chunks[2], Chunk::Int(3));

    // A second relay for the same peer is a caller error.
    let err = h
        .rpc
        .call("connectToPeer", json!(["eve", 3]))
        .await
        .unwrap_err();
    assert!(err.contains("already exists"), "{err}");

    // Close the signaling loop by feeding a well-formed description back.
    let gathered = h.rpc.notification("onSdpGathered").await;
    let sdp64 = gathered[2].as_str().unwrap().to_string();
    assert_eq!(h.rpc.call("setSdp", json!([3, sdp64])).await.unwrap(), json!("ok"));
    h.rpc.wait_peer_state(3, "Checking").await;

    // Bad descriptions and unknown peers are RPC errors, not crashes.
    let err = h.rpc.call("setSdp", json!([3, "!!!"])).await.unwrap_err();
    assert!(err.contains("invalid sdp"), "{err}");
    let err = h
        .rpc
        .call("setSdp", json!([9, "Zm9v"]))
        .await
        .unwrap_err();
    assert!(err.starts_with("no relay for remote peer 9"), "{err}");

    // disconnectFromPeer notifies the game and removes the relay.
    assert_eq!(
        h.rpc.call("disconnectFromPeer", json!([3])).await.unwrap(),
        json!("ok")
    );
    let disconnect = game.next_message().await;
    assert_eq!(disconnect.header, "DisconnectFromPeer");
    assert_eq!(disconnect.chunks, vec![Chunk::Int(3)]);

    let status = h.rpc.call("status", json!([])).await.unwrap();
    assert!(status["relays"].as_array().unwrap().is_empty());

    let err = h
        .rpc
        .call("disconnectFromPeer", json!([3]))
        .await
        .unwrap_err();
    assert!(err.starts_with("no relay for remote peer 3"), "{err}");
}
