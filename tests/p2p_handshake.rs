mod common;

use std::time::Duration;

use common::{TestPeer, start_node};
use p2pframe::config::NodeConfig;
use p2pframe::net::message::NetworkMessage;
use p2pframe::net::node::P2PNode;

const LOG_WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_message_before_version_is_scored() {
    let node = start_node().await;
    let mut conn = TestPeer::connect(node.local_addr(), node.node().config().magic()).await;
    let pos = node.debug_log().position();

    conn.send_message(&NetworkMessage::Ping(1)).await;
    assert!(
        node.debug_log()
            .wait_for(pos, &["Misbehaving", "ping message before version handshake"], LOG_WAIT)
            .await
    );

    // the handshake still works afterwards
    conn.handshake().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_version_is_scored() {
    let node = start_node().await;
    let mut conn = TestPeer::connect_and_handshake(&node).await;
    let pos = node.debug_log().position();

    let version = conn.version_message();
    conn.send_and_ping(&version).await;
    assert!(
        node.debug_log()
            .contains_all_since(pos, &["Misbehaving", "(0 -> 1) reason: redundant version message"])
    );
    node.shutdown().await;
}

#[tokio::test]
async fn test_getaddr_answered_once() {
    let node = start_node().await;
    let mut conn = TestPeer::connect_and_handshake(&node).await;

    conn.send_message(&NetworkMessage::GetAddr).await;
    let reply = conn.recv_message(Duration::from_secs(2)).await;
    assert_eq!(reply, Some(NetworkMessage::Addr(Vec::new())));

    conn.send_message(&NetworkMessage::GetAddr).await;
    conn.send_message(&NetworkMessage::Ping(99)).await;
    let reply = conn.recv_message(Duration::from_secs(2)).await;
    assert_eq!(reply, Some(NetworkMessage::Pong(99)));
    node.shutdown().await;
}

#[tokio::test]
async fn test_unknown_type_is_ignored() {
    let node = start_node().await;
    let mut conn = TestPeer::connect_and_handshake(&node).await;
    let pos = node.debug_log().position();

    conn.send_raw(&conn.build_raw("badmsg", &[1, b'd'])).await;
    conn.sync_with_ping(Duration::from_secs(1)).await;
    assert!(
        node.debug_log()
            .contains_all_since(pos, &["Unknown message type badmsg"])
    );
    node.shutdown().await;
}

#[tokio::test]
async fn test_inbound_limit() {
    let config = NodeConfig {
        max_inbound: 1,
        ..NodeConfig::local_regtest()
    };
    let node = P2PNode::start(config).await.unwrap();
    let _first = TestPeer::connect_and_handshake(&node).await;

    let mut second = TestPeer::connect(node.local_addr(), node.node().config().magic()).await;
    assert!(second.wait_for_disconnect(Duration::from_secs(2)).await);
    assert_eq!(node.peer_count().await, 1);
    node.shutdown().await;
}

#[tokio::test]
async fn test_outbound_handshake_between_nodes() {
    let a = start_node().await;
    let b = start_node().await;

    a.node().connect(b.local_addr()).await.unwrap();
    assert!(
        a.debug_log()
            .wait_for(0, &["New outbound peer connected"], LOG_WAIT)
            .await
    );
    assert!(
        b.debug_log()
            .wait_for(0, &["New inbound peer connected"], LOG_WAIT)
            .await
    );
    assert_eq!(b.peer_count().await, 1);
    assert!(a.net_totals().total_bytes_sent > 0);
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_self_connection_dropped() {
    let node = start_node().await;
    node.node().connect(node.local_addr()).await.unwrap();
    assert!(
        node.debug_log()
            .wait_for(0, &["connected to self"], LOG_WAIT)
            .await
    );
    node.shutdown().await;
}
