//! Manager-level integration tests: admission, bans, targeted casts.

use crate::harness::{wait_for, TestMsg, TestNode};
use mesh_peer::PeerError;
use std::time::Duration;

/// Two managed nodes discover each other and hold exactly one connection
/// per pair.
#[tokio::test]
async fn test_two_nodes_connect() {
    let a = TestNode::start("pair-a", 3300).await;
    let b = TestNode::start("pair-b", 3300).await;

    b.manager.add_node(&a.addr).unwrap();
    b.manager.enforce_connect().await;

    assert!(
        wait_for(Duration::from_secs(5), || {
            a.manager.connected_list().contains(&b.addr)
                && b.manager.connected_list().contains(&a.addr)
        })
        .await,
        "nodes must connect both ways"
    );

    assert_eq!(a.manager.connected_list().len(), 1);
    assert_eq!(b.manager.connected_list().len(), 1);
}

/// A targeted message reaches only its target.
#[tokio::test]
async fn test_target_cast() {
    let a = TestNode::start("target-a", 3301).await;
    let b = TestNode::start("target-b", 3301).await;

    b.manager.add_node(&a.addr).unwrap();
    b.manager.enforce_connect().await;
    assert!(
        wait_for(Duration::from_secs(5), || {
            b.manager.connected_list().contains(&a.addr)
        })
        .await
    );

    let m = TestMsg {
        from: b.addr.clone(),
        tag: 7,
    };
    b.manager.target_cast(&a.addr, &m).unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || a.recv_log.count_from(&b.addr) == 1).await,
        "target must observe the message"
    );

    let err = b.manager.target_cast("missing:3301", &m).unwrap_err();
    assert!(matches!(err, PeerError::NotFoundPeer));
}

/// Banning closes the live connection and keeps the peer out until the
/// ban is lifted.
#[tokio::test]
async fn test_ban_closes_live_peer() {
    let a = TestNode::start("ban-a", 3302).await;
    let b = TestNode::start("ban-b", 3302).await;

    b.manager.add_node(&a.addr).unwrap();
    b.manager.enforce_connect().await;
    assert!(
        wait_for(Duration::from_secs(5), || {
            a.manager.connected_list().contains(&b.addr)
        })
        .await
    );

    a.manager.ban(&b.addr, 600);
    assert!(a.manager.is_ban(&b.addr));

    assert!(
        wait_for(Duration::from_secs(5), || {
            !a.manager.connected_list().contains(&b.addr)
        })
        .await,
        "banned peer must be dropped"
    );

    a.manager.unban(&b.addr);
    assert!(!a.manager.is_ban(&b.addr));
}

/// `Ban` then `Unban` restores `is_ban == false` regardless of
/// interleaved queries.
#[tokio::test]
async fn test_ban_unban_idempotence() {
    let a = TestNode::start("banflip-a", 3303).await;

    for _ in 0..3 {
        a.manager.ban("flip:3303", 60);
        assert!(a.manager.is_ban("flip:3303"));
        a.manager.unban("flip:3303");
        assert!(!a.manager.is_ban("flip:3303"));
    }
}

/// The gossip scoreboard is keyed by the gossiped address on the
/// sender's record.
#[tokio::test]
async fn test_scoreboard_key_is_gossiped_address() {
    // c connects to b first, so b's node store learns c. Then a connects
    // to b; b's gossip response to a carries c, and a records the entry
    // on b's scoreboard under c's address.
    let a = TestNode::start("board-a", 3304).await;
    let b = TestNode::start("board-b", 3304).await;
    let c = TestNode::start("board-c", 3304).await;

    c.manager.add_node(&b.addr).unwrap();
    c.manager.enforce_connect().await;
    assert!(
        wait_for(Duration::from_secs(5), || {
            b.manager.connected_list().contains(&c.addr)
        })
        .await
    );

    a.manager.add_node(&b.addr).unwrap();
    a.manager.enforce_connect().await;

    assert!(
        wait_for(Duration::from_secs(10), || {
            a.manager.node_list().iter().any(|entry| {
                // Entries read `host:port:scoreboard_len`.
                match entry.rsplit_once(':') {
                    Some((addr, len)) => addr == b.addr && len.parse::<usize>().unwrap_or(0) >= 1,
                    None => false,
                }
            })
        })
        .await,
        "gossip must populate b's scoreboard at a"
    );
}
