//! Router end-to-end tests over the mock transport.

use crate::harness::{zero_coord, TestRouter};
use bytes::Bytes;
use mesh_router::{PhysicalConnInfo, PhysicalConnStore, RouterError, TimedMap};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

/// Two routers connect and both sides report a positive ping.
#[tokio::test]
async fn test_router_connect() {
    let r1 = TestRouter::new("test1", 3000).await;
    let r2 = TestRouter::new("test2", 3000).await;

    r1.router.add_listen(zero_coord());
    r2.router.add_listen(zero_coord());

    r2.router.request("test1:3000", zero_coord()).await.unwrap();

    let (_, ping1) = timeout(Duration::from_secs(1), r1.router.accept(zero_coord()))
        .await
        .expect("accept within 1s")
        .unwrap();
    let (_, ping2) = timeout(Duration::from_secs(1), r2.router.accept(zero_coord()))
        .await
        .expect("accept within 1s")
        .unwrap();

    assert!(ping1 > Duration::ZERO);
    assert!(ping2 > Duration::ZERO);
}

/// Bytes written on one side arrive intact on the other.
#[tokio::test]
async fn test_router_connect_send() {
    let r1 = TestRouter::new("send1", 3002).await;
    let r2 = TestRouter::new("send2", 3002).await;

    r1.router.add_listen(zero_coord());
    r2.router.add_listen(zero_coord());

    r2.router.request("send1:3002", zero_coord()).await.unwrap();

    let (mut read_conn, _) = timeout(Duration::from_secs(1), r1.router.accept(zero_coord()))
        .await
        .unwrap()
        .unwrap();
    let (write_conn, _) = timeout(Duration::from_secs(1), r2.router.accept(zero_coord()))
        .await
        .unwrap()
        .unwrap();

    write_conn.send(Bytes::from_static(b"sendTest")).await.unwrap();

    let got = timeout(Duration::from_secs(1), read_conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got[..], b"sendTest");
}

/// Dialing this node's own host is refused before any IO happens.
#[tokio::test]
async fn test_request_to_local() {
    let r1 = TestRouter::new("requesttolocal", 3001).await;
    r1.router.add_listen(zero_coord());

    let err = r1
        .router
        .request("requesttolocal:3001", zero_coord())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::CannotRequestToLocal));
}

/// Timed-map entries live for a period and are gone after two.
#[tokio::test]
async fn test_timed_map_store() {
    // In time.
    let m: TimedMap<String, String> = TimedMap::new(Duration::from_secs(1), 3);
    m.store("key".into(), "value".into());
    assert_eq!(m.load(&"key".into()), Some("value".into()));

    // Timed out.
    let m: TimedMap<String, String> = TimedMap::new(Duration::from_secs(1), 3);
    m.store("key".into(), "value".into());
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(m.load(&"key".into()), None);
}

/// Evil scores survive a store reopen, including in-place mutation.
#[tokio::test]
async fn test_evil_score_persistence() {
    let dir = TempDir::new().unwrap();

    {
        let store = PhysicalConnStore::open(dir.path()).unwrap();
        let mut info = PhysicalConnInfo::new("test");
        info.evil_score = 10;
        store.store(&info).unwrap();

        let mut read = store.get("test").unwrap();
        assert_eq!(read.evil_score, 10);

        read.evil_score *= 10;
        store.store(&read).unwrap();
    }

    let store = PhysicalConnStore::open(dir.path()).unwrap();
    assert_eq!(store.get("test").unwrap().evil_score, 100);
}

/// Convicting a remote blocks future dials to it.
#[tokio::test]
async fn test_update_evil_score_blocks_request() {
    let r1 = TestRouter::new("evilscore1", 3004).await;
    let r2 = TestRouter::new("evilscore2", 3004).await;

    r1.router.add_listen(zero_coord());
    r2.router.add_listen(zero_coord());

    r2.router.request("evilscore1:3004", zero_coord()).await.unwrap();

    let (read_conn, _) = timeout(Duration::from_secs(1), r1.router.accept(zero_coord()))
        .await
        .unwrap()
        .unwrap();
    let _ = timeout(Duration::from_secs(1), r2.router.accept(zero_coord()))
        .await
        .unwrap()
        .unwrap();

    r1.router.update_evil_score(read_conn.remote_addr(), 1000);
    drop(read_conn);

    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = r1
        .router
        .request("evilscore2:3004", zero_coord())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::DoNotRequestToEvelNode));
}

/// A router that listens on a disjoint coordinate set never completes
/// the handshake.
#[tokio::test]
async fn test_no_common_coordinate() {
    let r1 = TestRouter::new("coord1", 3006).await;
    let r2 = TestRouter::new("coord2", 3006).await;

    r1.router
        .add_listen(mesh_router::ChainCoord::new([1, 0, 0, 0, 0, 0]));
    r2.router
        .add_listen(mesh_router::ChainCoord::new([2, 0, 0, 0, 0, 0]));

    r2.router
        .request("coord1:3006", mesh_router::ChainCoord::new([2, 0, 0, 0, 0, 0]))
        .await
        .unwrap();

    let accepted = timeout(
        Duration::from_millis(500),
        r1.router.accept(mesh_router::ChainCoord::new([1, 0, 0, 0, 0, 0])),
    )
    .await;
    assert!(accepted.is_err(), "no connection should be accepted");
}

/// Shutdown unblocks a pending accept with a terminal error.
#[tokio::test]
async fn test_shutdown_unblocks_accept() {
    let r1 = TestRouter::new("shutdown1", 3007).await;
    r1.router.add_listen(zero_coord());

    let router = r1.router.clone();
    let waiter = tokio::spawn(async move { router.accept(zero_coord()).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    r1.router.shutdown();

    let res = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("accept must unblock")
        .unwrap();
    assert!(matches!(res, Err(RouterError::Closed)));
}

/// Concurrent requests to one address collapse into a single socket.
#[tokio::test]
async fn test_dial_dedup() {
    let r1 = TestRouter::new("dedup1", 3008).await;
    let r2 = TestRouter::new("dedup2", 3008).await;

    r1.router.add_listen(zero_coord());
    r2.router.add_listen(zero_coord());

    for _ in 0..5 {
        r2.router.request("dedup1:3008", zero_coord()).await.unwrap();
    }

    let first = timeout(Duration::from_secs(1), r1.router.accept(zero_coord())).await;
    assert!(first.is_ok(), "one connection must arrive");

    let second = timeout(Duration::from_millis(300), r1.router.accept(zero_coord())).await;
    assert!(second.is_err(), "duplicate dials must collapse");
}
