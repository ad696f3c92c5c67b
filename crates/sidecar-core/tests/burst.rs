#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sidecar_core::lifecycle::shutdown_channel;
use sidecar_core::readiness::probe;
use sidecar_core::socket::MIN_BACKLOG;
use sidecar_core::{BridgeServer, BridgeSocket, Forward, HoldOpen, Readiness, ShutdownReason};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const CLIENTS: usize = 200;
const SPACING: Duration = Duration::from_millis(25);

async fn wait_for(path: &Path) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("path never appeared");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sustained_burst_is_admitted_in_full() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.sock");
    let marker = dir.path().join("healthy");

    let socket = BridgeSocket::bind(&path, MIN_BACKLOG).unwrap();
    let (trigger, shutdown) = shutdown_channel();
    let server = BridgeServer::new(socket, Arc::new(HoldOpen), shutdown)
        .with_readiness(Arc::new(Readiness::new(Some(marker.clone()))));
    let task = tokio::spawn(server.serve());
    wait_for(&marker).await;

    // Every client stays connected, so no accepted connection frees a slot.
    let mut clients = Vec::with_capacity(CLIENTS);
    let mut failures = 0;
    for _ in 0..CLIENTS {
        match UnixStream::connect(&path).await {
            Ok(stream) => clients.push(stream),
            Err(_) => failures += 1,
        }
        tokio::time::sleep(SPACING).await;
    }
    assert_eq!(failures, 0);

    trigger.fire(ShutdownReason::Terminate);
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.accepted, CLIENTS as u64);
    assert!(!path.exists());
    assert!(probe(&marker));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_to_back_dialers_are_queued_not_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.sock");

    let socket = BridgeSocket::bind(&path, MIN_BACKLOG).unwrap();
    let (trigger, shutdown) = shutdown_channel();
    let task = tokio::spawn(BridgeServer::new(socket, Arc::new(HoldOpen), shutdown).serve());

    // No spacing at all: everything the loop has not yet accepted sits in the backlog.
    let dials = (0..CLIENTS).map(|_| UnixStream::connect(path.clone()));
    let results = spawn_all(dials).await;
    assert!(results.iter().all(Result::is_ok));

    tokio::time::sleep(Duration::from_millis(300)).await;
    trigger.fire(ShutdownReason::Requested);
    assert_eq!(task.await.unwrap().unwrap().accepted, CLIENTS as u64);
}

#[tokio::test]
async fn forwarding_bridge_reaches_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let upstream_path = dir.path().join("upstream.sock");
    let bridge_path = dir.path().join("bridge.sock");

    let upstream = UnixListener::bind(&upstream_path).unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = upstream.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut rd, mut wr) = conn.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    let socket = BridgeSocket::bind(&bridge_path, MIN_BACKLOG).unwrap();
    let (trigger, shutdown) = shutdown_channel();
    let server = BridgeServer::new(socket, Arc::new(Forward::new(&upstream_path)), shutdown);
    let task = tokio::spawn(server.serve());

    for round in 0..3u8 {
        let mut client = UnixStream::connect(&bridge_path).await.unwrap();
        let msg = [b'a' + round; 16];
        client.write_all(&msg).await.unwrap();
        let mut echoed = [0u8; 16];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, msg);
    }

    trigger.fire(ShutdownReason::Requested);
    assert_eq!(task.await.unwrap().unwrap().accepted, 3);
}

/// Run every future as its own task and collect the outputs in order.
async fn spawn_all<F, T>(futures: impl IntoIterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}
