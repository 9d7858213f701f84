//! End-to-end editor sessions over real sockets.
//!
//! Starts the server on an ephemeral port and connects headless editors,
//! verifying the full sync pipeline from handshake to expiry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;

use ephemera_collab::actor::DocumentLimits;
use ephemera_collab::client::{ClientError, EditorClient, EditorEvent};
use ephemera_collab::clock::ManualClock;
use ephemera_collab::document::Ttl;
use ephemera_collab::error::DocumentError;
use ephemera_collab::id::DocumentId;
use ephemera_collab::server::{ServerConfig, SyncServer};

const START_MS: u64 = 1_700_000_000_000;
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct TestServer {
    server: SyncServer,
    clock: Arc<ManualClock>,
    addr: SocketAddr,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let server = SyncServer::with_clock(config, clock.clone()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        server.spawn(listener);
        Self {
            server,
            clock,
            addr,
        }
    }

    async fn create(&self, ttl: &str) -> DocumentId {
        let id = DocumentId::generate();
        self.server.host().document(&id).create(ttl).await.unwrap();
        id
    }

    fn url(&self, id: &DocumentId) -> String {
        format!("ws://{}/d/{id}/ws", self.addr)
    }

    async fn connect(&self, id: &DocumentId) -> EditorClient {
        EditorClient::connect(&self.url(id)).await.unwrap()
    }
}

/// Read events until one matches, failing after a few seconds.
async fn wait_for(
    client: &mut EditorClient,
    mut pred: impl FnMut(&EditorEvent) -> bool,
) -> EditorEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match client.next_event().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_text(client: &mut EditorClient, expected: &str) {
    if client.text().await == expected {
        return;
    }
    loop {
        wait_for(client, |e| *e == EditorEvent::RemoteUpdate).await;
        if client.text().await == expected {
            return;
        }
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_delivers_meta_state_and_presence() {
    let ts = TestServer::start(ServerConfig::default()).await;
    let id = ts.create("24h").await;

    let mut alice = ts.connect(&id).await;
    let meta = wait_for(&mut alice, |e| matches!(e, EditorEvent::Meta { .. })).await;
    assert_eq!(
        meta,
        EditorEvent::Meta {
            expires_at: START_MS + DAY_MS,
            ttl: Ttl::Day
        }
    );
    wait_for(&mut alice, |e| *e == EditorEvent::Synced).await;
    wait_for(&mut alice, |e| *e == EditorEvent::Presence(1)).await;
    assert!(alice.is_synced());

    let _bob = ts.connect(&id).await;
    wait_for(&mut alice, |e| *e == EditorEvent::Presence(2)).await;
}

#[tokio::test]
async fn test_edits_reach_other_editors_and_raw() {
    let ts = TestServer::start(ServerConfig::default()).await;
    let id = ts.create("24h").await;

    let mut alice = ts.connect(&id).await;
    let mut bob = ts.connect(&id).await;
    wait_for(&mut alice, |e| *e == EditorEvent::Presence(2)).await;
    wait_for(&mut bob, |e| *e == EditorEvent::Synced).await;

    alice.insert(0, "hello").await.unwrap();
    wait_for_text(&mut bob, "hello").await;
    assert_eq!(ts.server.host().document(&id).raw().await.unwrap(), "hello");

    bob.insert(5, " world").await.unwrap();
    wait_for_text(&mut alice, "hello world").await;

    // A late joiner gets everything in its first full state
    let mut carol = ts.connect(&id).await;
    wait_for(&mut carol, |e| *e == EditorEvent::Synced).await;
    assert_eq!(carol.text().await, "hello world");
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let ts = TestServer::start(ServerConfig::default()).await;
    let id = ts.create("7d").await;

    let mut alice = ts.connect(&id).await;
    let mut bob = ts.connect(&id).await;
    wait_for(&mut alice, |e| *e == EditorEvent::Synced).await;
    wait_for(&mut bob, |e| *e == EditorEvent::Synced).await;

    alice.insert(0, "AAA").await.unwrap();
    bob.insert(0, "BBB").await.unwrap();
    wait_for(&mut alice, |e| *e == EditorEvent::RemoteUpdate).await;
    wait_for(&mut bob, |e| *e == EditorEvent::RemoteUpdate).await;

    let merged = alice.text().await;
    assert_eq!(merged.len(), 6);
    assert_eq!(bob.text().await, merged);
    assert_eq!(ts.server.host().document(&id).raw().await.unwrap(), merged);
}

#[tokio::test]
async fn test_expiry_closes_open_editors() {
    let ts = TestServer::start(ServerConfig::default()).await;
    let id = ts.create("24h").await;

    let mut alice = ts.connect(&id).await;
    wait_for(&mut alice, |e| *e == EditorEvent::Synced).await;
    alice.insert(0, "short-lived").await.unwrap();

    ts.clock.advance(Duration::from_millis(DAY_MS));
    assert!(matches!(
        ts.server.host().document(&id).meta().await,
        Err(DocumentError::NotFound)
    ));

    wait_for(&mut alice, |e| *e == EditorEvent::Expired).await;
    let closed = wait_for(&mut alice, |e| matches!(e, EditorEvent::Closed { .. })).await;
    assert_eq!(closed, EditorEvent::Closed { code: Some(1000) });

    assert!(matches!(
        EditorClient::connect(&ts.url(&id)).await,
        Err(ClientError::Rejected(404))
    ));
}

#[tokio::test]
async fn test_missing_document_refused() {
    let ts = TestServer::start(ServerConfig::default()).await;
    let result = EditorClient::connect(&ts.url(&DocumentId::generate())).await;
    assert!(matches!(result, Err(ClientError::Rejected(404))));
}

#[tokio::test]
async fn test_full_document_refuses_editors() {
    let ts = TestServer::start(ServerConfig {
        limits: DocumentLimits {
            max_connections: 1,
            ..DocumentLimits::default()
        },
        ..ServerConfig::default()
    })
    .await;
    let id = ts.create("24h").await;

    let mut alice = ts.connect(&id).await;
    wait_for(&mut alice, |e| *e == EditorEvent::Synced).await;
    assert!(matches!(
        EditorClient::connect(&ts.url(&id)).await,
        Err(ClientError::Rejected(503))
    ));

    // The slot frees up once the first editor leaves
    alice.close().await;
    let mut admitted = None;
    for _ in 0..50 {
        match EditorClient::connect(&ts.url(&id)).await {
            Ok(client) => {
                admitted = Some(client);
                break;
            }
            Err(ClientError::Rejected(503)) => {
                tokio::time::sleep(Duration::from_millis(20)).await
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(admitted.is_some());
}

#[tokio::test]
async fn test_oversized_document_warns_editors() {
    let ts = TestServer::start(ServerConfig {
        limits: DocumentLimits {
            max_document_bytes: 1024,
            persist_debounce: Duration::from_millis(50),
            ..DocumentLimits::default()
        },
        ..ServerConfig::default()
    })
    .await;
    let id = ts.create("24h").await;

    let mut alice = ts.connect(&id).await;
    wait_for(&mut alice, |e| *e == EditorEvent::Synced).await;
    alice.insert(0, &"x".repeat(2048)).await.unwrap();

    let warning = wait_for(&mut alice, |e| matches!(e, EditorEvent::ServerError(_))).await;
    assert_eq!(
        warning,
        EditorEvent::ServerError("Document size limit exceeded (1KB)".to_string())
    );
}

#[tokio::test]
async fn test_garbage_frames_keep_channel_open() {
    let ts = TestServer::start(ServerConfig::default()).await;
    let id = ts.create("24h").await;

    let mut alice = ts.connect(&id).await;
    let mut bob = ts.connect(&id).await;
    wait_for(&mut bob, |e| *e == EditorEvent::Synced).await;

    alice.send_binary(vec![0x7f, 0x01]).unwrap();
    alice.send_text("{broken").unwrap();
    alice
        .send_text(r#"{"type":"awareness","state":{"cursor":1}}"#)
        .unwrap();
    alice.insert(0, "still here").await.unwrap();

    wait_for_text(&mut bob, "still here").await;
    alice.request_sync().unwrap();
    wait_for(&mut alice, |e| *e == EditorEvent::Synced).await;
    assert_eq!(alice.text().await, "still here");
}
