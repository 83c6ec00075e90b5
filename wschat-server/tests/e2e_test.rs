//! End-to-End tests for the wschat relay
//!
//! Two full client sessions exchange encrypted text through an in-process
//! relay, with keep-alive pings running against the default liveness window.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use wschat_core::crypto::{KeyPair, Password};
use wschat_core::identity;
use wschat_core::{
    ChatSession, ClientConfig, Envelope, Identity, RetryPolicy, ViewState,
};
use wschat_server::{ConnectionSettings, RelayRegistry, RelayServer};

const TEST_ITERATIONS: u32 = 1_000;

async fn start_relay() -> (String, Arc<RelayRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let registry = Arc::new(RelayRegistry::new());
    let server = RelayServer::new(registry.clone(), ConnectionSettings::default(), "ws");
    tokio::spawn(server.serve(listener));
    (addr, registry)
}

fn plain_config(addr: &str) -> ClientConfig {
    let mut config = ClientConfig::new(addr);
    config.tls = false;
    config.iterations = TEST_ITERATIONS;
    config.ping_interval_ms = 500;
    config.reconnect_backoff_ms = 100;
    config
}

/// Two identities that have exchanged key shares
fn introduced_pair() -> (Identity, Identity) {
    let alice = Identity::new("alice");
    let bob = Identity::new("bob");
    let alice_knows_bob = alice.add_contact_from_keyshare(&bob.keyshare()).unwrap();
    let bob_knows_alice = bob.add_contact_from_keyshare(&alice.keyshare()).unwrap();
    (alice_knows_bob, bob_knows_alice)
}

async fn next_inbound(inbound: &mut UnboundedReceiver<Envelope>) -> Envelope {
    timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("Timeout waiting for message")
        .expect("Inbound channel closed")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

#[tokio::test]
async fn test_two_sessions_exchange_messages() {
    let (addr, registry) = start_relay().await;
    let (alice, bob) = introduced_pair();
    let alice_id = alice.id().to_string();
    let bob_id = bob.id().to_string();

    let (alice_session, mut alice_inbox) = ChatSession::new(alice, plain_config(&addr));
    let (bob_session, mut bob_inbox) = ChatSession::new(bob, plain_config(&addr));
    alice_session.start().await.unwrap();
    bob_session.start().await.unwrap();
    wait_until(|| registry.is_online(&alice_id) && registry.is_online(&bob_id)).await;

    alice_session.send_text(&bob_id, "hello").await.unwrap();
    let opened = bob_session.open(&next_inbound(&mut bob_inbox).await).unwrap();
    assert_eq!(opened.text, "hello");
    assert_eq!(opened.from_id, alice_id);
    assert_eq!(opened.username.as_deref(), Some("alice"));
    assert!(!opened.is_delayed());
    assert!(opened.should_notify(&ViewState { background: true }));

    bob_session.send_text(&alice_id, "hi").await.unwrap();
    let opened = alice_session.open(&next_inbound(&mut alice_inbox).await).unwrap();
    assert_eq!(opened.text, "hi");
    assert_eq!(opened.username.as_deref(), Some("bob"));

    alice_session.stop().await.unwrap();
    bob_session.stop().await.unwrap();
}

#[tokio::test]
async fn test_queued_hello_then_immediate_reply() {
    let (addr, registry) = start_relay().await;
    let a_id = "a".repeat(64);
    let b_id = "b".repeat(64);
    let a = Identity::from_parts(a_id.clone(), "a".to_string(), KeyPair::generate(), vec![])
        .unwrap();
    let b = Identity::from_parts(b_id.clone(), "b".to_string(), KeyPair::generate(), vec![])
        .unwrap();
    let a_share = a.keyshare();
    let a = a.add_contact_from_keyshare(&b.keyshare()).unwrap();
    let b = b.add_contact_from_keyshare(&a_share).unwrap();

    let (a_session, mut a_inbox) = ChatSession::new(a, plain_config(&addr));
    a_session.start().await.unwrap();
    a_session.send_text(&b_id, "hello").await.unwrap();
    wait_until(|| registry.pending_count(&b_id) == 1).await;

    let (b_session, mut b_inbox) = ChatSession::new(b, plain_config(&addr));
    b_session.start().await.unwrap();
    let queued = next_inbound(&mut b_inbox).await;
    assert_eq!(queued.from_id, a_id);
    assert_eq!(b_session.open(&queued).unwrap().text, "hello");
    assert_eq!(registry.pending_count(&b_id), 0);

    assert!(registry.is_online(&a_id));
    b_session.send_text(&a_id, "hi").await.unwrap();
    let reply = a_session.open(&next_inbound(&mut a_inbox).await).unwrap();
    assert_eq!(reply.text, "hi");
    assert_eq!(reply.username.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_keep_alive_outlasts_liveness_window() {
    let (addr, registry) = start_relay().await;
    let (alice, bob) = introduced_pair();
    let bob_id = bob.id().to_string();

    let (alice_session, _alice_inbox) = ChatSession::new(alice, plain_config(&addr));
    let (bob_session, mut bob_inbox) = ChatSession::new(bob, plain_config(&addr));
    alice_session.start().await.unwrap();
    bob_session.start().await.unwrap();
    wait_until(|| registry.is_online(&bob_id)).await;

    // Longer than the relay's three second window
    sleep(Duration::from_secs(4)).await;
    assert!(registry.is_online(&bob_id));

    alice_session.send_text(&bob_id, "still there?").await.unwrap();
    let opened = bob_session.open(&next_inbound(&mut bob_inbox).await).unwrap();
    assert_eq!(opened.text, "still there?");
}

#[tokio::test]
async fn test_offline_recipient_receives_on_connect() {
    let (addr, registry) = start_relay().await;
    let (alice, bob) = introduced_pair();
    let bob_id = bob.id().to_string();

    let (alice_session, _alice_inbox) = ChatSession::new(alice, plain_config(&addr));
    alice_session.start().await.unwrap();

    alice_session.send_text(&bob_id, "one").await.unwrap();
    alice_session.send_text(&bob_id, "two").await.unwrap();
    wait_until(|| registry.pending_count(&bob_id) == 2).await;

    let (bob_session, mut bob_inbox) = ChatSession::new(bob, plain_config(&addr));
    bob_session.start().await.unwrap();

    let first = bob_session.open(&next_inbound(&mut bob_inbox).await).unwrap();
    let second = bob_session.open(&next_inbound(&mut bob_inbox).await).unwrap();
    assert_eq!(first.text, "one");
    assert_eq!(second.text, "two");
    assert_eq!(registry.pending_count(&bob_id), 0);
}

#[tokio::test]
async fn test_unlocked_keystore_session() {
    let (addr, registry) = start_relay().await;
    let (alice, bob) = introduced_pair();
    let bob_id = bob.id().to_string();

    let password = Password::from("correct horse");
    let blob = identity::save(&bob, &password, TEST_ITERATIONS).unwrap();

    let (bob_session, mut bob_inbox) =
        ChatSession::unlock(plain_config(&addr), &blob, password).unwrap();
    assert_eq!(bob_session.identity().id(), bob_id);
    bob_session.start().await.unwrap();
    wait_until(|| registry.is_online(&bob_id)).await;

    let (alice_session, _alice_inbox) = ChatSession::new(alice, plain_config(&addr));
    alice_session.start().await.unwrap();
    alice_session.send_text(&bob_id, "unlocked").await.unwrap();

    let opened = bob_session.open(&next_inbound(&mut bob_inbox).await).unwrap();
    assert_eq!(opened.text, "unlocked");
}

#[tokio::test]
async fn test_send_gives_up_when_relay_unreachable() {
    let (alice, bob) = introduced_pair();
    let bob_id = bob.id().to_string();

    // Dial a port nothing is listening on yet
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap().to_string();
    drop(probe);

    let (alice_session, _inbox) = ChatSession::new(alice, plain_config(&addr));
    let alice_session =
        alice_session.with_retry_policy(RetryPolicy::new(3, Duration::from_millis(10)));
    assert!(alice_session.start().await.is_err());
    assert!(alice_session.send_text(&bob_id, "nobody home").await.is_err());
}
