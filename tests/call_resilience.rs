mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use network::{BackoffPolicy, ChannelConfig, ConnectionState, FrameKind};
use pq_handshake::{CallEvent, CallState, CallType, NegotiatorConfig};
use support::{next_outcome, wait_for_state, Switchboard};

fn fast_backoff() -> ChannelConfig {
    ChannelConfig::default().with_backoff(BackoffPolicy {
        base: Duration::from_millis(10),
        ceiling: Duration::from_millis(50),
        max_attempts: 5,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callee_reconnects_then_takes_a_call() {
    let board = Switchboard::default();
    let alice = board.client("alice");
    let bob = board.client_with("bob", fast_backoff(), NegotiatorConfig::default());
    alice.channel.connect().await.expect("alice connects");
    bob.channel.connect().await.expect("bob connects");

    board.sever("bob").await;
    tokio::time::timeout(support::WAIT, async {
        while board.connections("bob") < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bob never reconnected");
    wait_for_state(&bob.channel, ConnectionState::Connected).await;
    assert_eq!(board.connections("bob"), 2);
    assert_eq!(bob.channel.backoff_state().attempts, 0);

    let mut events = bob.negotiator.subscribe();
    let call_id = alice
        .negotiator
        .start_call("bob", CallType::Audio)
        .await
        .expect("start call");
    assert!(matches!(
        next_outcome(&mut events, &call_id).await,
        CallEvent::Established { .. }
    ));
    assert_eq!(
        alice.negotiator.session_key(&call_id).await,
        bob.negotiator.session_key(&call_id).await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_recovery_reports_connection_error() {
    let board = Switchboard::default();
    let bob = board.client_with("bob", fast_backoff(), NegotiatorConfig::default());
    let errors = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&errors);
    bob.channel.register_handler(FrameKind::ConnectionError, move |_| {
        e.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    bob.channel.connect().await.expect("connect");

    board.refuse("bob");
    board.sever("bob").await;
    wait_for_state(&bob.channel, ConnectionState::Failed).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(bob.channel.backoff_state().attempts, 5);
    assert_eq!(board.connections("bob"), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bob.channel.state(), ConnectionState::Failed);

    board.admit("bob");
    bob.channel.connect().await.expect("explicit connect after failure");
    assert_eq!(bob.channel.state(), ConnectionState::Connected);
    assert_eq!(board.connections("bob"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_callee_times_out_the_call() {
    let board = Switchboard::default();
    let alice = board.client_with(
        "alice",
        ChannelConfig::default(),
        NegotiatorConfig::new().with_timeout(Duration::from_millis(300)),
    );
    alice.channel.connect().await.expect("connect");

    let mut events = alice.negotiator.subscribe();
    let call_id = alice
        .negotiator
        .start_call("dave", CallType::Audio)
        .await
        .expect("start call");
    match next_outcome(&mut events, &call_id).await {
        CallEvent::Failed { reason, .. } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(alice.negotiator.state(&call_id).await, Some(CallState::Failed));
    assert!(alice.negotiator.session_key(&call_id).await.is_none());
}
