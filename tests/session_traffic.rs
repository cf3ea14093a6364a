//! Scenarios around loss, retries, replay protection and pipelining on an
//! established session.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rustipmi::config::IpmiConfig;
use rustipmi::connection::events::ConnectionEvent;
use rustipmi::connection::state_machine::SessionState;
use rustipmi::error::IpmiError;
use rustipmi::manager::ConnectionManager;
use rustipmi::protocol::ipmi_lan::IpmiRequest;

use support::recorder::RecordingListener;
use support::{establish_session, MockBmc};

fn local() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

const QUIET_PING: Duration = Duration::from_secs(300);

fn echo_request(data: Vec<u8>) -> IpmiRequest {
    IpmiRequest {
        net_fn: 0x06,
        command: 0x42,
        data,
    }
}

/// Response loss: one initial send plus the configured retries appear on the
/// wire, the caller sees *response-timeout*, and the correlation machinery
/// keeps working afterwards.
#[tokio::test]
async fn test_response_timeout_after_retries() {
    let bmc = MockBmc::start().await;
    let manager = ConnectionManager::bind(
        local(),
        IpmiConfig {
            request_timeout: Duration::from_millis(100),
            retries: 2,
            ..IpmiConfig::default()
        },
    )
    .await
    .unwrap();

    let handle = establish_session(&manager, bmc.addr, QUIET_PING).await;

    bmc.set_drop_all(true).await;
    let before = bmc.datagrams_received().await;
    let result = manager.send_command(handle, echo_request(vec![1])).await;
    assert_eq!(result, Err(IpmiError::ResponseTimeout));
    assert_eq!(bmc.datagrams_received().await - before, 3);

    // a command timeout is not fatal to the session and the correlation key
    // was released
    let connection = manager.connection(handle).await.unwrap();
    assert_eq!(connection.state().await, SessionState::SessionValid);
    bmc.set_drop_all(false).await;
    let response = manager
        .send_command(handle, echo_request(vec![2]))
        .await
        .unwrap();
    assert_eq!(response.data, vec![2]);

    manager.close().await;
    bmc.stop().await;
}

/// Replay rejection: a validly sealed response with an already-seen sequence
/// number is dropped without firing listeners or disturbing the session.
#[tokio::test]
async fn test_replayed_response_is_dropped() {
    let bmc = MockBmc::start().await;
    let manager = ConnectionManager::bind(local(), IpmiConfig::default())
        .await
        .unwrap();
    let handle = establish_session(&manager, bmc.addr, QUIET_PING).await;
    let connection = manager.connection(handle).await.unwrap();

    // advance the BMC's outbound sequence well past the window start
    for i in 0..6u8 {
        manager
            .send_command(handle, echo_request(vec![i]))
            .await
            .unwrap();
    }

    let (listener, events) = RecordingListener::new();
    connection.register_listener(listener).await;

    let console_session_id = *bmc.state.lock().await.sessions.keys().next().unwrap();
    bmc.inject_stale_response(console_session_id, 5).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(events.lock().unwrap().is_empty(), "no listener may fire");
    assert_eq!(connection.state().await, SessionState::SessionValid);

    manager.close().await;
    bmc.stop().await;
}

/// Concurrent pipelining: 32 commands from 4 tasks get unique session
/// sequence numbers and every completion reaches the caller that issued it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pipelining() {
    let bmc = MockBmc::start().await;
    let manager = Arc::new(
        ConnectionManager::bind(local(), IpmiConfig::default())
            .await
            .unwrap(),
    );
    let handle = establish_session(&manager, bmc.addr, QUIET_PING).await;

    let mut joins = Vec::new();
    for task_id in 0..4u8 {
        let manager = manager.clone();
        joins.push(tokio::spawn(async move {
            for i in 0..8u8 {
                let marker = vec![task_id, i];
                let response = manager
                    .send_command(handle, echo_request(marker.clone()))
                    .await
                    .unwrap();
                assert_eq!(response.data, marker, "completion delivered to wrong caller");
            }
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    // 32 commands plus the privilege activation during session setup
    let seqs = bmc.state.lock().await.in_session_seqs.clone();
    assert_eq!(seqs.len(), 33);
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 33, "session sequence numbers must be unique");
    assert_eq!(
        *sorted.last().unwrap() - sorted[0] + 1,
        33,
        "outbound sequence numbers are issued without gaps"
    );

    manager.close().await;
    bmc.stop().await;
}

/// Keep-alive: with a short ping period an idle session emits no-op
/// commands and stays valid.
#[tokio::test]
async fn test_keep_alive_no_ops() {
    let bmc = MockBmc::start().await;
    let manager = ConnectionManager::bind(local(), IpmiConfig::default())
        .await
        .unwrap();
    let handle = establish_session(&manager, bmc.addr, Duration::from_millis(50)).await;
    let connection = manager.connection(handle).await.unwrap();
    let (listener, events) = RecordingListener::new();
    connection.register_listener(listener).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let pings = bmc.keep_alive_count().await;
    assert!(pings >= 4, "expected at least 4 keep-alives, saw {}", pings);
    assert_eq!(connection.state().await, SessionState::SessionValid);
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ConnectionEvent::SessionFailed(_))));

    manager.close().await;
    bmc.stop().await;
}

/// A keep-alive whose retry budget runs out fails the session and notifies
/// listeners.
#[tokio::test]
async fn test_keep_alive_exhaustion_fails_session() {
    let bmc = MockBmc::start().await;
    let manager = ConnectionManager::bind(
        local(),
        IpmiConfig {
            request_timeout: Duration::from_millis(50),
            retries: 1,
            ..IpmiConfig::default()
        },
    )
    .await
    .unwrap();
    let handle = establish_session(&manager, bmc.addr, Duration::from_millis(50)).await;
    let connection = manager.connection(handle).await.unwrap();
    let (listener, events) = RecordingListener::new();
    connection.register_listener(listener).await;

    bmc.set_drop_all(true).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(connection.state().await, SessionState::Failed);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ConnectionEvent::SessionFailed(_))));

    manager.close().await;
    bmc.stop().await;
}
