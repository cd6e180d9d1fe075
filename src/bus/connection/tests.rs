use super::*;
use crate::bus::MockBroker;

fn manager(broker: &MockBroker, max_attempts: u32) -> Arc<ConnectionManager> {
    ConnectionManager::new(
        Arc::new(broker.clone()),
        ReconnectPolicy::new(Duration::from_secs(5), max_attempts),
    )
}

async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    let mut states = manager.watch_state();
    while *states.borrow_and_update() != target {
        states.changed().await.expect("state channel closed");
    }
}

#[test]
fn test_default_policy() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.delay, Duration::from_millis(5000));
    assert_eq!(policy.max_attempts, 10);
    assert_eq!(policy.budget().count(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_connects_once_and_reuses_channel() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let first = manager.acquire_channel().await.unwrap();
    let second = manager.acquire_channel().await.unwrap();

    assert!(same_channel(&first, &second));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_triggers_single_attempt() {
    let broker = MockBroker::new();
    broker.set_connect_delay(Duration::from_millis(250));
    let manager = manager(&broker, 3);

    let callers = (0..16).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire_channel().await })
    });
    let channels: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(broker.connect_attempts(), 1);
    assert!(channels.iter().all(|c| same_channel(c, &channels[0])));
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connection_loss() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    let before = manager.acquire_channel().await.unwrap();

    broker.drop_connections("CONNECTION_FORCED");
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    assert_eq!(manager.retry_count(), 1);

    let started = tokio::time::Instant::now();
    let after = manager.acquire_channel().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(!same_channel(&before, &after));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.retry_count(), 0);
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_during_reconnect_fail_together() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    manager.acquire_channel().await.unwrap();

    broker.set_unavailable(true);
    broker.drop_connections("broker down");
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    let waiters = (0..5).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire_channel().await })
    });
    let errors: Vec<String> = futures::future::join_all(waiters)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().err().expect("acquire_channel should fail").to_string())
        .collect();

    assert!(errors.iter().all(|e| e == &errors[0]));
    // One initial connect plus one reconnect attempt shared by all waiters.
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_during_reconnect_succeed_together() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    manager.acquire_channel().await.unwrap();

    broker.drop_connections("broker restart");
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    let waiters = (0..5).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire_channel().await })
    });
    let channels: Vec<_> = futures::future::join_all(waiters)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(channels.iter().all(|c| same_channel(c, &channels[0])));
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connects_when_an_attempt_within_budget_succeeds() {
    let broker = MockBroker::new();
    broker.fail_next_connects(3);
    let manager = manager(&broker, 3);

    // Initial attempt fails and schedules reconnection.
    assert!(manager.acquire_channel().await.is_err());
    assert_eq!(manager.state(), ConnectionState::Reconnecting);

    wait_for_state(&manager, ConnectionState::Connected).await;

    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(manager.retry_count(), 0);
    assert!(manager.acquire_channel().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_enters_failed_when_budget_exhausted() {
    let broker = MockBroker::new();
    broker.set_unavailable(true);
    let manager = manager(&broker, 3);

    assert!(matches!(
        manager.acquire_channel().await,
        Err(BusError::Connection(_))
    ));
    wait_for_state(&manager, ConnectionState::Failed).await;
    assert_eq!(broker.connect_attempts(), 4);

    // Failed is terminal: no further attempts, even once the broker is back.
    broker.set_unavailable(false);
    let result = manager.acquire_channel().await;
    assert!(matches!(result, Err(BusError::Fatal { attempts: 3, .. })));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_last_waiters_receive_fatal_error() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 1);
    manager.acquire_channel().await.unwrap();

    broker.set_unavailable(true);
    broker.drop_connections("broker down");
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    let result = manager.acquire_channel().await;

    assert!(matches!(result, Err(BusError::Fatal { attempts: 1, .. })));
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_budget_resets_after_successful_reconnect() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 2);
    manager.acquire_channel().await.unwrap();

    for _ in 0..4 {
        broker.fail_next_connects(1);
        broker.drop_connections("flap");
        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        wait_for_state(&manager, ConnectionState::Connected).await;
    }

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(broker.connect_attempts(), 1 + 4 * 2);
}

#[tokio::test(start_paused = true)]
async fn test_report_fault_reconnects_current_channel_only() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    let stale = manager.acquire_channel().await.unwrap();

    manager.report_fault(&stale, "PRECONDITION_FAILED");
    assert_eq!(manager.state(), ConnectionState::Reconnecting);

    let fresh = manager.acquire_channel().await.unwrap();
    assert_eq!(broker.connect_attempts(), 2);

    // A late report about the replaced channel changes nothing.
    manager.report_fault(&stale, "PRECONDITION_FAILED");
    assert_eq!(manager.state(), ConnectionState::Connected);
    let current = manager.acquire_channel().await.unwrap();
    assert!(same_channel(&fresh, &current));
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_channel_then_connection() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    manager.acquire_channel().await.unwrap();

    manager.shutdown().await;

    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(broker.channel_closes(), 1);
    assert_eq!(broker.connection_closes(), 1);
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(
        manager.acquire_channel().await,
        Err(BusError::ShutDown)
    ));

    // Second shutdown is a no-op.
    manager.shutdown().await;
    assert_eq!(broker.channel_closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_reconnect() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    manager.acquire_channel().await.unwrap();

    broker.drop_connections("broker restart");
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire_channel().await })
    };
    tokio::task::yield_now().await;

    manager.shutdown().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(matches!(waiter.await.unwrap(), Err(BusError::ShutDown)));
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_connection_opened_during_shutdown_is_closed_even_if_attempt_aborted() {
    let broker = MockBroker::new();
    let manager = manager(&broker, 3);
    broker.set_connect_delay(Duration::from_secs(1));
    broker.set_close_delay(Duration::from_secs(1));

    let attempt = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run_attempt().await })
    };
    tokio::task::yield_now().await;
    manager.shutdown().await;

    // Connect finishes after shutdown; the close of that session is now underway.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    attempt.abort();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.channel_closes(), 1);
    assert_eq!(broker.connection_closes(), 1);
    assert_eq!(broker.open_connections(), 0);
}
