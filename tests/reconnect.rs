//! Lifecycle controller properties: backoff schedule, attempt counter,
//! disconnect semantics and connectivity re-evaluation. Time is paused;
//! the runtime auto-advances through scheduled retries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use ircore::config::{EngineConfig, ReconnectRule};
use ircore::error::DisconnectReason;
use ircore::lifecycle::ConnectionController;
use ircore::session::Session;

use common::{FakeDirectory, FakeStorage, RecordingObserver, ScriptedConnector, TestRemote};

fn rule(repeat: Option<u32>, delay_ms: u64) -> ReconnectRule {
    ReconnectRule { repeat, delay_ms }
}

fn controller_with(
    config: EngineConfig,
    script: &str,
) -> (
    Arc<ConnectionController>,
    Arc<ScriptedConnector>,
    mpsc::UnboundedReceiver<TestRemote>,
    Arc<RecordingObserver>,
) {
    common::init_tracing();
    let session = Session::new(&config, FakeDirectory::new(), FakeStorage::new());
    let observer = RecordingObserver::new();
    session.add_observer(observer.clone());
    let (connector, remotes) = ScriptedConnector::scripted(script);
    let controller = ConnectionController::new(session, connector.clone(), config);
    (controller, connector, remotes, observer)
}

fn base_config() -> EngineConfig {
    EngineConfig {
        nick: "alice".to_owned(),
        autojoin: Vec::new(),
        reconnect_rules: vec![rule(Some(3), 1_000), rule(None, 5_000)],
        ..EngineConfig::default()
    }
}

/// Poll a condition while letting paused time auto-advance.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Poll without sleeping, so paused time cannot advance.
async fn settle(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached without time advancing");
}

/// Drive the registration handshake from the server side.
async fn register(remote: &mut TestRemote, nick: &str) {
    remote.expect_containing("USER").await;
    remote.send(&format!(":srv 001 {nick} :Welcome")).await;
}

#[tokio::test(start_paused = true)]
async fn attempt_counter_counts_failures_and_resets_on_registration() {
    let (controller, connector, mut remotes, _) = controller_with(base_config(), "fffa");
    controller.connect();

    // Three failures, then the fourth attempt is accepted.
    wait_for(|| connector.connect_count() == 4).await;
    assert_eq!(controller.attempt(), 3);

    let mut remote = remotes.recv().await.unwrap();
    register(&mut remote, "alice").await;
    wait_for(|| controller.connection_info().connected).await;
    assert_eq!(controller.attempt(), 0);
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "while disconnecting")]
async fn connect_while_disconnecting_is_a_programmer_error() {
    let (controller, _, mut remotes, _) = controller_with(base_config(), "a");
    controller.connect();
    let mut remote = remotes.recv().await.unwrap();
    register(&mut remote, "alice").await;
    wait_for(|| controller.connection_info().connected).await;

    // Live-connection teardown completes on the session task; until it
    // runs, the controller is still disconnecting.
    controller.disconnect().await;
    controller.connect();
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_handshake_aborts_the_attempt() {
    let (controller, connector, _remotes, observer) = controller_with(base_config(), "h");
    controller.connect();
    settle(|| connector.connect_count() == 1).await;

    // The connector never resolves; disconnect must not wait for it.
    controller.disconnect().await;
    let info = controller.connection_info();
    assert!(!info.connecting && !info.disconnecting);
    assert!(!controller.retry_scheduled());
    assert!(observer
        .disconnects
        .lock()
        .contains(&DisconnectReason::Requested));

    // The controller is immediately usable again.
    controller.connect();
    settle(|| connector.connect_count() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn connect_is_noop_while_connected() {
    let (controller, connector, mut remotes, _) = controller_with(base_config(), "a");
    controller.connect();
    let mut remote = remotes.recv().await.unwrap();
    register(&mut remote, "alice").await;
    wait_for(|| controller.connection_info().connected).await;

    controller.connect();
    controller.connect();
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn user_disconnect_sends_quit_and_schedules_no_retry() {
    let (controller, connector, mut remotes, observer) = controller_with(base_config(), "a");
    controller.connect();
    let mut remote = remotes.recv().await.unwrap();
    register(&mut remote, "alice").await;
    wait_for(|| controller.connection_info().connected).await;

    controller.disconnect().await;
    let quit = remote.expect_containing("QUIT").await;
    assert!(quit.contains(&EngineConfig::default().quit_message));

    wait_for(|| !controller.connection_info().connected).await;
    assert!(!controller.retry_scheduled());
    assert_eq!(connector.connect_count(), 1);
    assert!(observer
        .disconnects
        .lock()
        .contains(&DisconnectReason::Requested));
}

#[tokio::test(start_paused = true)]
async fn severed_connection_reconnects_and_rejoins_channels() {
    let config = EngineConfig {
        autojoin: vec!["#home".to_owned()],
        ..base_config()
    };
    let (controller, connector, mut remotes, observer) = controller_with(config, "a");
    controller.connect();

    let mut remote = remotes.recv().await.unwrap();
    register(&mut remote, "alice").await;
    remote.expect_containing("JOIN #home").await;
    remote.send(":alice!a@h JOIN #chat").await;
    wait_for(|| controller.session().channel("#chat").is_some()).await;

    // Sever from the server side.
    drop(remote);
    wait_for(|| connector.connect_count() == 2).await;
    assert!(observer
        .disconnects
        .lock()
        .iter()
        .any(|r| matches!(r, DisconnectReason::Severed(_))));

    let mut remote = remotes.recv().await.unwrap();
    register(&mut remote, "alice").await;
    remote.expect_containing("JOIN #home").await;
    remote.expect_containing("JOIN #chat").await;
}

#[tokio::test(start_paused = true)]
async fn credential_rejection_suppresses_retry() {
    let (controller, connector, _remotes, observer) = controller_with(base_config(), "r");
    controller.connect();

    wait_for(|| {
        observer
            .disconnects
            .lock()
            .contains(&DisconnectReason::CredentialRejected)
    })
    .await;
    assert!(!controller.retry_scheduled());
    // Ample virtual time has passed inside wait_for; still one attempt.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn connectivity_restore_reconnects_immediately() {
    let config = EngineConfig {
        reconnect_rules: vec![rule(None, 3_600_000)],
        reconnect_on_connectivity_restore: true,
        ..base_config()
    };
    let (controller, connector, _remotes, _) = controller_with(config, "fa");
    controller.connect();

    settle(|| connector.connect_count() == 1 && controller.retry_scheduled()).await;

    controller.on_connectivity_restored();
    settle(|| connector.connect_count() == 2).await;
    assert!(!controller.retry_scheduled());
}

#[tokio::test(start_paused = true)]
async fn connectivity_restore_can_shorten_instead() {
    let config = EngineConfig {
        reconnect_rules: vec![rule(None, 3_600_000)],
        reconnect_on_connectivity_restore: false,
        ..base_config()
    };
    let (controller, connector, _remotes, _) = controller_with(config, "fa");
    controller.connect();

    settle(|| connector.connect_count() == 1 && controller.retry_scheduled()).await;

    // No immediate reconnect; the retry is re-armed with the time
    // already waited credited.
    controller.on_connectivity_restored();
    assert_eq!(connector.connect_count(), 1);
    assert!(controller.retry_scheduled());

    tokio::time::sleep(Duration::from_secs(2 * 3_600)).await;
    wait_for(|| connector.connect_count() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_retry_never_fires_late() {
    let (controller, connector, _remotes, _) = controller_with(base_config(), "fh");
    controller.connect();
    settle(|| connector.connect_count() == 1 && controller.retry_scheduled()).await;

    // User disconnect cancels the scheduled retry.
    controller.disconnect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.connect_count(), 1);
}
