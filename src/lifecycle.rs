//! Connection lifecycle controller.
//!
//! Owns the connect/disconnect/reconnect state machine for one session:
//! `Idle -> Connecting -> Connected -> Disconnecting -> Idle`, with a
//! scheduled-retry sub-state after an unrequested disconnect. The read
//! loop runs here; UI-triggered commands and the retry timer run on their
//! own tasks and synchronize through the session's locks.
//!
//! Transition rules enforced:
//! - `connect()` panics while disconnecting (programmer error), is a
//!   no-op while connecting or connected, and otherwise clears the
//!   user-disconnect flag and any pending retry before opening the
//!   transport.
//! - The attempt counter resets to 0 on successful registration and is
//!   consulted-then-incremented on each failure.
//! - Credential rejection is treated like a user-driven disconnect: no
//!   retry is scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collab::{Connector, TransportHandle};
use crate::config::{EngineConfig, ReconnectRule};
use crate::error::{ConnectError, DisconnectReason};
use crate::event::ConnectionInfo;
use crate::proto::Message;
use crate::registry::report_dispatch_error;
use crate::session::Session;

/// Maps a reconnect attempt index to a wait, or stops the sequence.
pub trait BackoffPolicy: Send + Sync {
    fn delay_for(&self, attempt: u32) -> Option<Duration>;
}

/// Rule-list backoff: each rule covers `repeat` attempts at `delay_ms`;
/// a rule without a repeat count, or the final rule once all counts are
/// exhausted, applies to every remaining attempt. No rules disables
/// reconnection.
pub struct RuleBackoff {
    rules: Vec<ReconnectRule>,
}

impl RuleBackoff {
    pub fn new(rules: Vec<ReconnectRule>) -> RuleBackoff {
        RuleBackoff { rules }
    }
}

impl BackoffPolicy for RuleBackoff {
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let mut covered = 0u32;
        for rule in &self.rules {
            match rule.repeat {
                None => return Some(rule.delay()),
                Some(repeat) => {
                    covered = covered.saturating_add(repeat);
                    if attempt < covered {
                        return Some(rule.delay());
                    }
                }
            }
        }
        self.rules.last().map(ReconnectRule::delay)
    }
}

struct RetryHandle {
    queued_at: Instant,
    delay: Duration,
    /// Single-use token closing the race between the timer firing and a
    /// cancel: whoever swaps it first wins.
    armed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RetryHandle {
    fn cancel(self) {
        self.armed.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

#[derive(Default)]
struct LifecycleState {
    connecting: bool,
    connected: bool,
    disconnecting: bool,
    user_requested_disconnect: bool,
    attempt: u32,
    retry: Option<RetryHandle>,
    /// Task running the current connect attempt, if any. Aborted when the
    /// user disconnects while the connector is still resolving.
    attempt_task: Option<JoinHandle<()>>,
    /// Force-close handle of the live transport.
    shutdown: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Channels to rejoin after the next successful registration.
    rejoin: Vec<String>,
}

pub struct ConnectionController {
    session: Arc<Session>,
    connector: Arc<dyn Connector>,
    backoff: Arc<dyn BackoffPolicy>,
    config: EngineConfig,
    state: Mutex<LifecycleState>,
}

impl ConnectionController {
    pub fn new(
        session: Arc<Session>,
        connector: Arc<dyn Connector>,
        config: EngineConfig,
    ) -> Arc<ConnectionController> {
        let backoff = Arc::new(RuleBackoff::new(config.reconnect_rules.clone()));
        ConnectionController::with_backoff(session, connector, config, backoff)
    }

    pub fn with_backoff(
        session: Arc<Session>,
        connector: Arc<dyn Connector>,
        config: EngineConfig,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Arc<ConnectionController> {
        Arc::new(ConnectionController {
            session,
            connector,
            backoff,
            config,
            state: Mutex::new(LifecycleState::default()),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let state = self.state.lock();
        ConnectionInfo {
            connected: state.connected,
            connecting: state.connecting,
            disconnecting: state.disconnecting,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.state.lock().attempt
    }

    pub fn retry_scheduled(&self) -> bool {
        self.state.lock().retry.is_some()
    }

    /// Start a connection attempt.
    ///
    /// # Panics
    ///
    /// Panics if called while a disconnect is in progress; callers must
    /// wait for the disconnected notification first.
    pub fn connect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.disconnecting {
                panic!("connect() called while disconnecting");
            }
            if state.connecting || state.connected {
                return;
            }
            if let Some(retry) = state.retry.take() {
                retry.cancel();
            }
            state.connecting = true;
            state.user_requested_disconnect = false;
        }
        self.push_info();
        let controller = Arc::clone(self);
        let task = tokio::spawn(async move {
            controller.run_attempt().await;
        });
        self.state.lock().attempt_task = Some(task);
    }

    /// User-requested disconnect. Cancels any scheduled retry. With a live
    /// transport, sends QUIT and forces it closed, and the normal severed
    /// path finishes the teardown. With a connect attempt still resolving,
    /// the attempt task is aborted and the teardown completes here.
    pub async fn disconnect(self: &Arc<Self>) {
        enum Teardown {
            Idle,
            Quit(Arc<dyn Fn() + Send + Sync>),
            AbortAttempt(Option<JoinHandle<()>>),
        }
        let teardown = {
            let mut state = self.state.lock();
            state.user_requested_disconnect = true;
            if let Some(retry) = state.retry.take() {
                retry.cancel();
            }
            if !state.connected && !state.connecting {
                state.attempt = 0;
                Teardown::Idle
            } else if let Some(shutdown) = state.shutdown.clone() {
                state.disconnecting = true;
                Teardown::Quit(shutdown)
            } else {
                // The connector has not produced a transport yet.
                state.connecting = false;
                state.disconnecting = true;
                Teardown::AbortAttempt(state.attempt_task.take())
            }
        };
        self.push_info();
        match teardown {
            Teardown::Idle => {}
            Teardown::Quit(shutdown) => {
                self.session
                    .send(Message::cmd("QUIT", &[&self.config.quit_message]))
                    .await;
                shutdown();
            }
            Teardown::AbortAttempt(task) => {
                if let Some(task) = task {
                    task.abort();
                }
                self.finish_disconnect(DisconnectReason::Requested, false).await;
            }
        }
    }

    /// Connectivity-restored notification. A lost-connectivity signal
    /// needs no handling here: in-flight I/O fails on its own and drives
    /// the normal failure path.
    pub fn on_connectivity_restored(self: &Arc<Self>) {
        let Some(retry) = ({
            let mut state = self.state.lock();
            if state.connected || state.connecting || state.user_requested_disconnect {
                return;
            }
            state.retry.take()
        }) else {
            return;
        };
        let elapsed = retry.queued_at.elapsed();
        let remaining = retry.delay.saturating_sub(elapsed);
        retry.cancel();
        if self.config.reconnect_on_connectivity_restore || remaining.is_zero() {
            info!("connectivity restored, reconnecting now");
            self.connect();
        } else {
            // Credit the time already waited and re-arm for the rest.
            debug!(?remaining, "connectivity restored, shortening retry");
            self.arm_retry(remaining);
        }
    }

    async fn run_attempt(self: &Arc<Self>) {
        let attempt = self.state.lock().attempt;
        info!(attempt, "opening transport");
        match self.connector.connect().await {
            Ok(transport) => {
                // The user may have asked for a disconnect while the
                // transport was still opening.
                let aborted = {
                    let state = self.state.lock();
                    state.user_requested_disconnect || state.disconnecting
                };
                if aborted {
                    (transport.shutdown)();
                    // disconnect() may have finished the teardown already
                    // after aborting this task.
                    let finish = {
                        let mut state = self.state.lock();
                        state.connecting = false;
                        state.disconnecting
                    };
                    if finish {
                        self.finish_disconnect(DisconnectReason::Requested, false).await;
                    }
                } else {
                    self.run_session(transport).await;
                }
            }
            Err(ConnectError::CredentialRejected) => {
                warn!("credential rejected, not retrying");
                self.state.lock().connecting = false;
                self.finish_disconnect(DisconnectReason::CredentialRejected, false)
                    .await;
            }
            Err(err) => {
                warn!(error = %err, "connect attempt failed");
                let user_requested = {
                    let mut state = self.state.lock();
                    state.connecting = false;
                    state.user_requested_disconnect
                };
                self.finish_disconnect(
                    DisconnectReason::ConnectFailed(err.to_string()),
                    !user_requested,
                )
                .await;
            }
        }
    }

    async fn run_session(self: &Arc<Self>, transport: TransportHandle) {
        let TransportHandle {
            mut incoming,
            outgoing,
            shutdown,
        } = transport;
        self.session.attach_outbound(outgoing);
        self.state.lock().shutdown = Some(shutdown);

        let (registered_tx, mut registered_rx) = mpsc::unbounded_channel();
        self.session.set_registered_signal(registered_tx);

        // Registration burst. Capability negotiation runs interleaved
        // with these; CAP END goes out once the LS listing is processed.
        self.session.send_raw("CAP LS 302".to_owned()).await;
        self.session
            .send(Message::cmd("NICK", &[&self.config.nick]))
            .await;
        self.session
            .send_raw(format!(
                "USER {} 0 * :{}",
                self.config.username, self.config.realname
            ))
            .await;

        loop {
            tokio::select! {
                line = incoming.recv() => match line {
                    Some(line) => self.dispatch_line(line).await,
                    None => break,
                },
                Some(()) = registered_rx.recv() => self.on_registered().await,
            }
        }

        let user_requested = {
            let state = self.state.lock();
            state.user_requested_disconnect
        };
        let reason = if user_requested {
            DisconnectReason::Requested
        } else {
            DisconnectReason::Severed("connection closed".to_owned())
        };
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.connecting = false;
        }
        self.finish_disconnect(reason, !user_requested).await;
    }

    async fn dispatch_line(self: &Arc<Self>, line: String) {
        match line.parse::<Message>() {
            Ok(msg) => {
                if let Err(err) = self.session.registry().dispatch(&self.session, &msg).await {
                    report_dispatch_error(&err, &line);
                }
            }
            Err(err) => report_dispatch_error(&err, &line),
        }
    }

    async fn on_registered(self: &Arc<Self>) {
        let rejoin = {
            let mut state = self.state.lock();
            state.connecting = false;
            state.connected = true;
            state.attempt = 0;
            std::mem::take(&mut state.rejoin)
        };
        self.push_info();

        for command in &self.config.post_connect_commands {
            self.session.send_raw(command.clone()).await;
        }
        let mut channels = self.config.autojoin.clone();
        if self.config.rejoin_on_reconnect {
            channels.extend(rejoin);
        }
        channels.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        for channel in channels {
            self.session.send(Message::cmd("JOIN", &[&channel])).await;
        }
    }

    /// Shared tail of every disconnect path: remember channels for
    /// rejoin, reset the session, notify, and schedule a retry when
    /// allowed.
    async fn finish_disconnect(self: &Arc<Self>, reason: DisconnectReason, retry_allowed: bool) {
        let channels = self.session.channel_names();
        {
            let mut state = self.state.lock();
            state.disconnecting = false;
            state.shutdown = None;
            state.attempt_task = None;
            if retry_allowed && self.config.rejoin_on_reconnect && !channels.is_empty() {
                state.rejoin = channels;
            }
        }
        self.session.reset().await;
        self.session.notify_disconnected(&reason);
        self.push_info();
        if retry_allowed {
            self.schedule_retry();
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        // Consult the policy with the current attempt index, then count
        // this failure.
        let attempt = {
            let mut state = self.state.lock();
            let attempt = state.attempt;
            state.attempt = state.attempt.saturating_add(1);
            attempt
        };
        let Some(delay) = self.backoff.delay_for(attempt) else {
            info!(attempt, "backoff policy exhausted, not reconnecting");
            return;
        };
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.arm_retry(delay);
    }

    fn arm_retry(self: &Arc<Self>, delay: Duration) {
        let armed = Arc::new(AtomicBool::new(true));
        let task_armed = Arc::clone(&armed);
        let controller = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The token is the authority, not task abortion: a cancelled
            // retry must never fire late.
            if !task_armed.swap(false, Ordering::SeqCst) {
                return;
            }
            controller.state.lock().retry = None;
            controller.connect();
        });
        self.state.lock().retry = Some(RetryHandle {
            queued_at: Instant::now(),
            delay,
            armed,
            task,
        });
    }

    fn push_info(&self) {
        self.session.notify_connection_info(self.connection_info());
    }
}
