//! In-memory fakes for the external collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ircore::collab::{
    ChannelMeta, Connector, Directory, Storage, TransportHandle, UserId,
};
use ircore::error::{ConnectError, DisconnectReason};
use ircore::event::{ChatEvent, ConnectionInfo, SessionObserver};
use ircore::proto::Message;
use ircore::session::Session;

static TRACING: Once = Once::new();

/// Route engine logs through the test harness, honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Nick-keyed identity map with presence bookkeeping. Counts batched
/// resolutions so tests can assert the one-call-per-listing contract.
#[derive(Default)]
pub struct FakeDirectory {
    next_id: AtomicU64,
    by_nick: Mutex<HashMap<String, UserId>>,
    nicks: Mutex<HashMap<UserId, String>>,
    presence: Mutex<HashMap<UserId, HashSet<String>>>,
    pub batch_calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn new() -> Arc<FakeDirectory> {
        Arc::new(FakeDirectory::default())
    }

    fn resolve_sync(&self, nick: &str) -> UserId {
        let mut by_nick = self.by_nick.lock();
        if let Some(&id) = by_nick.get(&nick.to_lowercase()) {
            return id;
        }
        let id = UserId(self.next_id.fetch_add(1, Ordering::SeqCst));
        by_nick.insert(nick.to_lowercase(), id);
        self.nicks.lock().insert(id, nick.to_owned());
        id
    }

    pub fn batch_call_count(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn resolve(&self, nick: &str, _user: Option<&str>, _host: Option<&str>) -> UserId {
        self.resolve_sync(nick)
    }

    async fn resolve_batch(&self, nicks: &[String]) -> HashMap<String, UserId> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        nicks
            .iter()
            .map(|n| (n.clone(), self.resolve_sync(n)))
            .collect()
    }

    async fn update_nick(&self, id: UserId, new_nick: &str) {
        let mut by_nick = self.by_nick.lock();
        let mut nicks = self.nicks.lock();
        if let Some(old) = nicks.insert(id, new_nick.to_owned()) {
            by_nick.remove(&old.to_lowercase());
        }
        by_nick.insert(new_nick.to_lowercase(), id);
    }

    async fn set_channel_presence(&self, id: UserId, channel: &str, present: bool) {
        let mut presence = self.presence.lock();
        let channels = presence.entry(id).or_default();
        if present {
            channels.insert(channel.to_lowercase());
        } else {
            channels.remove(&channel.to_lowercase());
        }
    }

    async fn channels_of(&self, id: UserId) -> Vec<String> {
        self.presence
            .lock()
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn clear_presence(&self) {
        self.presence.lock().clear();
    }
}

#[derive(Default)]
pub struct FakeStorage {
    events: Mutex<HashMap<String, Vec<ChatEvent>>>,
    meta: Mutex<HashMap<String, ChannelMeta>>,
}

impl FakeStorage {
    pub fn new() -> Arc<FakeStorage> {
        Arc::new(FakeStorage::default())
    }

    pub fn events_for(&self, channel: &str) -> Vec<ChatEvent> {
        self.events
            .lock()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn meta_for(&self, channel: &str) -> Option<ChannelMeta> {
        self.meta.lock().get(channel).cloned()
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn append(&self, channel: &str, event: &ChatEvent) {
        self.events
            .lock()
            .entry(channel.to_owned())
            .or_default()
            .push(event.clone());
    }

    async fn recent_tail(&self, channel: &str, count: usize) -> Vec<ChatEvent> {
        let events = self.events.lock();
        let Some(all) = events.get(channel) else {
            return Vec::new();
        };
        all[all.len().saturating_sub(count)..].to_vec()
    }

    async fn channel_meta(&self, channel: &str) -> Option<ChannelMeta> {
        self.meta.lock().get(channel).cloned()
    }

    async fn set_channel_meta(&self, channel: &str, meta: ChannelMeta) {
        self.meta.lock().insert(channel.to_owned(), meta);
    }
}

/// Server side of an in-memory transport.
pub struct TestRemote {
    pub to_client: mpsc::Sender<String>,
    pub from_client: mpsc::Receiver<String>,
}

impl TestRemote {
    pub async fn send(&self, line: &str) {
        self.to_client.send(line.to_owned()).await.expect("client gone");
    }

    /// Next line the client wrote, or panic after a short wait.
    pub async fn expect_line(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for client line")
            .expect("client write half closed")
    }

    /// Skip lines until one contains `needle`.
    pub async fn expect_containing(&mut self, needle: &str) -> String {
        loop {
            let line = self.expect_line().await;
            if line.contains(needle) {
                return line;
            }
        }
    }
}

/// Build a connected transport pair. The shutdown handle severs the
/// client's incoming stream even while the remote half stays alive.
pub fn transport_pair() -> (TransportHandle, TestRemote) {
    let (remote_tx, mut remote_rx) = mpsc::channel::<String>(64);
    let (in_tx, in_rx) = mpsc::channel::<String>(64);
    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    let stop = Arc::new(tokio::sync::Notify::new());
    let stop_rx = Arc::clone(&stop);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.notified() => break,
                line = remote_rx.recv() => match line {
                    Some(line) => {
                        if in_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    let handle = TransportHandle {
        incoming: in_rx,
        outgoing: out_tx,
        shutdown: Arc::new(move || stop.notify_one()),
    };
    let remote = TestRemote {
        to_client: remote_tx,
        from_client: out_rx,
    };
    (handle, remote)
}

enum ScriptedOutcome {
    Accept,
    Fail,
    RejectCredential,
    /// Never resolves.
    Hang,
}

/// Connector whose attempts follow a scripted outcome list (the last
/// entry repeats). Accepted connections hand their remote half to the
/// test through a channel.
pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    remotes: mpsc::UnboundedSender<TestRemote>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn accepting() -> (Arc<ScriptedConnector>, mpsc::UnboundedReceiver<TestRemote>) {
        ScriptedConnector::scripted("a")
    }

    /// `script`: one char per attempt, `a`ccept, `f`ail, `r`eject
    /// credential, `h`ang. The last char repeats for later attempts.
    pub fn scripted(script: &str) -> (Arc<ScriptedConnector>, mpsc::UnboundedReceiver<TestRemote>) {
        let outcomes = script
            .chars()
            .map(|c| match c {
                'a' => ScriptedOutcome::Accept,
                'f' => ScriptedOutcome::Fail,
                'r' => ScriptedOutcome::RejectCredential,
                'h' => ScriptedOutcome::Hang,
                other => panic!("unknown script step {other:?}"),
            })
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ScriptedConnector {
                outcomes: Mutex::new(outcomes),
                remotes: tx,
                connects: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<TransportHandle, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut outcomes = self.outcomes.lock();
            if outcomes.len() > 1 {
                outcomes.pop_front().expect("non-empty")
            } else {
                match outcomes.front() {
                    Some(ScriptedOutcome::Accept) => ScriptedOutcome::Accept,
                    Some(ScriptedOutcome::Fail) => ScriptedOutcome::Fail,
                    Some(ScriptedOutcome::RejectCredential) => ScriptedOutcome::RejectCredential,
                    Some(ScriptedOutcome::Hang) | None => ScriptedOutcome::Hang,
                }
            }
        };
        match outcome {
            ScriptedOutcome::Accept => {
                let (handle, remote) = transport_pair();
                let _ = self.remotes.send(remote);
                Ok(handle)
            }
            ScriptedOutcome::Fail => Err(ConnectError::Other("connection refused".to_owned())),
            ScriptedOutcome::RejectCredential => Err(ConnectError::CredentialRejected),
            ScriptedOutcome::Hang => std::future::pending().await,
        }
    }
}

/// Observer that records everything it sees.
#[derive(Default)]
pub struct RecordingObserver {
    pub chat: Mutex<Vec<(Option<String>, ChatEvent)>>,
    pub members_changed: Mutex<Vec<String>>,
    pub joined: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
    pub topics: Mutex<Vec<String>>,
    pub infos: Mutex<Vec<ConnectionInfo>>,
    pub disconnects: Mutex<Vec<DisconnectReason>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver::default())
    }

    pub fn chat_texts(&self, channel: &str) -> Vec<String> {
        self.chat
            .lock()
            .iter()
            .filter(|(c, e)| c.as_deref() == Some(channel) && e.kind.is_message())
            .map(|(_, e)| e.text.clone())
            .collect()
    }
}

impl SessionObserver for RecordingObserver {
    fn channel_joined(&self, name: &str) {
        self.joined.lock().push(name.to_owned());
    }

    fn channel_left(&self, name: &str) {
        self.left.lock().push(name.to_owned());
    }

    fn member_list_changed(&self, channel: &str) {
        self.members_changed.lock().push(channel.to_owned());
    }

    fn topic_changed(&self, channel: &str) {
        self.topics.lock().push(channel.to_owned());
    }

    fn connection_info_changed(&self, info: ConnectionInfo) {
        self.infos.lock().push(info);
    }

    fn chat_event(&self, channel: Option<&str>, event: &ChatEvent) {
        self.chat
            .lock()
            .push((channel.map(str::to_owned), event.clone()));
    }

    fn disconnected(&self, reason: &DisconnectReason) {
        self.disconnects.lock().push(reason.clone());
    }
}

/// Parse and dispatch one raw line into the session.
pub async fn feed(session: &Arc<Session>, line: &str) {
    let msg: Message = line.parse().expect("test line must parse");
    session
        .registry()
        .dispatch(session, &msg)
        .await
        .unwrap_or_else(|err| panic!("dispatch failed for {line:?}: {err}"));
}

/// Dispatch a line that is expected to fail, returning the error.
pub async fn feed_err(session: &Arc<Session>, line: &str) -> ircore::ProtocolError {
    let msg: Message = line.parse().expect("test line must parse");
    session
        .registry()
        .dispatch(session, &msg)
        .await
        .expect_err("dispatch unexpectedly succeeded")
}
