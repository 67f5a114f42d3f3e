//! Per-connection session state store.
//!
//! One [`Session`] owns everything keyed to a single server connection:
//! local identity, the joined-channel table, the support list, capability
//! negotiation state, the command registry, the filter chain and the batch
//! tracker. It is shared behind an `Arc` between the read loop, handler
//! tasks and the lifecycle controller; interior locks are held briefly and
//! never across `.await`.
//!
//! Invariant: a channel object exists in the table iff the local user is
//! currently joined. Full disconnect runs [`Session::reset`], which clears
//! every piece of per-connection state in one pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::batch::BatchTracker;
use crate::caps::CapRegistry;
use crate::channel::{Channel, Topic};
use crate::collab::{Directory, Storage, TransferHandoff};
use crate::config::EngineConfig;
use crate::error::DisconnectReason;
use crate::event::{ChatEvent, ConnectionInfo, SenderInfo, SessionObserver};
use crate::filter::{FilterChain, IgnoreListFilter};
use crate::isupport::SupportList;
use crate::proto::{Message, Prefix};
use crate::registry::Registry;
use crate::handlers;
use crate::replay::ReplayFilter;

/// Storage key for events not tied to a channel (server notices, status).
pub const STATUS_BUFFER: &str = "*";

/// Local user identity as currently confirmed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

pub struct Session {
    identity: RwLock<Identity>,
    /// Joined channels, keyed by lowercased name.
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    support: SupportList,
    caps: CapRegistry,
    registry: Registry,
    filters: FilterChain,
    batches: BatchTracker,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
    directory: Arc<dyn Directory>,
    storage: Arc<dyn Storage>,
    transfers: Mutex<Option<Arc<dyn TransferHandoff>>>,
    /// Write half of the live transport, present while connected.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    multi_prefix: AtomicBool,
    /// Signals the lifecycle controller once registration completes (001).
    registered_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    default_handlers: handlers::DefaultHandlers,
}

impl Session {
    /// Build a session with the default handler set, built-in capabilities
    /// and the configured filter chain installed.
    pub fn new(
        config: &EngineConfig,
        directory: Arc<dyn Directory>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Session> {
        let registry = Registry::new();
        let caps = CapRegistry::new();
        let filters = FilterChain::new();
        let batches = BatchTracker::new();

        let default_handlers = handlers::install_defaults(&registry);
        crate::caps::install_defaults(&caps);
        if !config.ignore_masks.is_empty() {
            filters.add(Arc::new(IgnoreListFilter::new(config.ignore_masks.clone())));
        }
        let replay_filter = Arc::new(ReplayFilter::new(config.replay_batch_type.clone()));
        filters.add(Arc::clone(&replay_filter) as Arc<dyn crate::filter::MessageFilter>);
        batches.add_listener(config.replay_batch_type.clone(), replay_filter);

        Arc::new(Session {
            identity: RwLock::new(Identity {
                nick: config.nick.clone(),
                user: Some(config.username.clone()),
                host: None,
            }),
            channels: Mutex::new(HashMap::new()),
            support: SupportList::new(),
            caps,
            registry,
            filters,
            batches,
            observers: RwLock::new(Vec::new()),
            directory,
            storage,
            transfers: Mutex::new(None),
            outbound: Mutex::new(None),
            multi_prefix: AtomicBool::new(false),
            registered_tx: Mutex::new(None),
            default_handlers,
        })
    }

    /// Ask the server for a nick change. The callback resolves once the
    /// server echoes the change, rejects it with an error numeric, or the
    /// connection drops. Concurrent requests for the same nick queue FIFO.
    pub async fn change_nick(
        self: &Arc<Self>,
        new_nick: &str,
        callback: impl FnOnce(crate::correlate::Outcome<String>) + Send + 'static,
    ) {
        self.default_handlers.nick.request(new_nick, callback);
        self.send(Message::cmd("NICK", &[new_nick])).await;
    }

    // Component accessors.

    pub fn support(&self) -> &SupportList {
        &self.support
    }

    pub fn caps(&self) -> &CapRegistry {
        &self.caps
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn batches(&self) -> &BatchTracker {
        &self.batches
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn attach_transfers(&self, transfers: Arc<dyn TransferHandoff>) {
        *self.transfers.lock() = Some(transfers);
    }

    pub fn transfers(&self) -> Option<Arc<dyn TransferHandoff>> {
        self.transfers.lock().clone()
    }

    // Identity.

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    pub fn nick(&self) -> String {
        self.identity.read().nick.clone()
    }

    pub fn set_nick(&self, nick: &str) {
        self.identity.write().nick = nick.to_owned();
    }

    pub fn update_identity(&self, user: Option<&str>, host: Option<&str>) {
        let mut identity = self.identity.write();
        if let Some(user) = user {
            identity.user = Some(user.to_owned());
        }
        if let Some(host) = host {
            identity.host = Some(host.to_owned());
        }
    }

    pub fn is_own_nick(&self, nick: &str) -> bool {
        self.identity.read().nick.eq_ignore_ascii_case(nick)
    }

    /// Resolve the message sender, substituting the local identity when
    /// the server omitted the prefix (some servers do on KICK/PART/NICK
    /// echoes addressed at us).
    pub fn sender_or_self(&self, msg: &Message) -> SenderInfo {
        match &msg.prefix {
            Some(Prefix::Nickname { nick, user, host }) => SenderInfo {
                nick: nick.clone(),
                user: user.clone(),
                host: host.clone(),
                id: None,
            },
            Some(Prefix::ServerName(name)) => SenderInfo::from_nick(name.clone()),
            None => {
                let identity = self.identity.read();
                SenderInfo {
                    nick: identity.nick.clone(),
                    user: identity.user.clone(),
                    host: identity.host.clone(),
                    id: None,
                }
            }
        }
    }

    pub fn set_multi_prefix(&self, enabled: bool) {
        self.multi_prefix.store(enabled, Ordering::Relaxed);
    }

    pub fn multi_prefix(&self) -> bool {
        self.multi_prefix.load(Ordering::Relaxed)
    }

    /// Split a NAMES-style nick token into its membership sigils and the
    /// bare nick. Without `multi-prefix` at most one leading sigil is
    /// taken, matching what the server sends.
    pub fn parse_nick_token<'a>(&self, token: &'a str) -> (String, &'a str) {
        let mut sigils = String::new();
        let mut rest = token;
        let limit = if self.multi_prefix() { usize::MAX } else { 1 };
        while sigils.len() < limit {
            match rest.chars().next() {
                Some(c) if self.support.is_prefix_sigil(c) => {
                    sigils.push(c);
                    rest = &rest[c.len_utf8()..];
                }
                _ => break,
            }
        }
        (sigils, rest)
    }

    // Channel table.

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().get(&name.to_lowercase()).cloned()
    }

    /// Channel names with original casing, sorted for stable observer
    /// notifications.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .lock()
            .values()
            .map(|c| c.name().to_owned())
            .collect();
        names.sort();
        names
    }

    /// Record that the local user joined a channel. Idempotent; the topic
    /// is hydrated from storage off the read path.
    pub fn on_channel_joined(self: &Arc<Self>, name: &str) -> Arc<Channel> {
        let key = name.to_lowercase();
        let (channel, created) = {
            let mut channels = self.channels.lock();
            match channels.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let channel = Arc::new(Channel::new(name));
                    channels.insert(key, Arc::clone(&channel));
                    (channel, true)
                }
            }
        };
        if created {
            debug!(channel = name, "joined channel");
            let session = Arc::clone(self);
            let channel_for_meta = Arc::clone(&channel);
            tokio::spawn(async move {
                let Some(meta) = session.storage.channel_meta(channel_for_meta.name()).await
                else {
                    return;
                };
                if let Some(text) = meta.topic {
                    channel_for_meta.set_topic(Some(Topic {
                        text,
                        set_by: meta.topic_set_by,
                        set_at: meta
                            .topic_set_at
                            .and_then(chrono::DateTime::from_timestamp_millis),
                    }));
                    session.notify_topic_changed(channel_for_meta.name());
                }
            });
            self.notify_channel_joined(name);
            self.notify_channel_list();
        }
        channel
    }

    /// Record that the local user left a channel (PART, KICK or forced).
    pub fn on_channel_left(&self, name: &str) {
        let removed = self.channels.lock().remove(&name.to_lowercase());
        if removed.is_some() {
            debug!(channel = name, "left channel");
            self.notify_channel_left(name);
            self.notify_channel_list();
        }
    }

    // Transport plumbing.

    pub fn attach_outbound(&self, sender: mpsc::Sender<String>) {
        *self.outbound.lock() = Some(sender);
    }

    pub fn detach_outbound(&self) {
        *self.outbound.lock() = None;
    }

    /// Serialize and send one message. Returns `false` when no transport
    /// is attached or the write half is gone.
    pub async fn send(&self, msg: Message) -> bool {
        self.send_raw(msg.to_string()).await
    }

    pub async fn send_raw(&self, line: String) -> bool {
        let sender = self.outbound.lock().clone();
        match sender {
            Some(sender) => match sender.send(line).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(line = %err.0, "dropping outbound line, transport closed");
                    false
                }
            },
            None => {
                debug!(line, "dropping outbound line, not connected");
                false
            }
        }
    }

    // Event delivery.

    /// Run an inbound chat event through the filter chain, then persist
    /// and publish it.
    pub async fn deliver_event(self: &Arc<Self>, channel: Option<&str>, event: ChatEvent) {
        if !self.filters.admit(self, channel, &event) {
            return;
        }
        self.publish_event(channel, event).await;
    }

    /// Like [`Session::deliver_event`] but skips the named filter. Used
    /// when a filter re-injects events it previously buffered.
    pub async fn deliver_event_skipping(
        self: &Arc<Self>,
        skip: &str,
        channel: Option<&str>,
        event: ChatEvent,
    ) {
        if !self.filters.admit_except(self, channel, &event, skip) {
            return;
        }
        self.publish_event(channel, event).await;
    }

    async fn publish_event(&self, channel: Option<&str>, event: ChatEvent) {
        // Membership and topic markers stay out of durable history; see
        // [`ChatEventKind::is_message`].
        if event.kind.is_message() {
            self.storage
                .append(channel.unwrap_or(STATUS_BUFFER), &event)
                .await;
        }
        for observer in self.observers.read().iter() {
            observer.chat_event(channel, &event);
        }
    }

    // Observers.

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn notify_channel_list(&self) {
        let names = self.channel_names();
        for observer in self.observers.read().iter() {
            observer.channel_list_changed(&names);
        }
    }

    pub fn notify_channel_joined(&self, name: &str) {
        for observer in self.observers.read().iter() {
            observer.channel_joined(name);
        }
    }

    pub fn notify_channel_left(&self, name: &str) {
        for observer in self.observers.read().iter() {
            observer.channel_left(name);
        }
    }

    pub fn notify_members_changed(&self, channel: &str) {
        for observer in self.observers.read().iter() {
            observer.member_list_changed(channel);
        }
    }

    pub fn notify_topic_changed(&self, channel: &str) {
        for observer in self.observers.read().iter() {
            observer.topic_changed(channel);
        }
    }

    pub fn notify_connection_info(&self, info: ConnectionInfo) {
        for observer in self.observers.read().iter() {
            observer.connection_info_changed(info);
        }
    }

    pub fn notify_disconnected(&self, reason: &DisconnectReason) {
        for observer in self.observers.read().iter() {
            observer.disconnected(reason);
        }
    }

    // Registration signal.

    pub(crate) fn set_registered_signal(&self, tx: mpsc::UnboundedSender<()>) {
        *self.registered_tx.lock() = Some(tx);
    }

    /// Called by the welcome handler once 001 arrives.
    pub fn notify_registered(&self) {
        if let Some(tx) = self.registered_tx.lock().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Clear all per-connection state after a full disconnect. The session
    /// object itself survives and is reused for the next attempt.
    pub async fn reset(&self) {
        self.registry.notify_disconnected();
        let had_channels = {
            let mut channels = self.channels.lock();
            let had = !channels.is_empty();
            channels.clear();
            had
        };
        if had_channels {
            self.notify_channel_list();
        }
        self.caps.reset();
        self.batches.clear();
        self.set_multi_prefix(false);
        self.detach_outbound();
        *self.registered_tx.lock() = None;
        self.directory.clear_presence().await;
    }
}
