//! External collaborator interfaces.
//!
//! The engine owns protocol state only. User identity assignment, durable
//! message storage, the byte transport and the file-transfer subsystem are
//! supplied by the embedding application through these traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectError;
use crate::event::ChatEvent;

/// Opaque stable user identifier, assigned by the directory.
///
/// Two messages from the same nick are never assumed to share an identity
/// without resolving through the directory; nick reuse after quit/rejoin
/// is the directory's problem, not ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

/// User directory: nick-to-identity resolution and presence bookkeeping.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve one user, creating a directory entry if unknown.
    async fn resolve(&self, nick: &str, user: Option<&str>, host: Option<&str>) -> UserId;

    /// Resolve many nicks in one call. Required by the membership-listing
    /// path: one batched call per listing, both for throughput and for
    /// consistency under concurrent renames.
    async fn resolve_batch(&self, nicks: &[String]) -> HashMap<String, UserId>;

    /// Record a nick change for an already-resolved identity.
    async fn update_nick(&self, id: UserId, new_nick: &str);

    /// Record or clear a user's presence in a channel.
    async fn set_channel_presence(&self, id: UserId, channel: &str, present: bool);

    /// Channels a user is currently known to be present in.
    async fn channels_of(&self, id: UserId) -> Vec<String>;

    /// Drop all presence records for this session. Called from
    /// `Session::reset` on full disconnect.
    async fn clear_presence(&self);
}

/// Per-channel metadata persisted across sessions (topic and friends).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMeta {
    pub topic: Option<String>,
    pub topic_set_by: Option<String>,
    pub topic_set_at: Option<i64>,
}

/// Durable message storage. The engine appends admitted events and reads
/// recent tails for replay reconciliation; the schema is not its concern.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn append(&self, channel: &str, event: &ChatEvent);

    /// The most recent `count` events for a channel, oldest first.
    async fn recent_tail(&self, channel: &str, count: usize) -> Vec<ChatEvent>;

    async fn channel_meta(&self, channel: &str) -> Option<ChannelMeta>;
    async fn set_channel_meta(&self, channel: &str, meta: ChannelMeta);
}

/// An out-of-band transfer offer embedded in chat text (CTCP DCC). The
/// engine extracts and forwards it; transfer semantics live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    pub from_nick: String,
    /// Raw DCC payload after the `DCC ` keyword.
    pub payload: String,
}

/// File-transfer subsystem handle, attached at session set-up time.
pub trait TransferHandoff: Send + Sync {
    fn offer(&self, offer: TransferOffer);
}

/// A live transport produced by one successful connect attempt.
///
/// `incoming` yields decoded lines until the connection is severed, at
/// which point it closes. `shutdown` forces transport closure from a
/// dedicated path and must never block the caller.
pub struct TransportHandle {
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
    pub shutdown: Arc<dyn Fn() + Send + Sync>,
}

/// Opens transports. One implementation per transport flavor (TCP, TLS,
/// test fake); the lifecycle controller calls it once per attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportHandle, ConnectError>;
}
