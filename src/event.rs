//! Chat event model and the observer surface exposed to collaborators.

use chrono::{DateTime, Utc};

use crate::collab::UserId;
use crate::error::DisconnectReason;

/// The author of a chat event, as resolved through the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
    pub id: Option<UserId>,
}

impl SenderInfo {
    pub fn from_nick(nick: impl Into<String>) -> SenderInfo {
        SenderInfo {
            nick: nick.into(),
            user: None,
            host: None,
            id: None,
        }
    }
}

/// What kind of event this is. The `text` field on [`ChatEvent`] carries
/// the message body, part/quit/kick reason, or topic text as appropriate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEventKind {
    Privmsg,
    Notice,
    /// CTCP ACTION inside a PRIVMSG.
    Action,
    Join,
    Part,
    Quit,
    Kick { target: String },
    NickChange { new_nick: String },
    TopicChange,
}

impl ChatEventKind {
    /// Whether events of this kind belong in durable history. Message
    /// bodies persist; membership and topic markers go to observers only,
    /// so the stored tail stays comparable against bouncer replay.
    pub fn is_message(&self) -> bool {
        matches!(
            self,
            ChatEventKind::Privmsg | ChatEventKind::Notice | ChatEventKind::Action
        )
    }
}

/// Batch membership carried over from the message's `batch` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTag {
    /// The batch reference token.
    pub reference: String,
    /// The batch type, e.g. `znc.in/playback`.
    pub batch_type: String,
}

/// One inbound chat event, after handler processing and before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub kind: ChatEventKind,
    pub sender: Option<SenderInfo>,
    pub text: String,
    pub time: DateTime<Utc>,
    pub batch: Option<BatchTag>,
}

impl ChatEvent {
    pub fn new(kind: ChatEventKind, sender: Option<SenderInfo>, text: impl Into<String>) -> ChatEvent {
        ChatEvent {
            kind,
            sender,
            text: text.into(),
            time: Utc::now(),
            batch: None,
        }
    }

    pub fn sender_nick(&self) -> Option<&str> {
        self.sender.as_ref().map(|s| s.nick.as_str())
    }
}

/// Connection state flags, pushed whenever any of them changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub connecting: bool,
    pub disconnecting: bool,
}

/// Push-notification surface for everything the engine exposes.
///
/// All methods default to no-ops so observers implement only what they
/// consume. Callbacks fire on engine tasks and must not block.
pub trait SessionObserver: Send + Sync {
    fn channel_list_changed(&self, _channels: &[String]) {}
    fn channel_joined(&self, _name: &str) {}
    fn channel_left(&self, _name: &str) {}
    fn member_list_changed(&self, _channel: &str) {}
    fn topic_changed(&self, _channel: &str) {}
    fn connection_info_changed(&self, _info: ConnectionInfo) {}
    /// A chat event admitted by the filter chain. `channel` is `None` for
    /// server/status events.
    fn chat_event(&self, _channel: Option<&str>, _event: &ChatEvent) {}
    fn disconnected(&self, _reason: &DisconnectReason) {}
}
