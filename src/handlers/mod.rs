//! Default command handler set.
//!
//! One handler per protocol concern, registered against the verbs it
//! consumes. Handlers are stateless where possible; the ones that keep
//! cross-line state (NAMES aggregation, CAP buffering, pending nick
//! requests) implement [`DisconnectAware`](crate::registry::DisconnectAware)
//! and get flushed on full disconnect.

pub mod membership;
pub mod message;
pub mod names;
pub mod ping;
pub mod topic;
pub mod welcome;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::batch::BatchInfo;
use crate::caps::CapHandler;
use crate::error::{HandlerResult, ProtocolError};
use crate::event::{BatchTag, ChatEvent, ChatEventKind, SenderInfo};
use crate::proto::{Message, Verb};
use crate::registry::{CommandHandler, ErrorAware, Registry};
use crate::session::Session;

pub use membership::{MembershipHandler, NickHandler};
pub use message::MessageHandler;
pub use names::NamesHandler;
pub use ping::{PingHandler, PongHandler};
pub use topic::TopicHandler;
pub use welcome::{IsupportHandler, WelcomeHandler};

/// Handles kept by the session for issuing correlated requests.
pub struct DefaultHandlers {
    pub nick: Arc<NickHandler>,
}

/// Register the default handler set. Panics if any verb is already bound,
/// so this runs exactly once per registry.
pub fn install_defaults(registry: &Registry) -> DefaultHandlers {
    registry.register(Arc::new(PingHandler), &[Verb::from("PING")]);
    registry.register(Arc::new(PongHandler), &[Verb::from("PONG")]);
    registry.register(Arc::new(CapHandler::new()), &[Verb::from("CAP")]);
    registry.register(Arc::new(WelcomeHandler), &[Verb::from(1)]);
    registry.register(Arc::new(IsupportHandler), &[Verb::from(5)]);
    registry.register(
        Arc::new(MessageHandler),
        &[Verb::from("PRIVMSG"), Verb::from("NOTICE")],
    );
    registry.register(
        Arc::new(MembershipHandler),
        &[
            Verb::from("JOIN"),
            Verb::from("PART"),
            Verb::from("KICK"),
            Verb::from("QUIT"),
        ],
    );
    let nick = Arc::new(NickHandler::new());
    registry.register(Arc::clone(&nick) as Arc<dyn CommandHandler>, &[Verb::from("NICK")]);
    let sink: Arc<dyn ErrorAware> = Arc::clone(&nick) as Arc<dyn ErrorAware>;
    registry.add_error_listener(&sink);
    registry.register(Arc::new(NamesHandler::new()), &[Verb::from(353), Verb::from(366)]);
    registry.register(
        Arc::new(TopicHandler),
        &[
            Verb::from("TOPIC"),
            Verb::from(331),
            Verb::from(332),
            Verb::from(333),
        ],
    );
    registry.register(Arc::new(BatchHandler), &[Verb::from("BATCH")]);
    DefaultHandlers { nick }
}

/// Build a chat event from an inbound message, honoring the `server-time`
/// and `batch` tags when present.
pub(crate) fn event_from_msg(
    session: &Arc<Session>,
    msg: &Message,
    kind: ChatEventKind,
    sender: Option<SenderInfo>,
    text: impl Into<String>,
) -> ChatEvent {
    let mut event = ChatEvent::new(kind, sender, text);
    if let Some(time) = msg
        .tag_value("time")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    {
        event.time = time.with_timezone(&Utc);
    }
    if let Some(reference) = msg.tag_value("batch") {
        if let Some(batch) = session.batches().open_batch(reference) {
            event.batch = Some(BatchTag {
                reference: batch.reference,
                batch_type: batch.batch_type,
            });
        }
    }
    event
}

/// `BATCH +ref type [args]` opens a batch, `BATCH -ref` closes it.
pub struct BatchHandler;

#[async_trait]
impl CommandHandler for BatchHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let marker = msg.require(0)?;
        if let Some(reference) = marker.strip_prefix('+') {
            let batch_type = msg.require(1)?;
            session.batches().start(
                session,
                BatchInfo {
                    reference: reference.to_owned(),
                    batch_type: batch_type.to_owned(),
                    args: msg.params.iter().skip(2).cloned().collect(),
                },
            );
            return Ok(());
        }
        if let Some(reference) = marker.strip_prefix('-') {
            session.batches().end(session, reference);
            return Ok(());
        }
        Err(ProtocolError::Malformed(msg.to_string()))
    }
}
