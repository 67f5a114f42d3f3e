//! PRIVMSG/NOTICE to chat events, including CTCP unwrapping.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::collab::TransferOffer;
use crate::error::HandlerResult;
use crate::event::ChatEventKind;
use crate::proto::{Message, Verb};
use crate::registry::CommandHandler;
use crate::session::Session;

use super::event_from_msg;

pub struct MessageHandler;

#[async_trait]
impl CommandHandler for MessageHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let target = msg.require(0)?.to_owned();
        let body = msg.require(1)?.to_owned();
        let mut sender = session.sender_or_self(msg);

        let mut kind = if msg.verb == Verb::Named("NOTICE".into()) {
            ChatEventKind::Notice
        } else {
            ChatEventKind::Privmsg
        };

        // CTCP: body wrapped in \x01 markers.
        let mut text = body;
        if let Some(inner) = ctcp_body(&text) {
            if let Some(action) = inner.strip_prefix("ACTION ") {
                kind = ChatEventKind::Action;
                text = action.to_owned();
            } else if let Some(payload) = inner.strip_prefix("DCC ") {
                // Transfer offers go to the transfer subsystem, not chat.
                if let Some(transfers) = session.transfers() {
                    transfers.offer(TransferOffer {
                        from_nick: sender.nick.clone(),
                        payload: payload.to_owned(),
                    });
                } else {
                    debug!(from = %sender.nick, "dropping DCC offer, no transfer subsystem");
                }
                return Ok(());
            } else {
                debug!(from = %sender.nick, ctcp = %inner, "ignoring CTCP request");
                return Ok(());
            }
        }

        // Route: channel messages key on the channel, private messages on
        // the peer nick (the sender, or the target for echoed self
        // messages). Server notices land in the status buffer.
        let channel = if session.support().is_channel(&target) {
            Some(target.clone())
        } else if msg.sender_nick().is_none() {
            None
        } else if session.is_own_nick(&sender.nick) {
            Some(target.clone())
        } else {
            Some(sender.nick.clone())
        };

        if msg.sender_nick().is_some() {
            let id = session
                .directory()
                .resolve(&sender.nick, sender.user.as_deref(), sender.host.as_deref())
                .await;
            sender.id = Some(id);
        }

        let event = event_from_msg(session, msg, kind, Some(sender), text);
        session.deliver_event(channel.as_deref(), event).await;
        Ok(())
    }
}

fn ctcp_body(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\u{1}')?;
    Some(inner.strip_suffix('\u{1}').unwrap_or(inner))
}
