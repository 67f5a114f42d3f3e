//! Channel membership events: JOIN, PART, KICK, QUIT and NICK.
//!
//! Some servers omit the prefix on KICK/PART/NICK echoes addressed at the
//! local user; those fall back to the local identity via
//! [`Session::sender_or_self`]. Member removal and rename go through the
//! directory so presence bookkeeping stays consistent with the channel
//! tables.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::correlate::{Correlator, NumericError, Outcome};
use crate::error::{HandlerResult, ProtocolError};
use crate::event::ChatEventKind;
use crate::proto::Message;
use crate::registry::{CommandHandler, DisconnectAware, ErrorAware};
use crate::session::Session;

use super::event_from_msg;

pub struct MembershipHandler;

impl MembershipHandler {
    async fn on_join(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let channel_name = msg.require(0)?.to_owned();
        let sender = session.sender_or_self(msg);
        let own = msg.prefix.is_none() || session.is_own_nick(&sender.nick);

        let channel = if own {
            session.on_channel_joined(&channel_name)
        } else {
            session
                .channel(&channel_name)
                .ok_or_else(|| ProtocolError::NotJoined(channel_name.clone()))?
        };

        let id = session
            .directory()
            .resolve(&sender.nick, sender.user.as_deref(), sender.host.as_deref())
            .await;
        session
            .directory()
            .set_channel_presence(id, channel.name(), true)
            .await;
        if !own {
            channel.add_member(crate::channel::Member {
                id,
                nick: sender.nick.clone(),
                sigils: String::new(),
                modes: String::new(),
            });
            session.notify_members_changed(channel.name());
        }

        let mut sender = sender;
        sender.id = Some(id);
        let event = event_from_msg(session, msg, ChatEventKind::Join, Some(sender), "");
        session.deliver_event(Some(&channel_name), event).await;
        Ok(())
    }

    async fn on_part(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let channel_name = msg.require(0)?.to_owned();
        let reason = msg.param(1).unwrap_or("").to_owned();
        let sender = session.sender_or_self(msg);
        let own = msg.prefix.is_none() || session.is_own_nick(&sender.nick);

        let channel = session
            .channel(&channel_name)
            .ok_or_else(|| ProtocolError::NotJoined(channel_name.clone()))?;
        let id = session
            .directory()
            .resolve(&sender.nick, sender.user.as_deref(), sender.host.as_deref())
            .await;
        session
            .directory()
            .set_channel_presence(id, channel.name(), false)
            .await;

        // Membership changes first, then the derived chat event.
        if own {
            session.on_channel_left(&channel_name);
        } else if channel.remove_member(id) {
            session.notify_members_changed(channel.name());
        }

        let mut sender = sender;
        sender.id = Some(id);
        let event = event_from_msg(session, msg, ChatEventKind::Part, Some(sender), reason);
        session.deliver_event(Some(&channel_name), event).await;
        Ok(())
    }

    async fn on_kick(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let channel_name = msg.require(0)?.to_owned();
        let target = msg.require(1)?.to_owned();
        let reason = msg.param(2).unwrap_or("").to_owned();
        // Missing prefix means the server itself kicked on our behalf;
        // attribute the kick to the local user.
        let sender = session.sender_or_self(msg);

        let channel = session
            .channel(&channel_name)
            .ok_or_else(|| ProtocolError::NotJoined(channel_name.clone()))?;
        let target_id = session.directory().resolve(&target, None, None).await;
        session
            .directory()
            .set_channel_presence(target_id, channel.name(), false)
            .await;

        // Membership changes first, then the derived chat event.
        if session.is_own_nick(&target) {
            session.on_channel_left(&channel_name);
        } else if channel.remove_member(target_id) {
            session.notify_members_changed(channel.name());
        }

        let event = event_from_msg(
            session,
            msg,
            ChatEventKind::Kick {
                target: target.clone(),
            },
            Some(sender),
            reason,
        );
        session.deliver_event(Some(&channel_name), event).await;
        Ok(())
    }

    async fn on_quit(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let Some(nick) = msg.sender_nick().map(str::to_owned) else {
            // Our own quit echo carries no prefix on some servers; the
            // transport is about to close, nothing to record.
            debug!("ignoring QUIT without user prefix");
            return Ok(());
        };
        let reason = msg.param(0).unwrap_or("").to_owned();
        let mut sender = session.sender_or_self(msg);
        let id = session
            .directory()
            .resolve(&nick, sender.user.as_deref(), sender.host.as_deref())
            .await;
        sender.id = Some(id);

        for name in session.directory().channels_of(id).await {
            let Some(channel) = session.channel(&name) else {
                continue;
            };
            session
                .directory()
                .set_channel_presence(id, channel.name(), false)
                .await;
            if channel.remove_member(id) {
                session.notify_members_changed(channel.name());
            }
            let event = event_from_msg(
                session,
                msg,
                ChatEventKind::Quit,
                Some(sender.clone()),
                reason.clone(),
            );
            session.deliver_event(Some(channel.name()), event).await;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for MembershipHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        match msg.verb.to_string().as_str() {
            "JOIN" => self.on_join(session, msg).await,
            "PART" => self.on_part(session, msg).await,
            "KICK" => self.on_kick(session, msg).await,
            "QUIT" => self.on_quit(session, msg).await,
            other => Err(ProtocolError::UnrecognizedCommand(other.to_owned())),
        }
    }
}

/// NICK: rename flows through the directory and every joined channel.
/// Outbound nick changes are correlated here; the server answers with
/// either a NICK echo or an error numeric.
pub struct NickHandler {
    /// Keyed by requested nick, lowercased. Multiple requests for the
    /// same nick queue FIFO.
    correlator: Correlator<String, String>,
}

impl NickHandler {
    pub fn new() -> NickHandler {
        NickHandler {
            correlator: Correlator::new(),
        }
    }

    /// Register a completion callback for an outbound nick change. The
    /// caller sends the NICK command itself.
    pub fn request(&self, new_nick: &str, callback: impl FnOnce(Outcome<String>) + Send + 'static) {
        self.correlator.enqueue(new_nick.to_lowercase(), callback);
    }
}

impl Default for NickHandler {
    fn default() -> NickHandler {
        NickHandler::new()
    }
}

#[async_trait]
impl CommandHandler for NickHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let new_nick = msg.require(0)?.to_owned();
        let mut sender = session.sender_or_self(msg);
        let own = msg.prefix.is_none() || session.is_own_nick(&sender.nick);

        let id = session
            .directory()
            .resolve(&sender.nick, sender.user.as_deref(), sender.host.as_deref())
            .await;
        sender.id = Some(id);
        session.directory().update_nick(id, &new_nick).await;

        for name in session.directory().channels_of(id).await {
            let Some(channel) = session.channel(&name) else {
                continue;
            };
            if channel.rename_member(id, &new_nick) {
                session.notify_members_changed(channel.name());
                let event = event_from_msg(
                    session,
                    msg,
                    ChatEventKind::NickChange {
                        new_nick: new_nick.clone(),
                    },
                    Some(sender.clone()),
                    new_nick.clone(),
                );
                session.deliver_event(Some(channel.name()), event).await;
            }
        }

        if own {
            debug!(from = %sender.nick, to = %new_nick, "local nick changed");
            session.set_nick(&new_nick);
            self.correlator
                .complete(&new_nick.to_lowercase(), new_nick);
        }
        Ok(())
    }

    fn disconnect_aware(&self) -> Option<&dyn DisconnectAware> {
        Some(self)
    }
}

impl DisconnectAware for NickHandler {
    fn on_disconnected(&self) {
        self.correlator.cancel_all();
    }
}

impl ErrorAware for NickHandler {
    fn handled_errors(&self) -> Vec<u16> {
        // ERR_NONICKNAMEGIVEN, ERR_ERRONEUSNICKNAME, ERR_NICKNAMEINUSE,
        // ERR_NICKCOLLISION.
        vec![431, 432, 433, 436]
    }

    fn on_numeric_error(&self, code: u16, params: &[String]) -> bool {
        let error = NumericError {
            code,
            message: params.last().cloned(),
        };
        // Params are `<me> <attempted nick> :<text>`; 431 carries no nick.
        match params.get(1) {
            Some(attempted) if code != 431 => self.correlator.fail(&attempted.to_lowercase(), error),
            _ => self.correlator.fail_any(error),
        }
    }
}
