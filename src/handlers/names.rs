//! NAMES listing aggregation (353 accumulate, 366 commit).
//!
//! 353 lines accumulate per channel; 366 resolves every nick through the
//! directory in one batched call and atomically replaces the channel's
//! member list. Partial listings never become visible, and a listing cut
//! off by disconnect is discarded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::Member;
use crate::error::{HandlerResult, ProtocolError};
use crate::proto::Message;
use crate::registry::{CommandHandler, DisconnectAware};
use crate::session::Session;

#[derive(Default)]
pub struct NamesHandler {
    /// In-flight listings: lowercased channel name to (sigils, nick) rows.
    pending: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl NamesHandler {
    pub fn new() -> NamesHandler {
        NamesHandler::default()
    }

    fn on_name_reply(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        // `353 <me> [=|*|@] <channel> :<names>`; the channel-type token
        // is optional on old servers.
        let (channel, names) = if msg.params.len() >= 4 {
            (msg.require(2)?, msg.require(3)?)
        } else {
            (msg.require(1)?, msg.require(2)?)
        };
        let mut pending = self.pending.lock();
        let rows = pending.entry(channel.to_lowercase()).or_default();
        for token in names.split_whitespace() {
            let (sigils, nick) = session.parse_nick_token(token);
            rows.push((sigils, nick.to_owned()));
        }
        Ok(())
    }

    async fn on_end_of_names(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let channel_name = msg.require(1)?.to_owned();
        let rows = self
            .pending
            .lock()
            .remove(&channel_name.to_lowercase())
            .unwrap_or_default();
        let channel = session
            .channel(&channel_name)
            .ok_or_else(|| ProtocolError::NotJoined(channel_name.clone()))?;

        // One batched resolution per listing.
        let nicks: Vec<String> = rows.iter().map(|(_, nick)| nick.clone()).collect();
        let ids = session.directory().resolve_batch(&nicks).await;

        let mut members = Vec::with_capacity(rows.len());
        for (sigils, nick) in rows {
            let Some(&id) = ids.get(&nick) else {
                warn!(nick = %nick, channel = %channel_name, "directory did not resolve nick");
                continue;
            };
            let modes = session.support().modes_for_sigils(&sigils);
            members.push(Member {
                id,
                nick,
                sigils,
                modes,
            });
        }
        debug!(channel = %channel_name, members = members.len(), "committing member list");
        for member in &members {
            session
                .directory()
                .set_channel_presence(member.id, channel.name(), true)
                .await;
        }
        channel.set_members(members);
        session.notify_members_changed(channel.name());
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for NamesHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        match msg.verb.as_numeric() {
            Some(353) => self.on_name_reply(session, msg),
            Some(366) => self.on_end_of_names(session, msg).await,
            _ => Err(ProtocolError::UnrecognizedCommand(msg.verb.to_string())),
        }
    }

    fn disconnect_aware(&self) -> Option<&dyn DisconnectAware> {
        Some(self)
    }
}

impl DisconnectAware for NamesHandler {
    fn on_disconnected(&self) {
        self.pending.lock().clear();
    }
}
