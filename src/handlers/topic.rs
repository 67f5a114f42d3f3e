//! Channel topic: live TOPIC changes and the 331/332/333 numerics sent
//! after join.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channel::Topic;
use crate::collab::ChannelMeta;
use crate::error::{HandlerResult, ProtocolError};
use crate::event::ChatEventKind;
use crate::proto::{Message, Verb};
use crate::registry::CommandHandler;
use crate::session::Session;

use super::event_from_msg;

pub struct TopicHandler;

impl TopicHandler {
    /// Live TOPIC change from a user.
    async fn on_topic(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let channel_name = msg.require(0)?.to_owned();
        let text = msg.require(1)?.to_owned();
        let sender = session.sender_or_self(msg);
        let channel = session
            .channel(&channel_name)
            .ok_or_else(|| ProtocolError::NotJoined(channel_name.clone()))?;

        let topic = if text.is_empty() {
            None
        } else {
            Some(Topic {
                text: text.clone(),
                set_by: Some(sender.nick.clone()),
                set_at: Some(Utc::now()),
            })
        };
        channel.set_topic(topic.clone());
        persist_topic(session, channel.name(), topic.as_ref()).await;
        session.notify_topic_changed(channel.name());

        let event = event_from_msg(session, msg, ChatEventKind::TopicChange, Some(sender), text);
        session.deliver_event(Some(&channel_name), event).await;
        Ok(())
    }

    /// 332: topic text. 331: no topic is set.
    async fn on_topic_reply(
        &self,
        session: &Arc<Session>,
        msg: &Message,
        present: bool,
    ) -> HandlerResult {
        let channel_name = msg.require(1)?.to_owned();
        let channel = session
            .channel(&channel_name)
            .ok_or_else(|| ProtocolError::NotJoined(channel_name.clone()))?;
        let topic = if present {
            Some(Topic {
                text: msg.require(2)?.to_owned(),
                // Setter and timestamp arrive separately in 333.
                ..Topic::default()
            })
        } else {
            None
        };
        channel.set_topic(topic.clone());
        persist_topic(session, channel.name(), topic.as_ref()).await;
        session.notify_topic_changed(channel.name());
        Ok(())
    }

    /// 333: who set the topic and when (unix seconds).
    async fn on_topic_who_time(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let channel_name = msg.require(1)?.to_owned();
        let set_by = msg.require(2)?.to_owned();
        let set_at = msg
            .require(3)?
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        let channel = session
            .channel(&channel_name)
            .ok_or_else(|| ProtocolError::NotJoined(channel_name.clone()))?;

        let Some(mut topic) = channel.topic() else {
            // 333 before 332 would be a server bug; nothing to annotate.
            return Ok(());
        };
        topic.set_by = Some(set_by);
        topic.set_at = set_at;
        channel.set_topic(Some(topic.clone()));
        persist_topic(session, channel.name(), Some(&topic)).await;
        session.notify_topic_changed(channel.name());
        Ok(())
    }
}

async fn persist_topic(session: &Arc<Session>, channel: &str, topic: Option<&Topic>) {
    let meta = ChannelMeta {
        topic: topic.map(|t| t.text.clone()),
        topic_set_by: topic.and_then(|t| t.set_by.clone()),
        topic_set_at: topic.and_then(|t| t.set_at.map(|at| at.timestamp_millis())),
    };
    session.storage().set_channel_meta(channel, meta).await;
}

#[async_trait]
impl CommandHandler for TopicHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        match &msg.verb {
            Verb::Named(name) if name == "TOPIC" => self.on_topic(session, msg).await,
            Verb::Numeric(331) => self.on_topic_reply(session, msg, false).await,
            Verb::Numeric(332) => self.on_topic_reply(session, msg, true).await,
            Verb::Numeric(333) => self.on_topic_who_time(session, msg).await,
            other => Err(ProtocolError::UnrecognizedCommand(other.to_string())),
        }
    }
}
