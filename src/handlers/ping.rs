//! Server keepalive.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerResult;
use crate::proto::Message;
use crate::registry::CommandHandler;
use crate::session::Session;

/// Answers server `PING` with `PONG`, echoing the token.
pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let token = msg.require(0)?;
        session.send(Message::cmd("PONG", &[token])).await;
        Ok(())
    }
}

/// Inbound `PONG` needs no action; binding it keeps keepalive echoes out
/// of the unrecognized-command path.
pub struct PongHandler;

#[async_trait]
impl CommandHandler for PongHandler {
    async fn handle(&self, _session: &Arc<Session>, _msg: &Message) -> HandlerResult {
        Ok(())
    }
}
