//! Registration numerics: 001 (welcome) and 005 (ISUPPORT).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::HandlerResult;
use crate::proto::Message;
use crate::registry::CommandHandler;
use crate::session::Session;

/// 001: registration is complete. The target parameter is our confirmed
/// nick, which may differ from the one we asked for.
pub struct WelcomeHandler;

#[async_trait]
impl CommandHandler for WelcomeHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let nick = msg.require(0)?;
        info!(nick, "registered with server");
        session.set_nick(nick);
        session.notify_registered();
        Ok(())
    }
}

/// 005: feature tokens. Everything between the target nick and the
/// trailing "are supported" text goes into the support list.
pub struct IsupportHandler;

#[async_trait]
impl CommandHandler for IsupportHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        msg.require(0)?;
        let tokens = &msg.params[1..msg.params.len().saturating_sub(1).max(1)];
        for token in tokens {
            session.support().apply_token(token);
        }
        debug!(count = tokens.len(), "applied ISUPPORT tokens");
        Ok(())
    }
}
