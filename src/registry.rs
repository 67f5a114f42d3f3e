//! Command registry: maps protocol verbs to handlers.
//!
//! Registration is explicit and collision-checked: binding a verb that is
//! already bound is a programmer error and panics, because a silent
//! overwrite would hide protocol bugs. Unbound error numerics fall back
//! to a designated error handler; anything else is an unrecognized
//! command, reported but never fatal.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HandlerResult, ProtocolError};
use crate::event::{ChatEvent, ChatEventKind, SenderInfo};
use crate::proto::{Message, Verb};
use crate::session::Session;

/// Trait implemented by all command handlers.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult;

    /// Handlers that keep cross-line state (batching, buffering) implement
    /// [`DisconnectAware`] and surface it here so the registry can flush
    /// them on full disconnect.
    fn disconnect_aware(&self) -> Option<&dyn DisconnectAware> {
        None
    }
}

/// Disconnect hook: clear any partial state before the session object is
/// reused for the next connection attempt.
pub trait DisconnectAware: Send + Sync {
    fn on_disconnected(&self);
}

/// Numeric-error subscriber. Handlers with pending correlated requests
/// declare the error codes that can complete them.
pub trait ErrorAware: Send + Sync {
    fn handled_errors(&self) -> Vec<u16>;

    /// Returns `true` if the error was consumed by a pending request.
    fn on_numeric_error(&self, code: u16, params: &[String]) -> bool;
}

/// Fallback handler for error-range numerics with no bound handler.
///
/// Declared codes are routed to their [`ErrorAware`] subscribers;
/// unconsumed errors are surfaced as a server status event so protocol
/// failures stay observable.
#[derive(Default)]
pub struct ErrorFallback {
    sinks: Mutex<Vec<Weak<dyn ErrorAware>>>,
}

impl ErrorFallback {
    fn add_listener(&self, sink: &Arc<dyn ErrorAware>) {
        self.sinks.lock().push(Arc::downgrade(sink));
    }

    fn can_handle(&self, verb: &Verb) -> bool {
        matches!(verb.as_numeric(), Some(code) if (400..600).contains(&code))
    }

    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let code = match msg.verb.as_numeric() {
            Some(code) => code,
            None => return Err(ProtocolError::UnrecognizedCommand(msg.verb.to_string())),
        };

        let sinks: Vec<Weak<dyn ErrorAware>> = {
            let mut guard = self.sinks.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard.clone()
        };
        for weak in sinks {
            let Some(sink) = weak.upgrade() else { continue };
            if sink.handled_errors().contains(&code) && sink.on_numeric_error(code, &msg.params) {
                return Ok(());
            }
        }

        // Not claimed by any pending request: surface as a status event.
        debug!(code, params = ?msg.params, "unclaimed error numeric");
        let text = msg
            .params
            .last()
            .cloned()
            .unwrap_or_else(|| format!("error {code}"));
        let sender = msg.sender_nick().map(SenderInfo::from_nick);
        session
            .deliver_event(None, ChatEvent::new(ChatEventKind::Notice, sender, text))
            .await;
        Ok(())
    }
}

/// Registry of command handlers for one session.
pub struct Registry {
    handlers: Mutex<HashMap<Verb, Arc<dyn CommandHandler>>>,
    fallback: Arc<ErrorFallback>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            handlers: Mutex::new(HashMap::new()),
            fallback: Arc::new(ErrorFallback::default()),
        }
    }

    /// Bind a handler to one or more verbs.
    ///
    /// # Panics
    ///
    /// Panics if any verb is already bound on this registry.
    pub fn register(&self, handler: Arc<dyn CommandHandler>, verbs: &[Verb]) {
        let mut handlers = self.handlers.lock();
        for verb in verbs {
            if handlers.contains_key(verb) {
                panic!("duplicate command handler registration for {verb}");
            }
            handlers.insert(verb.clone(), Arc::clone(&handler));
        }
    }

    /// Unbind verbs, e.g. when a capability owning per-negotiation
    /// handlers is disabled.
    pub fn unregister(&self, verbs: &[Verb]) {
        let mut handlers = self.handlers.lock();
        for verb in verbs {
            handlers.remove(verb);
        }
    }

    pub fn is_bound(&self, verb: &Verb) -> bool {
        self.handlers.lock().contains_key(verb)
    }

    /// Subscribe a handler to error numerics routed via the fallback.
    pub fn add_error_listener(&self, sink: &Arc<dyn ErrorAware>) {
        self.fallback.add_listener(sink);
    }

    /// Dispatch one inbound message.
    ///
    /// Errors are reported by the caller; they never terminate the
    /// connection.
    pub async fn dispatch(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let handler = self.handlers.lock().get(&msg.verb).cloned();
        if let Some(handler) = handler {
            return handler.handle(session, msg).await;
        }
        if self.fallback.can_handle(&msg.verb) {
            return self.fallback.handle(session, msg).await;
        }
        Err(ProtocolError::UnrecognizedCommand(msg.verb.to_string()))
    }

    /// Notify every handler with a disconnect hook. Called once per full
    /// disconnect so no handler carries stale partial state into the next
    /// connection attempt.
    pub fn notify_disconnected(&self) {
        let handlers: Vec<Arc<dyn CommandHandler>> = {
            let guard = self.handlers.lock();
            let mut seen: Vec<*const ()> = Vec::new();
            let mut out = Vec::new();
            for handler in guard.values() {
                let ptr = Arc::as_ptr(handler) as *const ();
                if !seen.contains(&ptr) {
                    seen.push(ptr);
                    out.push(Arc::clone(handler));
                }
            }
            out
        };
        for handler in handlers {
            if let Some(hook) = handler.disconnect_aware() {
                hook.on_disconnected();
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

/// Log a dispatch failure. Split out so the read loop and tests report
/// identically.
pub fn report_dispatch_error(err: &ProtocolError, line: &str) {
    warn!(error = %err, line, "discarding invalid protocol line");
}
