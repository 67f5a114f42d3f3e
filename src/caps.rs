//! IRCv3 capability negotiation.
//!
//! State machine per capability token: Advertised, Requested, Enabled,
//! Disabled. Transitions are driven by server `CAP` subcommands; the
//! `onEnabled`/`onDisabled` hooks fire exactly once per transition,
//! idempotent against repeated notifications. Registration-time
//! negotiation closes with `CAP END` once every requested token has been
//! acknowledged or rejected and no blocking capability still holds the
//! gate open.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HandlerResult, ProtocolError};
use crate::proto::Message;
use crate::registry::{CommandHandler, DisconnectAware};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapStatus {
    /// The server listed it; we have not asked for it.
    Advertised,
    /// We sent `CAP REQ`; awaiting ACK or NAK.
    Requested,
    Enabled,
    Disabled,
}

/// Per-token negotiation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapEntry {
    pub name: String,
    /// Advertised value, e.g. SASL mechanism list.
    pub value: Option<String>,
    pub status: CapStatus,
}

/// One capability implementation, claiming one or more tokens.
pub trait Capability: Send + Sync {
    fn names(&self) -> Vec<&'static str>;

    /// Whether to request this token when the server advertises it.
    fn should_request(&self, _entry: &CapEntry) -> bool {
        true
    }

    /// Blocking capabilities (authentication flows) keep `CAP END` gated
    /// until they call [`CapRegistry::release_hold`].
    fn blocking(&self) -> bool {
        false
    }

    fn on_enabled(&self, session: &Arc<Session>, entry: &CapEntry);

    fn on_disabled(&self, _session: &Arc<Session>) {}
}

struct CapRegistryState {
    entries: HashMap<String, CapEntry>,
    /// Tokens with a REQ in flight.
    requested: HashSet<String>,
}

/// Negotiation state for one session. Reset on full disconnect.
pub struct CapRegistry {
    caps: Mutex<HashMap<String, Arc<dyn Capability>>>,
    state: Mutex<CapRegistryState>,
    /// Outstanding blocking-capability holds on `CAP END`.
    holds: AtomicUsize,
    end_sent: AtomicBool,
}

impl CapRegistry {
    pub fn new() -> CapRegistry {
        CapRegistry {
            caps: Mutex::new(HashMap::new()),
            state: Mutex::new(CapRegistryState {
                entries: HashMap::new(),
                requested: HashSet::new(),
            }),
            holds: AtomicUsize::new(0),
            end_sent: AtomicBool::new(false),
        }
    }

    /// Register a capability implementation for all tokens it claims.
    pub fn register(&self, cap: Arc<dyn Capability>) {
        let mut caps = self.caps.lock();
        for name in cap.names() {
            caps.insert(name.to_owned(), Arc::clone(&cap));
        }
    }

    pub fn status(&self, name: &str) -> Option<CapStatus> {
        self.state.lock().entries.get(name).map(|e| e.status)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.status(name) == Some(CapStatus::Enabled)
    }

    /// Ingest a complete `CAP LS` or `CAP NEW` listing. Tokens with a
    /// registered implementation that wants them are requested in one
    /// `CAP REQ`; with `NEW` (post-registration) the `CAP END` gate is
    /// already closed, so only the REQ goes out.
    pub async fn on_advertised(
        &self,
        session: &Arc<Session>,
        tokens: Vec<(String, Option<String>)>,
    ) {
        let mut to_request = Vec::new();
        {
            let caps = self.caps.lock();
            let mut state = self.state.lock();
            for (name, value) in tokens {
                let entry = CapEntry {
                    name: name.clone(),
                    value,
                    status: CapStatus::Advertised,
                };
                let wanted = caps
                    .get(&name)
                    .is_some_and(|cap| cap.should_request(&entry));
                let entry = state.entries.entry(name.clone()).or_insert(entry);
                // Re-advertisement of an enabled token changes nothing.
                if wanted && entry.status == CapStatus::Advertised {
                    entry.status = CapStatus::Requested;
                    state.requested.insert(name.clone());
                    to_request.push(name);
                }
            }
        }
        if !to_request.is_empty() {
            debug!(caps = ?to_request, "requesting capabilities");
            session.send_raw(format!("CAP REQ :{}", to_request.join(" "))).await;
        }
        self.finish_if_ready(session).await;
    }

    /// Ingest a `CAP ACK` token list. A `-name` token disables.
    pub async fn on_ack(&self, session: &Arc<Session>, tokens: Vec<String>) {
        for token in tokens {
            if let Some(name) = token.strip_prefix('-') {
                self.disable(session, name);
            } else {
                self.enable(session, &token);
            }
        }
        self.finish_if_ready(session).await;
    }

    /// Ingest a `CAP NAK` token list: every named token is rejected.
    pub async fn on_nak(&self, session: &Arc<Session>, tokens: Vec<String>) {
        for token in tokens {
            let mut state = self.state.lock();
            state.requested.remove(&token);
            if let Some(entry) = state.entries.get_mut(&token) {
                entry.status = CapStatus::Disabled;
            }
            debug!(cap = %token, "capability rejected");
        }
        self.finish_if_ready(session).await;
    }

    /// Ingest a `CAP DEL` token list: the server withdrew the tokens.
    pub fn on_del(&self, session: &Arc<Session>, tokens: Vec<String>) {
        for token in tokens {
            self.disable(session, &token);
            self.state.lock().entries.remove(&token);
        }
    }

    fn enable(&self, session: &Arc<Session>, name: &str) {
        let fire = {
            let mut state = self.state.lock();
            state.requested.remove(name);
            let entry = state
                .entries
                .entry(name.to_owned())
                .or_insert_with(|| CapEntry {
                    name: name.to_owned(),
                    value: None,
                    status: CapStatus::Advertised,
                });
            if entry.status == CapStatus::Enabled {
                None
            } else {
                entry.status = CapStatus::Enabled;
                Some(entry.clone())
            }
        };
        let Some(entry) = fire else { return };
        debug!(cap = %name, "capability enabled");
        if let Some(cap) = self.caps.lock().get(name).cloned() {
            if cap.blocking() {
                self.holds.fetch_add(1, Ordering::SeqCst);
            }
            cap.on_enabled(session, &entry);
        }
    }

    fn disable(&self, session: &Arc<Session>, name: &str) {
        let was_enabled = {
            let mut state = self.state.lock();
            state.requested.remove(name);
            match state.entries.get_mut(name) {
                Some(entry) if entry.status == CapStatus::Enabled => {
                    entry.status = CapStatus::Disabled;
                    true
                }
                Some(entry) => {
                    entry.status = CapStatus::Disabled;
                    false
                }
                None => false,
            }
        };
        if !was_enabled {
            return;
        }
        debug!(cap = %name, "capability disabled");
        if let Some(cap) = self.caps.lock().get(name).cloned() {
            cap.on_disabled(session);
        }
    }

    /// Release one blocking-capability hold on `CAP END`. A capability
    /// whose exchange failed calls this too, so a broken authentication
    /// flow cannot wedge registration. A release without a matching hold
    /// is reported and ignored; it must not underflow the counter.
    pub async fn release_hold(&self, session: &Arc<Session>) {
        let released = self
            .holds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| h.checked_sub(1))
            .is_ok();
        if !released {
            warn!("release_hold without a matching hold");
            return;
        }
        self.finish_if_ready(session).await;
    }

    async fn finish_if_ready(&self, session: &Arc<Session>) {
        {
            let state = self.state.lock();
            if !state.requested.is_empty() {
                return;
            }
        }
        if self.holds.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self.end_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        session.send_raw("CAP END".to_owned()).await;
    }

    /// Drop all negotiation state without firing hooks. Called from
    /// `Session::reset` on full disconnect.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.requested.clear();
        self.holds.store(0, Ordering::SeqCst);
        self.end_sent.store(false, Ordering::SeqCst);
    }
}

impl Default for CapRegistry {
    fn default() -> CapRegistry {
        CapRegistry::new()
    }
}

/// Register the built-in capability set: `multi-prefix` plus the
/// pass-through tokens whose effects the normal handlers already parse.
pub fn install_defaults(caps: &CapRegistry) {
    caps.register(Arc::new(MultiPrefixCapability));
    caps.register(Arc::new(PassthroughCapability::new(vec![
        "server-time",
        "batch",
        "znc.in/self-message",
        "znc.in/playback",
    ])));
}

/// Handler for the server's `CAP` messages. Multi-line `LS` and `ACK`
/// listings (continuation marker `*`) are buffered here until the final
/// line arrives, then handed to the registry as one set.
#[derive(Default)]
pub struct CapHandler {
    ls_buffer: Mutex<Vec<(String, Option<String>)>>,
    ack_buffer: Mutex<Vec<String>>,
}

impl CapHandler {
    pub fn new() -> CapHandler {
        CapHandler::default()
    }
}

#[async_trait]
impl CommandHandler for CapHandler {
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> HandlerResult {
        let subcmd = msg.require(1)?.to_ascii_uppercase();
        // `CAP <target> <sub> [*] :<list>`; `*` marks a continuation line.
        let (more, list_index) = if msg.param(2) == Some("*") && msg.param(3).is_some() {
            (true, 3)
        } else {
            (false, 2)
        };
        let list = msg.param(list_index).unwrap_or("");

        match subcmd.as_str() {
            "LS" => {
                // Guard scoped out before the await.
                let tokens = {
                    let mut buffer = self.ls_buffer.lock();
                    buffer.extend(list.split_whitespace().map(parse_cap_token));
                    if more {
                        return Ok(());
                    }
                    std::mem::take(&mut *buffer)
                };
                session.caps().on_advertised(session, tokens).await;
            }
            "ACK" => {
                let tokens = {
                    let mut buffer = self.ack_buffer.lock();
                    buffer.extend(list.split_whitespace().map(str::to_owned));
                    if more {
                        return Ok(());
                    }
                    std::mem::take(&mut *buffer)
                };
                session.caps().on_ack(session, tokens).await;
            }
            "NAK" => {
                let tokens = list.split_whitespace().map(str::to_owned).collect();
                session.caps().on_nak(session, tokens).await;
            }
            "NEW" => {
                let tokens = list.split_whitespace().map(parse_cap_token).collect();
                session.caps().on_advertised(session, tokens).await;
            }
            "DEL" => {
                let tokens = list.split_whitespace().map(str::to_owned).collect();
                session.caps().on_del(session, tokens);
            }
            "LIST" => {
                debug!(list, "server capability list");
            }
            other => {
                warn!(subcmd = other, "unknown CAP subcommand");
                return Err(ProtocolError::UnknownCapSubcommand(other.to_owned()));
            }
        }
        Ok(())
    }

    fn disconnect_aware(&self) -> Option<&dyn DisconnectAware> {
        Some(self)
    }
}

impl DisconnectAware for CapHandler {
    fn on_disconnected(&self) {
        // A half-received multi-line listing must not leak into the next
        // connection attempt.
        self.ls_buffer.lock().clear();
        self.ack_buffer.lock().clear();
    }
}

fn parse_cap_token(token: &str) -> (String, Option<String>) {
    match token.split_once('=') {
        Some((name, value)) => (name.to_owned(), Some(value.to_owned())),
        None => (token.to_owned(), None),
    }
}

/// `multi-prefix`: NAMES and WHO replies carry every membership sigil a
/// user holds, not just the highest-ranked one.
pub struct MultiPrefixCapability;

impl Capability for MultiPrefixCapability {
    fn names(&self) -> Vec<&'static str> {
        vec!["multi-prefix"]
    }

    fn on_enabled(&self, session: &Arc<Session>, _entry: &CapEntry) {
        session.set_multi_prefix(true);
    }

    fn on_disabled(&self, session: &Arc<Session>) {
        session.set_multi_prefix(false);
    }
}

/// Pass-through capability: enabling it changes message content the
/// normal handlers already understand (tags, batches), so no hook fires.
pub struct PassthroughCapability {
    names: Vec<&'static str>,
}

impl PassthroughCapability {
    pub fn new(names: Vec<&'static str>) -> PassthroughCapability {
        PassthroughCapability { names }
    }
}

impl Capability for PassthroughCapability {
    fn names(&self) -> Vec<&'static str> {
        self.names.clone()
    }

    fn on_enabled(&self, _session: &Arc<Session>, _entry: &CapEntry) {}
}
