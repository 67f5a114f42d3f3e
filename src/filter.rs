//! Ordered admit/drop filter chain for inbound chat events.
//!
//! Every inbound chat event passes through the chain before it reaches
//! storage or observers. A filter returning `false` stops the chain and
//! drops the event; a filter may instead buffer the event privately and
//! re-inject it later through [`FilterChain::admit_except`], which runs
//! every other filter but skips the named one.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::ChatEvent;
use crate::session::Session;

pub trait MessageFilter: Send + Sync {
    /// Stable name, used by `admit_except` to skip a filter during
    /// re-injection.
    fn name(&self) -> &'static str;

    /// `false` means drop: do not forward this event.
    fn filter(&self, session: &Arc<Session>, channel: Option<&str>, event: &ChatEvent) -> bool;
}

#[derive(Default)]
pub struct FilterChain {
    filters: Mutex<Vec<Arc<dyn MessageFilter>>>,
}

impl FilterChain {
    pub fn new() -> FilterChain {
        FilterChain::default()
    }

    pub fn add(&self, filter: Arc<dyn MessageFilter>) {
        self.filters.lock().push(filter);
    }

    pub fn remove(&self, name: &str) {
        self.filters.lock().retain(|f| f.name() != name);
    }

    /// Apply the full chain.
    pub fn admit(&self, session: &Arc<Session>, channel: Option<&str>, event: &ChatEvent) -> bool {
        self.admit_inner(session, channel, event, None)
    }

    /// Apply the full chain except the named filter.
    pub fn admit_except(
        &self,
        session: &Arc<Session>,
        channel: Option<&str>,
        event: &ChatEvent,
        skip: &str,
    ) -> bool {
        self.admit_inner(session, channel, event, Some(skip))
    }

    fn admit_inner(
        &self,
        session: &Arc<Session>,
        channel: Option<&str>,
        event: &ChatEvent,
        skip: Option<&str>,
    ) -> bool {
        // Snapshot so a filter may add/remove filters without deadlocking.
        let filters: Vec<Arc<dyn MessageFilter>> = self.filters.lock().clone();
        for filter in filters {
            if skip == Some(filter.name()) {
                continue;
            }
            if !filter.filter(session, channel, event) {
                return false;
            }
        }
        true
    }
}

/// Drops events whose sender nick matches one of the configured masks
/// (`*` wildcards). The client-side equivalent of an ignore list.
pub struct IgnoreListFilter {
    masks: Vec<String>,
}

impl IgnoreListFilter {
    pub fn new(masks: Vec<String>) -> IgnoreListFilter {
        IgnoreListFilter { masks }
    }
}

impl MessageFilter for IgnoreListFilter {
    fn name(&self) -> &'static str {
        "ignore-list"
    }

    fn filter(&self, _session: &Arc<Session>, _channel: Option<&str>, event: &ChatEvent) -> bool {
        match event.sender_nick() {
            Some(nick) => !self.masks.iter().any(|m| wildcard_match(m, nick)),
            None => true,
        }
    }
}

/// Case-insensitive glob match supporting `*` only.
pub(crate) fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    let value: Vec<char> = value.to_ascii_lowercase().chars().collect();

    // Classic two-pointer wildcard walk with backtracking to the last `*`.
    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && (pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((sp, sv)) = star {
            p = sp + 1;
            v = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_basics() {
        assert!(wildcard_match("alice", "Alice"));
        assert!(wildcard_match("a*", "alice"));
        assert!(wildcard_match("*ce", "alice"));
        assert!(wildcard_match("*li*", "alice"));
        assert!(!wildcard_match("bob", "alice"));
        assert!(!wildcard_match("a*x", "alice"));
        assert!(wildcard_match("*", "anything"));
    }
}
