//! Server support list: feature descriptors advertised via ISUPPORT (005).
//!
//! The engine cares about two tokens: `CHANTYPES` (which leading sigils
//! denote channels) and `PREFIX` (membership sigils and the mode letters
//! they map to, e.g. `PREFIX=(ov)@+`). Everything else is retained as raw
//! key/value pairs for callers that want it.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct SupportInner {
    chan_types: Vec<char>,
    /// Mode letters, highest rank first (`o`, `v`, ...).
    prefix_modes: Vec<char>,
    /// Sigil characters, index-paired with `prefix_modes` (`@`, `+`, ...).
    prefix_sigils: Vec<char>,
    raw: HashMap<String, String>,
}

impl Default for SupportInner {
    fn default() -> SupportInner {
        // RFC 1459 defaults until the server says otherwise.
        SupportInner {
            chan_types: vec!['#', '&'],
            prefix_modes: vec!['o', 'v'],
            prefix_sigils: vec!['@', '+'],
            raw: HashMap::new(),
        }
    }
}

/// Thread-safe support list. Written from the read path (005 handler),
/// read from anywhere.
#[derive(Debug, Default)]
pub struct SupportList {
    inner: RwLock<SupportInner>,
}

impl SupportList {
    pub fn new() -> SupportList {
        SupportList::default()
    }

    /// Ingest one 005 token (`KEY`, `KEY=value` or `-KEY` removal).
    pub fn apply_token(&self, token: &str) {
        if let Some(removed) = token.strip_prefix('-') {
            self.inner.write().raw.remove(removed);
            return;
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, v),
            None => (token, ""),
        };
        let mut inner = self.inner.write();
        match key {
            "CHANTYPES" if !value.is_empty() => {
                inner.chan_types = value.chars().collect();
            }
            "PREFIX" => {
                if let Some((modes, sigils)) = parse_prefix_token(value) {
                    inner.prefix_modes = modes;
                    inner.prefix_sigils = sigils;
                } else {
                    debug!(token = value, "ignoring malformed PREFIX token");
                }
            }
            _ => {}
        }
        inner.raw.insert(key.to_owned(), value.to_owned());
    }

    pub fn is_channel(&self, name: &str) -> bool {
        match name.chars().next() {
            Some(c) => self.inner.read().chan_types.contains(&c),
            None => false,
        }
    }

    pub fn is_prefix_sigil(&self, c: char) -> bool {
        self.inner.read().prefix_sigils.contains(&c)
    }

    /// Translate a membership sigil into its declared mode letter.
    pub fn mode_for_sigil(&self, sigil: char) -> Option<char> {
        let inner = self.inner.read();
        let idx = inner.prefix_sigils.iter().position(|s| *s == sigil)?;
        inner.prefix_modes.get(idx).copied()
    }

    /// Translate a run of sigils (`"@+"`) into mode letters (`"ov"`),
    /// dropping sigils the server never declared.
    pub fn modes_for_sigils(&self, sigils: &str) -> String {
        sigils.chars().filter_map(|c| self.mode_for_sigil(c)).collect()
    }

    pub fn raw_value(&self, key: &str) -> Option<String> {
        self.inner.read().raw.get(key).cloned()
    }
}

/// Parse `(modes)sigils`. The two runs must be the same length.
fn parse_prefix_token(value: &str) -> Option<(Vec<char>, Vec<char>)> {
    let body = value.strip_prefix('(')?;
    let (modes, sigils) = body.split_once(')')?;
    let modes: Vec<char> = modes.chars().collect();
    let sigils: Vec<char> = sigils.chars().collect();
    if modes.len() != sigils.len() || modes.is_empty() {
        return None;
    }
    Some((modes, sigils))
}
