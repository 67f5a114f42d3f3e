//! Engine configuration.
//!
//! Deserialized from TOML by the embedding application, or built in code
//! for tests. Every field has a default so a minimal config is just a
//! nick.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// One reconnect backoff rule: retry `repeat` times with `delay_ms`
/// between attempts. A rule with `repeat` omitted applies forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ReconnectRule {
    pub repeat: Option<u32>,
    pub delay_ms: u64,
}

impl ReconnectRule {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub nick: String,
    pub username: String,
    pub realname: String,

    /// Channels joined automatically after registration.
    pub autojoin: Vec<String>,
    /// Rejoin channels we were in before an unexpected disconnect.
    pub rejoin_on_reconnect: bool,
    /// Raw lines sent after registration, before autojoin.
    pub post_connect_commands: Vec<String>,

    /// Backoff schedule for automatic reconnection. Empty disables it.
    pub reconnect_rules: Vec<ReconnectRule>,
    /// React to connectivity restoration by retrying early.
    pub reconnect_on_connectivity_restore: bool,

    pub quit_message: String,
    /// Batch type that marks history replay (ZNC playback by default).
    pub replay_batch_type: String,
    /// Sender-nick masks dropped by the ignore filter.
    pub ignore_masks: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            nick: "ircore".to_owned(),
            username: "ircore".to_owned(),
            realname: "ircore user".to_owned(),
            autojoin: Vec::new(),
            rejoin_on_reconnect: true,
            post_connect_commands: Vec::new(),
            reconnect_rules: vec![
                ReconnectRule {
                    repeat: Some(3),
                    delay_ms: 2_000,
                },
                ReconnectRule {
                    repeat: None,
                    delay_ms: 15_000,
                },
            ],
            reconnect_on_connectivity_restore: true,
            quit_message: "Quit".to_owned(),
            replay_batch_type: "znc.in/playback".to_owned(),
            ignore_masks: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(raw: &str) -> anyhow::Result<EngineConfig> {
        toml::from_str(raw).context("invalid engine config")
    }

    pub fn from_path(path: &Path) -> anyhow::Result<EngineConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        EngineConfig::from_toml(&raw)
    }
}
