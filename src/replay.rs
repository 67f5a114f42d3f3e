//! History replay reconciliation.
//!
//! Bouncer-style servers replay recent channel history in a tagged batch
//! after reconnect. Some of those lines were already delivered (and
//! persisted) before the link dropped. The replay filter buffers every
//! event that belongs to a replay batch; when the batch closes, the
//! buffered run is compared against the persisted tail and only the
//! unseen remainder is re-injected, so reconnecting twice never
//! duplicates history.
//!
//! Reconciliation runs on a spawned task, never on the read path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::batch::{BatchInfo, BatchListener};
use crate::event::ChatEvent;
use crate::filter::MessageFilter;
use crate::session::Session;

pub const REPLAY_FILTER_NAME: &str = "replay";

pub struct ReplayFilter {
    batch_type: String,
    /// Events buffered while a replay batch is open, per channel.
    buffers: Mutex<HashMap<String, Vec<ChatEvent>>>,
}

impl ReplayFilter {
    pub fn new(batch_type: impl Into<String>) -> ReplayFilter {
        ReplayFilter {
            batch_type: batch_type.into(),
            buffers: Mutex::new(HashMap::new()),
        }
    }
}

impl MessageFilter for ReplayFilter {
    fn name(&self) -> &'static str {
        REPLAY_FILTER_NAME
    }

    fn filter(&self, _session: &Arc<Session>, channel: Option<&str>, event: &ChatEvent) -> bool {
        let Some(batch) = &event.batch else {
            return true;
        };
        if batch.batch_type != self.batch_type {
            return true;
        }
        let Some(channel) = channel else {
            return true;
        };
        self.buffers
            .lock()
            .entry(channel.to_owned())
            .or_default()
            .push(event.clone());
        false
    }
}

impl BatchListener for ReplayFilter {
    fn on_batch_end(&self, session: &Arc<Session>, batch: &BatchInfo) {
        let buffers = std::mem::take(&mut *self.buffers.lock());
        if buffers.is_empty() {
            return;
        }
        debug!(reference = %batch.reference, channels = buffers.len(), "replay batch closed");
        let session = Arc::clone(session);
        tokio::spawn(async move {
            for (channel, buffered) in buffers {
                reconcile(&session, &channel, buffered).await;
            }
        });
    }
}

async fn reconcile(session: &Arc<Session>, channel: &str, buffered: Vec<ChatEvent>) {
    let tail = session.storage().recent_tail(channel, buffered.len()).await;
    let overlap = overlap_len(&tail, &buffered);
    debug!(
        channel,
        buffered = buffered.len(),
        overlap,
        "reconciled replay batch"
    );
    for event in buffered.into_iter().skip(overlap) {
        session
            .deliver_event_skipping(REPLAY_FILTER_NAME, Some(channel), event)
            .await;
    }
}

/// Longest `n` such that the last `n` persisted events match the first
/// `n` replayed events, compared on text and sender nick. Scanned
/// longest-first so a repeated short message cannot shadow a longer
/// genuine overlap.
fn overlap_len(tail: &[ChatEvent], buffered: &[ChatEvent]) -> usize {
    let max = tail.len().min(buffered.len());
    for n in (1..=max).rev() {
        let suffix = &tail[tail.len() - n..];
        if suffix
            .iter()
            .zip(&buffered[..n])
            .all(|(a, b)| a.text == b.text && a.sender_nick() == b.sender_nick())
        {
            return n;
        }
    }
    0
}
