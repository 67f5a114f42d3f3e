//! IRCv3 batch tracking.
//!
//! The server opens a batch with `BATCH +ref <type> [args]`, tags member
//! messages with `batch=ref`, and closes it with `BATCH -ref`. Listeners
//! subscribe by batch type and get a signal at batch end; the replay
//! reconciler is the primary consumer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::Session;

/// One open (or just-closed) batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    pub reference: String,
    pub batch_type: String,
    pub args: Vec<String>,
}

/// Batch-end subscriber, keyed by batch type.
pub trait BatchListener: Send + Sync {
    fn on_batch_start(&self, _session: &Arc<Session>, _batch: &BatchInfo) {}
    fn on_batch_end(&self, session: &Arc<Session>, batch: &BatchInfo);
}

#[derive(Default)]
pub struct BatchTracker {
    open: Mutex<HashMap<String, BatchInfo>>,
    listeners: Mutex<Vec<(String, Arc<dyn BatchListener>)>>,
}

impl BatchTracker {
    pub fn new() -> BatchTracker {
        BatchTracker::default()
    }

    pub fn add_listener(&self, batch_type: impl Into<String>, listener: Arc<dyn BatchListener>) {
        self.listeners.lock().push((batch_type.into(), listener));
    }

    /// Look up an open batch by its reference token (from a `batch` tag).
    pub fn open_batch(&self, reference: &str) -> Option<BatchInfo> {
        self.open.lock().get(reference).cloned()
    }

    pub fn start(&self, session: &Arc<Session>, batch: BatchInfo) {
        self.open
            .lock()
            .insert(batch.reference.clone(), batch.clone());
        for (batch_type, listener) in self.listeners.lock().iter() {
            if *batch_type == batch.batch_type {
                listener.on_batch_start(session, &batch);
            }
        }
    }

    /// Close a batch by reference. Unknown references are ignored (the
    /// server may close batches opened before we started tracking).
    pub fn end(&self, session: &Arc<Session>, reference: &str) {
        let Some(batch) = self.open.lock().remove(reference) else {
            return;
        };
        // Listener snapshot: a listener may re-enter the tracker.
        let listeners: Vec<(String, Arc<dyn BatchListener>)> = self.listeners.lock().clone();
        for (batch_type, listener) in listeners {
            if batch_type == batch.batch_type {
                listener.on_batch_end(session, &batch);
            }
        }
    }

    /// Drop all open batches without signalling. Called on disconnect so
    /// a half-open batch cannot leak into the next connection attempt.
    pub fn clear(&self) {
        self.open.lock().clear();
    }
}
