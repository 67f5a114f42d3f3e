//! Request/response correlation for commands the protocol answers
//! asynchronously (NICK, WHOIS and friends).
//!
//! Each pending request holds a single-use completion callback. The
//! callback is taken out of the table under one lock and invoked outside
//! it, so success, error and cancellation can race freely and the caller
//! still observes exactly one resolution.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

use crate::error::CorrelateError;

/// Server-reported failure for a correlated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericError {
    pub code: u16,
    pub message: Option<String>,
}

/// How a pending request resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    Error(NumericError),
    /// The connection went away before the server answered.
    Cancelled,
}

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

/// Pending-request table keyed by request identity (e.g. the requested
/// nick). Queueing policy is the caller's choice per request:
/// [`Correlator::enqueue`] accepts any number of requests per key in FIFO
/// order, [`Correlator::try_request`] rejects while one is pending.
pub struct Correlator<K, T> {
    pending: Mutex<HashMap<K, VecDeque<Callback<T>>>>,
}

impl<K: Eq + Hash + Clone, T> Correlator<K, T> {
    pub fn new() -> Correlator<K, T> {
        Correlator {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a request behind any already pending for this key.
    pub fn enqueue(&self, key: K, callback: impl FnOnce(Outcome<T>) + Send + 'static) {
        self.pending
            .lock()
            .entry(key)
            .or_default()
            .push_back(Box::new(callback));
    }

    /// Register a request, rejecting if one is already pending for the key.
    pub fn try_request(
        &self,
        key: K,
        callback: impl FnOnce(Outcome<T>) + Send + 'static,
    ) -> Result<(), CorrelateError> {
        let mut pending = self.pending.lock();
        let queue = pending.entry(key).or_default();
        if !queue.is_empty() {
            return Err(CorrelateError::AlreadyPending);
        }
        queue.push_back(Box::new(callback));
        Ok(())
    }

    /// Resolve the oldest pending request for `key` with a success value.
    /// Returns `false` if nothing was pending (unsolicited response).
    pub fn complete(&self, key: &K, value: T) -> bool {
        match self.take(key) {
            Some(callback) => {
                callback(Outcome::Success(value));
                true
            }
            None => false,
        }
    }

    /// Resolve the oldest pending request for `key` with a server error.
    pub fn fail(&self, key: &K, error: NumericError) -> bool {
        match self.take(key) {
            Some(callback) => {
                callback(Outcome::Error(error));
                true
            }
            None => false,
        }
    }

    /// Resolve the oldest pending request regardless of key. Used for
    /// error numerics that do not echo the request argument.
    pub fn fail_any(&self, error: NumericError) -> bool {
        let callback = {
            let mut pending = self.pending.lock();
            let key = pending.keys().next().cloned();
            key.and_then(|k| Self::pop_front(&mut pending, &k))
        };
        match callback {
            Some(callback) => {
                callback(Outcome::Error(error));
                true
            }
            None => false,
        }
    }

    /// Cancel the oldest pending request for `key`, if any.
    pub fn cancel(&self, key: &K) -> bool {
        match self.take(key) {
            Some(callback) => {
                callback(Outcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Cancel everything. Called on disconnect; each request observes
    /// exactly one `Cancelled`, even if a completion raced and won.
    pub fn cancel_all(&self) {
        let callbacks: Vec<Callback<T>> = {
            let mut pending = self.pending.lock();
            pending.drain().flat_map(|(_, queue)| queue).collect()
        };
        for callback in callbacks {
            callback(Outcome::Cancelled);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().values().map(VecDeque::len).sum()
    }

    fn take(&self, key: &K) -> Option<Callback<T>> {
        let mut pending = self.pending.lock();
        Self::pop_front(&mut pending, key)
    }

    fn pop_front(
        pending: &mut HashMap<K, VecDeque<Callback<T>>>,
        key: &K,
    ) -> Option<Callback<T>> {
        let queue = pending.get_mut(key)?;
        let callback = queue.pop_front();
        if queue.is_empty() {
            pending.remove(key);
        }
        callback
    }
}

impl<K: Eq + Hash + Clone, T> Default for Correlator<K, T> {
    fn default() -> Correlator<K, T> {
        Correlator::new()
    }
}
