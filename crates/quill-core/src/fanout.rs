//! Per-kernel output fan-out.
//!
//! Each kernel owns one [`OutputFanout`]. Sessions register a bounded
//! [`Sink`] and receive every message the kernel emits from then on.
//! Delivery is best effort: a sink whose buffer is full misses that
//! message, and no other sink or the reader loop waits on it.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::kernel::KernelState;
use crate::protocol::KernelMessage;

/// Sending half of a session's bounded delivery queue.
pub type Sink = mpsc::Sender<KernelMessage>;

/// Receiving half of a session's bounded delivery queue.
pub type SinkReceiver = mpsc::Receiver<KernelMessage>;

/// Create a bounded sink for one session.
pub fn sink(capacity: usize) -> (Sink, SinkReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Subscriber set for one kernel.
#[derive(Debug, Default)]
pub struct OutputFanout {
    /// Session id -> sink. Broadcast takes the read side; (un)subscribe the write side.
    sinks: RwLock<FxHashMap<String, Sink>>,
    /// Messages dropped because a sink was full.
    dropped: AtomicU64,
}

impl OutputFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` for `session_id`, replacing any previous sink for that session.
    pub fn subscribe(&self, session_id: &str, sink: Sink) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        if sinks.insert(session_id.to_string(), sink).is_some() {
            tracing::debug!("Replaced sink for session {}", session_id);
        }
    }

    /// Remove the sink for `session_id`. Returns whether one was registered.
    pub fn unsubscribe(&self, session_id: &str) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.remove(session_id).is_some()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total messages dropped on full sinks since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record `message` in `state` and deliver it to every registered sink.
    ///
    /// Never blocks. Returns the number of sinks that accepted the message.
    /// Sinks whose receiver has gone away are unregistered.
    pub fn broadcast(&self, state: &KernelState, message: &KernelMessage) -> usize {
        state.observe(message);

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
            for (session_id, sink) in sinks.iter() {
                match sink.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            "Dropped {} for slow session {}",
                            message.msg_type(),
                            session_id
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(session_id.clone()),
                }
            }
        }

        if !closed.is_empty() {
            let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
            for session_id in closed {
                // Only remove if the session has not re-subscribed in the meantime.
                if sinks.get(&session_id).is_some_and(|s| s.is_closed()) {
                    sinks.remove(&session_id);
                }
            }
        }

        delivered
    }
}
