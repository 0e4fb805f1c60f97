//! Kernel status tracking shared between the manager and background tasks.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::{ExecutionState, KernelMessage};

/// Lifecycle state of a kernel.
///
/// `starting -> idle <-> busy -> dead`. `dead` is terminal for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Starting,
    Idle,
    Busy,
    Dead,
}

impl KernelStatus {
    fn as_u8(self) -> u8 {
        match self {
            KernelStatus::Starting => 0,
            KernelStatus::Idle => 1,
            KernelStatus::Busy => 2,
            KernelStatus::Dead => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => KernelStatus::Starting,
            1 => KernelStatus::Idle,
            2 => KernelStatus::Busy,
            _ => KernelStatus::Dead,
        }
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Mutable runtime state of one kernel, updated lock-free by the reader
/// loop, the exit monitor and the manager.
#[derive(Debug)]
pub struct KernelState {
    status: AtomicU8,
    execution_count: AtomicU64,
    /// Milliseconds since the Unix epoch.
    last_activity: AtomicU64,
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(KernelStatus::Starting.as_u8()),
            execution_count: AtomicU64::new(0),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    pub fn status(&self) -> KernelStatus {
        KernelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_dead(&self) -> bool {
        self.status() == KernelStatus::Dead
    }

    /// Move to `status` unless the kernel is already dead.
    ///
    /// Returns `false` when the transition was refused.
    pub fn set_status(&self, status: KernelStatus) -> bool {
        let next = status.as_u8();
        let dead = KernelStatus::Dead.as_u8();
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != dead).then_some(next)
            })
            .is_ok()
    }

    pub fn mark_dead(&self) {
        self.status.store(KernelStatus::Dead.as_u8(), Ordering::Release);
    }

    /// Overwrite the status, dead or not. Remote kernels report their state
    /// rather than having it observed, so a restart can revive them.
    pub(crate) fn force_status(&self, status: KernelStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// A remote restart starts counting from zero again.
    pub(crate) fn reset_execution_count(&self) {
        self.execution_count.store(0, Ordering::Release);
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Release);
    }

    /// Fold an inbound message into the state.
    ///
    /// Updates `last_activity`, follows `status` messages, and records the
    /// engine's execution count. The count is only ever raised.
    pub fn observe(&self, message: &KernelMessage) {
        self.touch();

        match message.execution_state() {
            Some(ExecutionState::Idle) => {
                self.set_status(KernelStatus::Idle);
            }
            Some(ExecutionState::Busy) => {
                self.set_status(KernelStatus::Busy);
            }
            Some(ExecutionState::Starting) => {
                self.set_status(KernelStatus::Starting);
            }
            Some(ExecutionState::Unknown) | None => {}
        }

        if let Some(count) = message.execution_count() {
            self.execution_count.fetch_max(count, Ordering::AcqRel);
        }
    }
}

/// Externally visible snapshot of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: String,
    pub spec_name: String,
    pub status: KernelStatus,
    pub execution_count: u64,
    /// Milliseconds since the Unix epoch.
    pub last_activity: u64,
    pub owner_id: String,
    /// Whether the kernel lives on a remote gateway.
    pub remote: bool,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExecuteReplyContent, MessageContent, ReplyStatus};

    #[test]
    fn test_new_state_is_starting() {
        let state = KernelState::new();
        assert_eq!(state.status(), KernelStatus::Starting);
        assert_eq!(state.execution_count(), 0);
    }

    #[test]
    fn test_dead_is_terminal() {
        let state = KernelState::new();
        state.mark_dead();
        assert!(!state.set_status(KernelStatus::Idle));
        state.observe(&KernelMessage::status(None, ExecutionState::Busy));
        assert_eq!(state.status(), KernelStatus::Dead);
    }

    #[test]
    fn test_observe_status_transitions() {
        let state = KernelState::new();
        state.observe(&KernelMessage::status(None, ExecutionState::Idle));
        assert_eq!(state.status(), KernelStatus::Idle);
        state.observe(&KernelMessage::status(None, ExecutionState::Busy));
        assert_eq!(state.status(), KernelStatus::Busy);
        state.observe(&KernelMessage::status(None, ExecutionState::Unknown));
        assert_eq!(state.status(), KernelStatus::Busy);
    }

    #[test]
    fn test_execution_count_never_decreases() {
        let state = KernelState::new();
        let reply = |count| {
            KernelMessage::new(
                Some("p"),
                MessageContent::ExecuteReply(ExecuteReplyContent {
                    status: ReplyStatus::Ok,
                    execution_count: count,
                    ename: None,
                    evalue: None,
                }),
            )
        };
        state.observe(&reply(3));
        state.observe(&reply(2));
        assert_eq!(state.execution_count(), 3);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(KernelStatus::Busy.to_string(), "busy");
        assert_eq!(serde_json::to_string(&KernelStatus::Dead).unwrap(), "\"dead\"");
    }
}
