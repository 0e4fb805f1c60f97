//! Remote kernel delegation.
//!
//! When a gateway is configured and answers the startup ping, kernel
//! lifecycle moves to the remote service. The adapter keeps a shadow
//! [`GatewayKernelRef`] per remote kernel so the manager can answer status
//! and listing queries, and bridges the remote message stream into local
//! session sinks.

mod http;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::fanout::Sink;
use crate::kernel::{KernelInfo, KernelState, KernelStatus};
use crate::protocol::{ExecuteRequest, ExecutionState, KernelMessage, MessageContent};

pub use http::HttpGatewayClient;

/// Bounded queue of remote messages. `None` marks the end of the stream.
pub type RemoteMessages = mpsc::Receiver<Option<KernelMessage>>;

/// Kernel as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteKernel {
    pub id: String,
    /// Spec name on the gateway.
    pub name: String,
    #[serde(default)]
    pub execution_state: Option<ExecutionState>,
}

/// Calls a remote kernel service understands.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;

    async fn start_kernel(&self, spec_name: &str) -> Result<RemoteKernel>;

    async fn execute(&self, kernel_id: &str, request: &ExecuteRequest) -> Result<()>;

    async fn interrupt(&self, kernel_id: &str) -> Result<()>;

    async fn shutdown(&self, kernel_id: &str) -> Result<()>;

    async fn restart(&self, kernel_id: &str) -> Result<RemoteKernel>;

    /// Open a message stream for one subscriber.
    async fn open_messages(&self, kernel_id: &str, capacity: usize) -> Result<RemoteMessages>;
}

/// Shadow record of a kernel whose lifecycle lives on the gateway.
pub struct GatewayKernelRef {
    pub id: String,
    pub spec_name: String,
    pub owner_id: String,
    state: Arc<KernelState>,
    /// Last execution state the gateway reported.
    execution_state: Mutex<ExecutionState>,
    /// Session id -> (token, bridging task). The token tells a finished
    /// bridge whether the entry is still its own.
    bridges: Mutex<FxHashMap<String, (u64, JoinHandle<()>)>>,
    next_bridge: AtomicU64,
}

impl GatewayKernelRef {
    fn new(remote: &RemoteKernel, owner_id: &str) -> Self {
        let state = Arc::new(KernelState::new());
        let execution_state = remote.execution_state.unwrap_or(ExecutionState::Idle);
        apply_execution_state(&state, execution_state);
        Self {
            id: remote.id.clone(),
            spec_name: remote.name.clone(),
            owner_id: owner_id.to_string(),
            state,
            execution_state: Mutex::new(execution_state),
            bridges: Mutex::new(FxHashMap::default()),
            next_bridge: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> KernelStatus {
        self.state.status()
    }

    pub fn execution_state(&self) -> ExecutionState {
        *self.execution_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> KernelInfo {
        KernelInfo {
            id: self.id.clone(),
            spec_name: self.spec_name.clone(),
            status: self.state.status(),
            execution_count: self.state.execution_count(),
            last_activity: self.state.last_activity(),
            owner_id: self.owner_id.clone(),
            remote: true,
        }
    }

    fn record_execution_state(&self, execution_state: ExecutionState) {
        *self.execution_state.lock().unwrap_or_else(|e| e.into_inner()) = execution_state;
        apply_execution_state(&self.state, execution_state);
    }

    /// Start bridging `remote` into `sink`, replacing any bridge the
    /// session already had.
    fn spawn_bridge(self: &Arc<Self>, session_id: &str, remote: RemoteMessages, sink: Sink) {
        let token = self.next_bridge.fetch_add(1, Ordering::Relaxed);
        // Held across the spawn so the task cannot forget itself before it is recorded.
        let mut bridges = self.bridges.lock().unwrap_or_else(|e| e.into_inner());
        let task = tokio::spawn(bridge(
            remote,
            sink,
            self.clone(),
            session_id.to_string(),
            token,
        ));
        if let Some((_, previous)) = bridges.insert(session_id.to_string(), (token, task)) {
            previous.abort();
        }
    }

    /// Drop the entry of a bridge that ended on its own.
    fn forget_bridge(&self, session_id: &str, token: u64) {
        let mut bridges = self.bridges.lock().unwrap_or_else(|e| e.into_inner());
        if bridges.get(session_id).is_some_and(|(current, _)| *current == token) {
            bridges.remove(session_id);
        }
    }

    fn bridge_count(&self) -> usize {
        self.bridges.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn remove_bridge(&self, session_id: &str) -> bool {
        let mut bridges = self.bridges.lock().unwrap_or_else(|e| e.into_inner());
        match bridges.remove(session_id) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn abort_bridges(&self) {
        let mut bridges = self.bridges.lock().unwrap_or_else(|e| e.into_inner());
        for (_, (_, task)) in bridges.drain() {
            task.abort();
        }
    }
}

fn apply_execution_state(state: &KernelState, execution_state: ExecutionState) {
    match execution_state {
        ExecutionState::Starting => state.force_status(KernelStatus::Starting),
        ExecutionState::Idle => state.force_status(KernelStatus::Idle),
        ExecutionState::Busy => state.force_status(KernelStatus::Busy),
        ExecutionState::Unknown => {}
    }
}

/// Forwards lifecycle calls to a gateway and tracks the kernels it owns.
pub struct GatewayAdapter {
    client: Arc<dyn GatewayClient>,
    refs: DashMap<String, Arc<GatewayKernelRef>>,
    queue_capacity: usize,
}

impl GatewayAdapter {
    /// Ping the gateway once. Returns `None` (local-only mode) if it does
    /// not answer within `ping_timeout`.
    pub async fn connect(
        client: Arc<dyn GatewayClient>,
        ping_timeout: Duration,
        queue_capacity: usize,
    ) -> Option<Self> {
        match tokio::time::timeout(ping_timeout, client.ping()).await {
            Ok(Ok(())) => {
                tracing::info!("Kernel gateway reachable; delegating kernel lifecycle");
                Some(Self {
                    client,
                    refs: DashMap::new(),
                    queue_capacity,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!("Kernel gateway unavailable, running kernels locally: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Kernel gateway did not answer within {:?}, running kernels locally",
                    ping_timeout
                );
                None
            }
        }
    }

    /// Whether `kernel_id` belongs to the gateway.
    pub fn knows(&self, kernel_id: &str) -> bool {
        self.refs.contains_key(kernel_id)
    }

    fn get(&self, kernel_id: &str) -> Result<Arc<GatewayKernelRef>> {
        self.refs
            .get(kernel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::KernelNotFound(kernel_id.to_string()))
    }

    pub fn info(&self, kernel_id: &str) -> Option<KernelInfo> {
        self.refs.get(kernel_id).map(|entry| entry.value().info())
    }

    pub fn list_for_owner(&self, owner_id: &str) -> Vec<KernelInfo> {
        self.refs
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Start a kernel remotely and record a reference to it.
    pub async fn start(&self, spec_name: &str, owner_id: &str) -> Result<Arc<GatewayKernelRef>> {
        let remote = self.client.start_kernel(spec_name).await?;
        let kernel_ref = Arc::new(GatewayKernelRef::new(&remote, owner_id));
        self.refs.insert(remote.id.clone(), kernel_ref.clone());
        tracing::info!("Gateway kernel {} ({}) started", remote.id, remote.name);
        Ok(kernel_ref)
    }

    pub async fn execute(&self, kernel_id: &str, request: &ExecuteRequest) -> Result<()> {
        let kernel_ref = self.get(kernel_id)?;
        kernel_ref.state.touch();
        self.client.execute(kernel_id, request).await
    }

    pub async fn interrupt(&self, kernel_id: &str) -> Result<()> {
        self.get(kernel_id)?;
        self.client.interrupt(kernel_id).await
    }

    /// Shut the remote kernel down and forget it.
    ///
    /// The reference is dropped even if the remote call fails.
    pub async fn stop(&self, kernel_id: &str) -> Result<()> {
        let (_, kernel_ref) = self
            .refs
            .remove(kernel_id)
            .ok_or_else(|| Error::KernelNotFound(kernel_id.to_string()))?;
        kernel_ref.abort_bridges();
        kernel_ref.state.mark_dead();
        self.client.shutdown(kernel_id).await
    }

    /// Restart the remote kernel in place. The id stays the same.
    pub async fn restart(&self, kernel_id: &str) -> Result<KernelInfo> {
        let kernel_ref = self.get(kernel_id)?;
        let remote = self.client.restart(kernel_id).await?;
        kernel_ref.state.reset_execution_count();
        kernel_ref.record_execution_state(remote.execution_state.unwrap_or(ExecutionState::Idle));
        Ok(kernel_ref.info())
    }

    /// Bridge the remote stream for `kernel_id` into `sink`.
    pub async fn subscribe(&self, kernel_id: &str, session_id: &str, sink: Sink) -> Result<()> {
        let kernel_ref = self.get(kernel_id)?;
        let remote = self
            .client
            .open_messages(kernel_id, self.queue_capacity)
            .await?;
        kernel_ref.spawn_bridge(session_id, remote, sink);
        Ok(())
    }

    pub fn unsubscribe(&self, kernel_id: &str, session_id: &str) -> bool {
        self.refs
            .get(kernel_id)
            .is_some_and(|entry| entry.value().remove_bridge(session_id))
    }
}

/// Pull remote messages and republish them into one session's sink.
///
/// Ends on the `None` sentinel, when the remote queue closes, or when the
/// session's receiver goes away. On exit the task removes its own entry
/// from the kernel's bridge table.
async fn bridge(
    mut remote: RemoteMessages,
    sink: Sink,
    kernel_ref: Arc<GatewayKernelRef>,
    session_id: String,
    token: u64,
) {
    while let Some(item) = remote.recv().await {
        let Some(message) = item else {
            break;
        };

        if let Some(execution_state) = message.execution_state() {
            kernel_ref.record_execution_state(execution_state);
        }
        kernel_ref.state.observe(&message);

        match sink.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::debug!(
                    "Dropped {} for slow session {}",
                    message.msg_type(),
                    session_id
                );
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    kernel_ref.forget_bridge(&session_id, token);
    tracing::debug!(
        "Bridge for gateway kernel {} session {} finished",
        kernel_ref.id,
        session_id
    );
}

/// Translate a Jupyter-format message (`header`, `parent_header`,
/// `content`, `metadata`) into a [`KernelMessage`].
pub fn translate_remote(value: Value) -> Result<KernelMessage> {
    let Value::Object(mut object) = value else {
        return Err(Error::Decode("gateway message is not an object".to_string()));
    };

    let header = object
        .remove("header")
        .ok_or_else(|| Error::Decode("gateway message has no header".to_string()))?;
    let msg_id = header
        .get("msg_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Decode("gateway message has no msg_id".to_string()))?
        .to_string();
    let msg_type = header
        .get("msg_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Decode("gateway message has no msg_type".to_string()))?
        .to_string();

    let parent_id = object
        .get("parent_header")
        .and_then(|parent| parent.get("msg_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let content = object.remove("content").unwrap_or(Value::Null);
    let content = MessageContent::from_parts(&msg_type, content)
        .map_err(|e| Error::Decode(format!("gateway {} content: {}", msg_type, e)))?;

    let metadata = object
        .remove("metadata")
        .filter(|m| !m.as_object().is_some_and(|o| o.is_empty()) && !m.is_null());

    Ok(KernelMessage {
        msg_id,
        parent_id,
        content,
        metadata,
    })
}
