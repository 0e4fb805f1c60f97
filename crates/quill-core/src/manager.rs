//! Kernel lifecycle manager.
//!
//! The manager is the single entry point collaborators use: it starts,
//! stops, restarts and interrupts kernels, forwards execute requests, and
//! routes subscriptions. Every call first checks whether the kernel id
//! belongs to the gateway; if so the call is delegated, otherwise it goes
//! to the local registry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::fanout::{OutputFanout, Sink};
use crate::gateway::{GatewayAdapter, GatewayClient, HttpGatewayClient};
use crate::kernel::{KernelInfo, KernelState, KernelStatus};
use crate::paths::KernelDirs;
use crate::protocol::{Directive, ExecuteRequest};
use crate::spec::{KernelSpec, SpecCatalog};
use crate::supervisor::{self, KernelIo};

/// How long to wait for a killed process to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// A live local kernel.
pub(crate) struct KernelInstance {
    pub(crate) id: String,
    pub(crate) spec_name: String,
    pub(crate) owner_id: String,
    pub(crate) state: Arc<KernelState>,
    pub(crate) fanout: Arc<OutputFanout>,
    pub(crate) io: Arc<dyn KernelIo>,
    pub(crate) dirs: Option<KernelDirs>,
}

impl KernelInstance {
    fn info(&self) -> KernelInfo {
        KernelInfo {
            id: self.id.clone(),
            spec_name: self.spec_name.clone(),
            status: self.state.status(),
            execution_count: self.state.execution_count(),
            last_activity: self.state.last_activity(),
            owner_id: self.owner_id.clone(),
            remote: false,
        }
    }

    /// Ask the engine to exit, kill it after `grace`, and remove its working area.
    async fn shutdown(&self, grace: Duration) {
        if !self.io.has_exited()
            && let Err(e) = self.io.send(&Directive::Shutdown).await
        {
            tracing::debug!("Shutdown directive to kernel {} failed: {}", self.id, e);
        }

        if !self.io.wait_exit(grace).await {
            tracing::warn!(
                "Kernel {} did not exit within {:?}; killing it",
                self.id,
                grace
            );
            self.io.kill();
            if !self.io.wait_exit(KILL_REAP_TIMEOUT).await {
                tracing::warn!("Kernel {} still running after kill", self.id);
            }
        }

        self.state.mark_dead();

        if let Some(dirs) = &self.dirs
            && let Err(e) = dirs.remove()
        {
            tracing::warn!("Failed to remove {}: {}", dirs.root.display(), e);
        }
    }
}

/// Orchestrates kernels on behalf of many concurrent callers.
pub struct KernelManager {
    config: KernelConfig,
    catalog: SpecCatalog,
    /// Local kernels by id. Sharded, so unrelated kernels never contend.
    kernels: DashMap<String, Arc<KernelInstance>>,
    /// Present only if the gateway answered the startup ping.
    gateway: Option<GatewayAdapter>,
}

impl KernelManager {
    /// Create a manager from configuration.
    ///
    /// If a gateway is configured it is pinged once here; an unreachable
    /// gateway leaves the manager in local-only mode for its lifetime.
    pub async fn new(config: KernelConfig) -> Self {
        let catalog = SpecCatalog::from_config(&config);
        let gateway = match &config.gateway {
            Some(gateway_config) => match HttpGatewayClient::new(gateway_config) {
                Ok(client) => {
                    GatewayAdapter::connect(
                        Arc::new(client),
                        gateway_config.ping_timeout,
                        gateway_config.message_queue_capacity,
                    )
                    .await
                }
                Err(e) => {
                    tracing::warn!("Kernel gateway disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        Self {
            config,
            catalog,
            kernels: DashMap::new(),
            gateway,
        }
    }

    /// Create a local-only manager over an explicit catalog.
    pub fn with_catalog(config: KernelConfig, catalog: SpecCatalog) -> Self {
        Self {
            config,
            catalog,
            kernels: DashMap::new(),
            gateway: None,
        }
    }

    /// Create a manager that delegates to `client` if it answers a ping.
    pub async fn with_gateway_client(
        config: KernelConfig,
        catalog: SpecCatalog,
        client: Arc<dyn GatewayClient>,
        ping_timeout: Duration,
    ) -> Self {
        let gateway = GatewayAdapter::connect(client, ping_timeout, config.sink_capacity).await;
        Self {
            config,
            catalog,
            kernels: DashMap::new(),
            gateway,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Whether kernel lifecycle is delegated to a gateway.
    pub fn gateway_active(&self) -> bool {
        self.gateway.is_some()
    }

    /// Gateway adapter if `kernel_id` is one of its kernels.
    fn remote(&self, kernel_id: &str) -> Option<&GatewayAdapter> {
        self.gateway.as_ref().filter(|gateway| gateway.knows(kernel_id))
    }

    fn local(&self, kernel_id: &str) -> Result<Arc<KernelInstance>> {
        self.kernels
            .get(kernel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::KernelNotFound(kernel_id.to_string()))
    }

    /// All kernel specs available to `start`.
    pub async fn list_specs(&self) -> Vec<KernelSpec> {
        self.catalog.list().await
    }

    /// Start a kernel for `spec_name` owned by `owner_id`.
    pub async fn start(&self, spec_name: &str, owner_id: &str) -> Result<KernelInfo> {
        if let Some(gateway) = &self.gateway {
            let kernel_ref = gateway.start(spec_name, owner_id).await?;
            if self.kernels.contains_key(&kernel_ref.id) {
                // Ids must never be live in both places.
                let _ = gateway.stop(&kernel_ref.id).await;
                return Err(Error::Gateway(format!(
                    "gateway returned id {} already used by a local kernel",
                    kernel_ref.id
                )));
            }
            return Ok(kernel_ref.info());
        }

        let spec = self.catalog.resolve(spec_name).await?;
        let kernel_id = uuid::Uuid::new_v4().to_string();
        let instance = self
            .launch(&spec, &kernel_id, owner_id, Arc::new(OutputFanout::new()))
            .await?;
        let info = instance.info();
        self.kernels.insert(kernel_id, instance);
        Ok(info)
    }

    /// Spawn an engine for `spec` and wrap it as an instance under `kernel_id`.
    async fn launch(
        &self,
        spec: &KernelSpec,
        kernel_id: &str,
        owner_id: &str,
        fanout: Arc<OutputFanout>,
    ) -> Result<Arc<KernelInstance>> {
        let state = Arc::new(KernelState::new());
        let launched =
            supervisor::launch(spec, kernel_id, &self.config, state.clone(), fanout.clone()).await?;

        Ok(Arc::new(KernelInstance {
            id: kernel_id.to_string(),
            spec_name: spec.name.clone(),
            owner_id: owner_id.to_string(),
            state,
            fanout,
            io: launched.process,
            dirs: Some(launched.dirs),
        }))
    }

    /// Send an execute request. Output arrives through subscribed sinks.
    ///
    /// A failed write marks the kernel dead; the caller must restart it.
    pub async fn execute(&self, kernel_id: &str, request: ExecuteRequest) -> Result<()> {
        if let Some(gateway) = self.remote(kernel_id) {
            return gateway.execute(kernel_id, &request).await;
        }

        let instance = self.local(kernel_id)?;
        if instance.state.is_dead() || instance.io.has_exited() {
            instance.state.mark_dead();
            return Err(Error::KernelDead(kernel_id.to_string()));
        }

        tracing::debug!("Executing {} on kernel {}", request.msg_id, kernel_id);
        if let Err(e) = instance.io.send(&Directive::Execute(request)).await {
            tracing::warn!("Kernel {} marked dead: {}", kernel_id, e);
            instance.state.mark_dead();
            return Err(e);
        }
        instance.state.touch();
        Ok(())
    }

    /// Interrupt the running submission. Fire and forget.
    pub async fn interrupt(&self, kernel_id: &str) -> Result<()> {
        if let Some(gateway) = self.remote(kernel_id) {
            return gateway.interrupt(kernel_id).await;
        }

        let instance = self.local(kernel_id)?;
        if instance.state.is_dead() {
            return Err(Error::KernelDead(kernel_id.to_string()));
        }
        instance.io.interrupt().await
    }

    /// Stop a kernel and forget it.
    ///
    /// Sends a shutdown directive, waits up to the configured grace period,
    /// then kills. The kernel is unregistered and its working area removed
    /// however it ended.
    pub async fn stop(&self, kernel_id: &str) -> Result<()> {
        if let Some(gateway) = self.remote(kernel_id) {
            return gateway.stop(kernel_id).await;
        }

        let (_, instance) = self
            .kernels
            .remove(kernel_id)
            .ok_or_else(|| Error::KernelNotFound(kernel_id.to_string()))?;
        instance.shutdown(self.config.stop_grace).await;
        instance.fanout.clear();
        tracing::info!("Kernel {} stopped", kernel_id);
        Ok(())
    }

    /// Replace a kernel with a fresh one under the same id.
    ///
    /// Subscriptions carry over. The execution count starts again from zero.
    pub async fn restart(&self, kernel_id: &str) -> Result<KernelInfo> {
        if let Some(gateway) = self.remote(kernel_id) {
            return gateway.restart(kernel_id).await;
        }

        let (_, old) = self
            .kernels
            .remove(kernel_id)
            .ok_or_else(|| Error::KernelNotFound(kernel_id.to_string()))?;
        let spec_name = old.spec_name.clone();
        let owner_id = old.owner_id.clone();
        old.shutdown(self.config.stop_grace).await;

        let spec = self.catalog.resolve(&spec_name).await?;
        let instance = self
            .launch(&spec, kernel_id, &owner_id, old.fanout.clone())
            .await?;
        let info = instance.info();
        self.kernels.insert(kernel_id.to_string(), instance);
        tracing::info!("Kernel {} restarted", kernel_id);
        Ok(info)
    }

    /// Current status of a kernel.
    pub fn status(&self, kernel_id: &str) -> Result<KernelStatus> {
        self.info(kernel_id).map(|info| info.status)
    }

    /// Snapshot of a kernel.
    pub fn info(&self, kernel_id: &str) -> Result<KernelInfo> {
        if let Some(info) = self.gateway.as_ref().and_then(|g| g.info(kernel_id)) {
            return Ok(info);
        }
        self.local(kernel_id).map(|instance| instance.info())
    }

    /// Every kernel owned by `owner_id`, local and remote.
    pub fn list_for_owner(&self, owner_id: &str) -> Vec<KernelInfo> {
        let mut kernels: Vec<KernelInfo> = self
            .kernels
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().info())
            .collect();
        if let Some(gateway) = &self.gateway {
            kernels.extend(gateway.list_for_owner(owner_id));
        }
        kernels
    }

    /// Deliver the kernel's future output to `sink` for `session_id`.
    ///
    /// Unknown kernel ids are ignored.
    pub async fn subscribe(&self, kernel_id: &str, session_id: &str, sink: Sink) {
        if let Some(gateway) = self.remote(kernel_id) {
            if let Err(e) = gateway.subscribe(kernel_id, session_id, sink).await {
                tracing::warn!(
                    "Could not bridge gateway kernel {} for session {}: {}",
                    kernel_id,
                    session_id,
                    e
                );
            }
            return;
        }

        match self.kernels.get(kernel_id) {
            Some(entry) => entry.value().fanout.subscribe(session_id, sink),
            None => tracing::debug!("Ignoring subscribe to unknown kernel {}", kernel_id),
        }
    }

    /// Stop delivering output to `session_id`. Repeated calls are no-ops.
    pub fn unsubscribe(&self, kernel_id: &str, session_id: &str) {
        if let Some(gateway) = self.remote(kernel_id) {
            gateway.unsubscribe(kernel_id, session_id);
            return;
        }

        if let Some(entry) = self.kernels.get(kernel_id) {
            entry.value().fanout.unsubscribe(session_id);
        }
    }

    /// Stop every local kernel.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.kernels.iter().map(|entry| entry.key().clone()).collect();
        for kernel_id in ids {
            if let Err(e) = self.stop(&kernel_id).await {
                tracing::debug!("Kernel {} already gone: {}", kernel_id, e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_local(&self, instance: KernelInstance) {
        self.kernels.insert(instance.id.clone(), Arc::new(instance));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::sink;
    use crate::gateway::tests::FakeGateway;
    use crate::protocol::{ExecutionState, KernelMessage};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Kernel I/O double that records directives.
    #[derive(Default)]
    struct FakeIo {
        fail_writes: bool,
        /// Exit as soon as a shutdown directive arrives.
        obey_shutdown: bool,
        exited: AtomicBool,
        killed: AtomicBool,
        sent: Mutex<Vec<Directive>>,
    }

    #[async_trait]
    impl KernelIo for FakeIo {
        async fn send(&self, directive: &Directive) -> Result<()> {
            if self.fail_writes {
                return Err(Error::Write {
                    kernel_id: "fake".to_string(),
                    message: "broken pipe".to_string(),
                });
            }
            if self.obey_shutdown && *directive == Directive::Shutdown {
                self.exited.store(true, Ordering::SeqCst);
            }
            self.sent.lock().unwrap().push(directive.clone());
            Ok(())
        }

        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
            self.exited.store(true, Ordering::SeqCst);
        }

        fn has_exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        async fn wait_exit(&self, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            while tokio::time::Instant::now() < deadline {
                if self.has_exited() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.has_exited()
        }
    }

    fn manager() -> KernelManager {
        let config = KernelConfig {
            stop_grace: Duration::from_millis(50),
            ..KernelConfig::default()
        };
        KernelManager::with_catalog(config, SpecCatalog::new(Vec::new(), None, Duration::from_secs(1)))
    }

    fn instance(id: &str, owner: &str, io: Arc<FakeIo>) -> KernelInstance {
        let state = Arc::new(KernelState::new());
        state.set_status(KernelStatus::Idle);
        KernelInstance {
            id: id.to_string(),
            spec_name: "fake".to_string(),
            owner_id: owner.to_string(),
            state,
            fanout: Arc::new(OutputFanout::new()),
            io,
            dirs: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_kernel_operations() {
        let manager = manager();
        assert!(matches!(
            manager.execute("nope", ExecuteRequest::new("1")).await,
            Err(Error::KernelNotFound(_))
        ));
        assert!(matches!(manager.stop("nope").await, Err(Error::KernelNotFound(_))));
        assert!(matches!(manager.status("nope"), Err(Error::KernelNotFound(_))));
        assert!(matches!(manager.interrupt("nope").await, Err(Error::KernelNotFound(_))));

        // Subscribing to an unknown kernel is a silent no-op.
        let (tx, _rx) = sink(1);
        manager.subscribe("nope", "s", tx).await;
        manager.unsubscribe("nope", "s");
    }

    #[tokio::test]
    async fn test_start_unknown_spec() {
        let manager = manager();
        assert!(matches!(
            manager.start("missing", "u1").await,
            Err(Error::SpecNotFound(_))
        ));
        assert!(manager.list_for_owner("u1").is_empty());
    }

    #[tokio::test]
    async fn test_execute_writes_directive() {
        let manager = manager();
        let io = Arc::new(FakeIo::default());
        manager.insert_local(instance("k1", "u1", io.clone()));

        let request = ExecuteRequest::new("1+1");
        manager.execute("k1", request.clone()).await.unwrap();

        assert_eq!(*io.sent.lock().unwrap(), vec![Directive::Execute(request)]);
    }

    #[tokio::test]
    async fn test_write_failure_marks_dead() {
        let manager = manager();
        let io = Arc::new(FakeIo {
            fail_writes: true,
            ..Default::default()
        });
        manager.insert_local(instance("k1", "u1", io));

        let result = manager.execute("k1", ExecuteRequest::new("1")).await;
        assert!(matches!(result, Err(Error::Write { .. })));
        assert_eq!(manager.status("k1").unwrap(), KernelStatus::Dead);

        // Further calls are rejected without touching the process.
        assert!(matches!(
            manager.execute("k1", ExecuteRequest::new("1")).await,
            Err(Error::KernelDead(_))
        ));
    }

    #[tokio::test]
    async fn test_exited_process_rejected_before_state_catches_up() {
        let manager = manager();
        let io = Arc::new(FakeIo::default());
        io.exited.store(true, Ordering::SeqCst);
        manager.insert_local(instance("k1", "u1", io.clone()));

        assert!(matches!(
            manager.execute("k1", ExecuteRequest::new("1")).await,
            Err(Error::KernelDead(_))
        ));
        assert!(io.sent.lock().unwrap().is_empty());
        assert_eq!(manager.status("k1").unwrap(), KernelStatus::Dead);
    }

    #[tokio::test]
    async fn test_stop_graceful() {
        let manager = manager();
        let io = Arc::new(FakeIo {
            obey_shutdown: true,
            ..Default::default()
        });
        manager.insert_local(instance("k1", "u1", io.clone()));

        manager.stop("k1").await.unwrap();

        assert!(!io.killed.load(Ordering::SeqCst));
        assert_eq!(*io.sent.lock().unwrap(), vec![Directive::Shutdown]);
        assert!(matches!(manager.status("k1"), Err(Error::KernelNotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace() {
        let manager = manager();
        let io = Arc::new(FakeIo::default());
        manager.insert_local(instance("k1", "u1", io.clone()));

        manager.stop("k1").await.unwrap();

        assert!(io.killed.load(Ordering::SeqCst));
        assert!(matches!(manager.status("k1"), Err(Error::KernelNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_for_owner_filters() {
        let manager = manager();
        manager.insert_local(instance("a", "u1", Arc::new(FakeIo::default())));
        manager.insert_local(instance("b", "u2", Arc::new(FakeIo::default())));
        manager.insert_local(instance("c", "u1", Arc::new(FakeIo::default())));

        let mut ids: Vec<_> = manager
            .list_for_owner("u1")
            .into_iter()
            .map(|info| info.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_subscribe_routes_to_kernel_fanout() {
        let manager = manager();
        let kernel = instance("k1", "u1", Arc::new(FakeIo::default()));
        let fanout = kernel.fanout.clone();
        let state = kernel.state.clone();
        manager.insert_local(kernel);

        let (tx, mut rx) = sink(4);
        manager.subscribe("k1", "s1", tx).await;
        fanout.broadcast(&state, &KernelMessage::status(None, ExecutionState::Busy));
        assert!(rx.try_recv().is_ok());
        assert_eq!(manager.status("k1").unwrap(), KernelStatus::Busy);

        manager.unsubscribe("k1", "s1");
        manager.unsubscribe("k1", "s1");
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_gateway_delegation() {
        let client = Arc::new(FakeGateway::reachable());
        let manager = KernelManager::with_gateway_client(
            KernelConfig::default(),
            SpecCatalog::new(Vec::new(), None, Duration::from_secs(1)),
            client.clone(),
            Duration::from_millis(100),
        )
        .await;
        assert!(manager.gateway_active());

        let info = manager.start("python3", "u1").await.unwrap();
        assert!(info.remote);
        assert_eq!(manager.status(&info.id).unwrap(), KernelStatus::Idle);

        manager.execute(&info.id, ExecuteRequest::new("1+1")).await.unwrap();
        manager.interrupt(&info.id).await.unwrap();

        // Nothing was registered locally.
        assert!(manager.kernels.is_empty());
        assert_eq!(manager.list_for_owner("u1").len(), 1);

        manager.stop(&info.id).await.unwrap();
        assert!(matches!(manager.status(&info.id), Err(Error::KernelNotFound(_))));

        let calls = client.calls();
        assert_eq!(
            calls,
            vec![
                "start python3".to_string(),
                format!("execute {} 1+1", info.id),
                format!("interrupt {}", info.id),
                format!("shutdown {}", info.id),
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_gateway_stays_local() {
        let manager = KernelManager::with_gateway_client(
            KernelConfig::default(),
            SpecCatalog::new(Vec::new(), None, Duration::from_secs(1)),
            Arc::new(FakeGateway::default()),
            Duration::from_millis(100),
        )
        .await;
        assert!(!manager.gateway_active());
        assert!(matches!(
            manager.start("python3", "u1").await,
            Err(Error::SpecNotFound(_))
        ));
    }
}
