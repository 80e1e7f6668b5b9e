use crate::callbacks::CallbackDispatcher;
use crate::config::AgentConfig;
use crate::core::{LockManager, OvsEngine, OverlayEngine};
use crate::core::workspace::WorkspaceManager;
use crate::providers::{ContainerProvider, Provider, VmProvider};
use crate::vendor::VendorRegistry;
use agent_types::Provider as ProviderKind;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The agent's root object: every long-lived component, owned here rather
/// than reached for through module-level statics. Cloned cheaply (an
/// `Arc<Agent>`) into every axum handler and background task.
pub struct Agent {
    pub config: AgentConfig,
    pub vendors: VendorRegistry,
    pub ovs: Arc<OvsEngine>,
    pub overlay: Arc<OverlayEngine>,
    pub locks: LockManager,
    pub workspace: WorkspaceManager,
    pub container_provider: Option<Arc<ContainerProvider>>,
    pub vm_provider: Option<Arc<VmProvider>>,
    pub http: reqwest::Client,
    pub callbacks: CallbackDispatcher,
    pub image_jobs: tokio::sync::Mutex<std::collections::HashMap<String, agent_types::ImagePullProgress>>,
    /// Pending console sessions keyed by a one-time session id: the
    /// interactive exec itself isn't created until the websocket upgrade
    /// arrives, so this just remembers which container/shell it's for.
    pub console_sessions: tokio::sync::Mutex<std::collections::HashMap<String, (String, String)>>,
    pub started_at: DateTime<Utc>,
    /// Last time the controller drove a reconcile through
    /// `/labs/:lab_id/nodes/reconcile`. The background reconciler's VXLAN
    /// orphan sweep backs off for a window after this so the two cleanup
    /// paths don't fight each other over the same tunnel.
    pub last_controller_reconcile: tokio::sync::Mutex<Option<std::time::Instant>>,
}

impl Agent {
    pub async fn bootstrap(config: AgentConfig) -> anyhow::Result<Arc<Self>> {
        let ovs = OvsEngine::new(&config.shared_bridge, config.vlan_base, config.vlan_max, config.test_mode);
        ovs.ensure_bridge().await?;
        ovs.recover().await?;

        let overlay = OverlayEngine::new(&config.shared_bridge, config.vni_base, config.vni_max, config.test_mode, false);
        overlay.recover().await?;

        let locks = LockManager::connect(
            config.redis_url.as_deref(),
            &config.agent_id,
            config.lock_ttl_secs,
            config.lock_extend_interval_secs(),
        )
        .await?;

        let workspace = WorkspaceManager::new(config.workspace_root.clone());

        let container_provider = if config.enable_container_provider {
            match ContainerProvider::connect() {
                Ok(p) => Some(Arc::new(p)),
                Err(e) => {
                    tracing::warn!(error = %e, "container provider unavailable, Docker deploys will fail");
                    None
                }
            }
        } else {
            None
        };

        let vm_provider = if config.enable_vm_provider {
            Some(Arc::new(VmProvider::new(config.test_mode)))
        } else {
            None
        };

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        let callbacks = CallbackDispatcher::new(http.clone());

        Ok(Arc::new(Self {
            config,
            vendors: VendorRegistry::bundled(),
            ovs,
            overlay,
            locks,
            workspace,
            container_provider,
            vm_provider,
            http,
            callbacks,
            image_jobs: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            console_sessions: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            started_at: Utc::now(),
            last_controller_reconcile: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn provider_for(&self, kind: ProviderKind) -> anyhow::Result<Arc<dyn Provider>> {
        match kind {
            ProviderKind::Docker => self
                .container_provider
                .clone()
                .map(|p| p as Arc<dyn Provider>)
                .ok_or_else(|| anyhow::anyhow!("container provider is not enabled on this agent")),
            ProviderKind::Vm => self
                .vm_provider
                .clone()
                .map(|p| p as Arc<dyn Provider>)
                .ok_or_else(|| anyhow::anyhow!("VM provider is not enabled on this agent")),
        }
    }

    /// Every provider this agent has enabled, used by status/reconcile
    /// paths that must merge results across a lab mixing containers and
    /// VMs rather than assuming a single provider kind.
    pub fn available_providers(&self) -> Vec<Arc<dyn Provider>> {
        let mut out: Vec<Arc<dyn Provider>> = Vec::new();
        if let Some(p) = &self.container_provider {
            out.push(p.clone() as Arc<dyn Provider>);
        }
        if let Some(p) = &self.vm_provider {
            out.push(p.clone() as Arc<dyn Provider>);
        }
        out
    }
}
