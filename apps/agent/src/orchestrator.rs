use crate::agent::Agent;
use crate::core::lock::LockHandle;
use crate::error::{AgentError, AgentResult};
use crate::providers::NodeHandle;
use agent_types::{
    DeployLink, DeployNode, DeployRequest, DeployTopology, DestroyRequest, JobResult, JobStatus,
    LabStatusResponse, NodeInfo, NodeReconcileRequest, NodeReconcileResponse, NodeReconcileResult,
    NodeStatus, Provider as ProviderKind, ReconcileAction,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Drives the deploy/destroy lifecycle for a single lab: acquires the
/// per-lab lock, provisions nodes through the configured provider, wires
/// their links over the shared bridge (or the VXLAN overlay for
/// cross-host peers), and rolls back everything it created if any step
/// fails partway through.
pub struct Orchestrator {
    agent: Arc<Agent>,
}

impl Orchestrator {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    /// Entry point for `POST /jobs/deploy`. Synchronous callers block
    /// until the deploy finishes; callers that supply a `callback_url`
    /// get an `Accepted` result immediately and the real result is
    /// POSTed back when the background task completes.
    pub async fn deploy(&self, request: DeployRequest) -> AgentResult<JobResult> {
        let topology = request
            .topology
            .clone()
            .ok_or_else(|| AgentError::validation("deploy requires a topology"))?;

        if let Some(callback_url) = request.callback_url.clone() {
            let agent = self.agent.clone();
            let job_id = request.job_id.clone();
            let lab_id = request.lab_id.clone();
            let provider = request.provider;
            tokio::spawn(async move {
                let orch = Orchestrator::new(agent.clone());
                let started_at = Utc::now();
                let dispatcher = agent.callbacks.clone();
                let result = crate::callbacks::with_heartbeat(&dispatcher, &callback_url, &job_id, 30, async {
                    orch.run_deploy(&job_id, &lab_id, &topology, provider, started_at).await
                })
                .await;
                dispatcher.deliver(&callback_url, &result).await;
            });
            return Ok(JobResult {
                job_id: request.job_id,
                status: JobStatus::Accepted,
                exit_code: 0,
                stdout: "deploy accepted for async execution".to_string(),
                stderr: String::new(),
                error_message: None,
                started_at: Utc::now(),
                completed_at: Utc::now(),
            });
        }

        let started_at = Utc::now();
        Ok(self.run_deploy(&request.job_id, &request.lab_id, &topology, request.provider, started_at).await)
    }

    pub async fn destroy(&self, request: DestroyRequest) -> AgentResult<JobResult> {
        if let Some(callback_url) = request.callback_url.clone() {
            let agent = self.agent.clone();
            let job_id = request.job_id.clone();
            let lab_id = request.lab_id.clone();
            let provider = request.provider;
            tokio::spawn(async move {
                let orch = Orchestrator::new(agent.clone());
                let started_at = Utc::now();
                let dispatcher = agent.callbacks.clone();
                let result = crate::callbacks::with_heartbeat(&dispatcher, &callback_url, &job_id, 30, async {
                    orch.run_destroy(&job_id, &lab_id, provider, started_at).await
                })
                .await;
                dispatcher.deliver(&callback_url, &result).await;
            });
            return Ok(JobResult {
                job_id: request.job_id,
                status: JobStatus::Accepted,
                exit_code: 0,
                stdout: "destroy accepted for async execution".to_string(),
                stderr: String::new(),
                error_message: None,
                started_at: Utc::now(),
                completed_at: Utc::now(),
            });
        }

        let started_at = Utc::now();
        Ok(self.run_destroy(&request.job_id, &request.lab_id, request.provider, started_at).await)
    }

    async fn run_deploy(&self, job_id: &str, lab_id: &str, topology: &DeployTopology, provider_kind: ProviderKind, started_at: chrono::DateTime<Utc>) -> JobResult {
        let lock = match self.acquire_lock(lab_id).await {
            Ok(l) => l,
            Err(e) => return failed(job_id, started_at, e.to_string()),
        };

        let result = self.deploy_locked(lab_id, topology, provider_kind).await;

        if let Err(e) = self.agent.locks.release(&lock).await {
            warn!(lab_id, error = %e, "failed to release deploy lock");
        }

        match result {
            Ok(summary) => JobResult {
                job_id: job_id.to_string(),
                status: JobStatus::Completed,
                exit_code: 0,
                stdout: summary,
                stderr: String::new(),
                error_message: None,
                started_at,
                completed_at: Utc::now(),
            },
            Err(e) => failed(job_id, started_at, e.to_string()),
        }
    }

    async fn run_destroy(&self, job_id: &str, lab_id: &str, provider_kind: ProviderKind, started_at: chrono::DateTime<Utc>) -> JobResult {
        let lock = match self.acquire_lock(lab_id).await {
            Ok(l) => l,
            Err(e) => return failed(job_id, started_at, e.to_string()),
        };

        let result = self.destroy_locked(lab_id, provider_kind).await;

        if let Err(e) = self.agent.locks.release(&lock).await {
            warn!(lab_id, error = %e, "failed to release destroy lock");
        }

        match result {
            Ok(()) => JobResult {
                job_id: job_id.to_string(),
                status: JobStatus::Completed,
                exit_code: 0,
                stdout: format!("lab {lab_id} destroyed"),
                stderr: String::new(),
                error_message: None,
                started_at,
                completed_at: Utc::now(),
            },
            Err(e) => failed(job_id, started_at, e.to_string()),
        }
    }

    async fn acquire_lock(&self, lab_id: &str) -> anyhow::Result<LockHandle> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(self.agent.config.lock_acquire_timeout_secs);
        loop {
            if let Some(handle) = self.agent.locks.acquire_with_heartbeat(lab_id).await? {
                return Ok(handle);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("lab {lab_id} is already being deployed by another job, timed out waiting for its lock");
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    async fn deploy_locked(&self, lab_id: &str, topology: &DeployTopology, provider_kind: ProviderKind) -> anyhow::Result<String> {
        let provider = self.agent.provider_for(provider_kind)?;
        self.agent.workspace.ensure_lab_dir(lab_id).await?;

        let mut created: Vec<(DeployNode, NodeHandle)> = Vec::new();
        let deploy_result = async {
            for node in &topology.nodes {
                info!(lab_id, node = %node.name, "creating node");
                let vlan_tags = if provider_kind == ProviderKind::Vm {
                    self.agent.ovs.alloc_vlan_tags(lab_id, node.interface_count.unwrap_or(1)).await?
                } else {
                    Vec::new()
                };
                let handle = provider.create(lab_id, node, &vlan_tags).await?;
                created.push((node.clone(), handle.clone()));

                if let Some(config) = &node.startup_config {
                    self.agent
                        .workspace
                        .write_node_config(lab_id, &node.name, "startup-config.cfg", config.as_bytes())
                        .await?;
                }
            }

            for (node, handle) in &created {
                provider.start(handle).await?;
                if provider_kind == ProviderKind::Docker {
                    // VM nodes get their VLAN tags baked into the libvirt
                    // domain XML's bridge interfaces at create time instead;
                    // only container nodes need a host veth wired in here.
                    self.wire_node_endpoints(lab_id, node, handle).await?;
                }
            }

            if provider_kind == ProviderKind::Docker {
                for link in &topology.links {
                    self.wire_link(lab_id, link).await?;
                }
            }

            let node_names: Vec<String> = topology.nodes.iter().map(|n| n.name.clone()).collect();
            self.agent.workspace.write_manifest(lab_id, &node_names).await?;

            let kinds: std::collections::HashMap<String, String> =
                topology.nodes.iter().map(|n| (n.name.clone(), n.kind.clone())).collect();
            self.agent.workspace.write_node_kinds(lab_id, &kinds).await?;

            anyhow::Ok(())
        }
        .await;

        if let Err(e) = deploy_result {
            error!(lab_id, error = %e, "deploy failed, rolling back");
            for (_, handle) in created.iter().rev() {
                if let Err(rollback_err) = provider.destroy(handle).await {
                    warn!(lab_id, node = %handle.node_name, error = %rollback_err, "failed to roll back node during deploy failure");
                }
            }
            if let Err(rollback_err) = self.agent.ovs.teardown_lab(lab_id).await {
                warn!(lab_id, error = %rollback_err, "failed to roll back OVS endpoints during deploy failure");
            }
            return Err(e);
        }

        Ok(format!("deployed {} node(s), {} link(s)", topology.nodes.len(), topology.links.len()))
    }

    async fn wire_node_endpoints(&self, lab_id: &str, node: &DeployNode, handle: &NodeHandle) -> anyhow::Result<()> {
        let descriptor = self.agent.vendors.get(&node.kind);
        let count = node.interface_count.unwrap_or(0);
        for idx in 1..=count {
            let iface_name = format!("eth{idx}");
            let kernel_name = descriptor.kernel_ifname(&iface_name, None);
            self.agent
                .ovs
                .attach_endpoint(lab_id, &node.name, &iface_name, &handle.netns, &kernel_name)
                .await?;
        }
        Ok(())
    }

    async fn wire_link(&self, lab_id: &str, link: &DeployLink) -> anyhow::Result<()> {
        let a = self
            .agent
            .ovs
            .attach_endpoint(lab_id, &link.source_node, &link.source_interface, "", "")
            .await;
        // `attach_endpoint` is idempotent: the endpoint was already created
        // by `wire_node_endpoints`, this just fetches the existing record.
        let a = match a {
            Ok(rec) => rec,
            Err(_) => anyhow::bail!("no tracked endpoint for link source {}/{}", link.source_node, link.source_interface),
        };

        if let Some(remote_ip) = &link.remote_host_ip {
            let local_ip = self
                .agent
                .config
                .data_plane_ip
                .clone()
                .ok_or_else(|| anyhow::anyhow!("AGENT_DATA_PLANE_IP must be set to wire cross-host links"))?;
            let link_id = format!("{lab_id}:{}:{}:{}:{}", link.source_node, link.source_interface, link.target_node, link.target_interface);
            let vni = link
                .vni
                .ok_or_else(|| anyhow::anyhow!("cross-host link {} has no assigned VNI", link_id))?;
            self.agent.overlay.attach_link(&link_id, a.vlan_tag, vni, remote_ip, &local_ip).await?;
            self.agent.workspace.add_overlay_link(lab_id, &link_id).await?;
            return Ok(());
        }

        let b = self
            .agent
            .ovs
            .attach_endpoint(lab_id, &link.target_node, &link.target_interface, "", "")
            .await
            .map_err(|_| anyhow::anyhow!("no tracked endpoint for link target {}/{}", link.target_node, link.target_interface))?;
        self.agent.ovs.hot_connect(&a, &b).await?;
        Ok(())
    }

    async fn lab_node_names(&self, lab_id: &str) -> anyhow::Result<Vec<String>> {
        let mut names = self.agent.workspace.read_manifest(lab_id).await?;
        let ovs_status = self.agent.ovs.status().await?;
        for port in ovs_status.ports.iter().filter(|p| p.lab_id == lab_id) {
            if !names.contains(&port.node_name) {
                names.push(port.node_name.clone());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn destroy_locked(&self, lab_id: &str, provider_kind: ProviderKind) -> anyhow::Result<()> {
        let provider = self.agent.provider_for(provider_kind)?;
        for name in self.lab_node_names(lab_id).await? {
            let handle = NodeHandle {
                lab_id: lab_id.to_string(),
                node_name: name.clone(),
                runtime_id: crate::providers::node_runtime_name(lab_id, &name),
                netns: String::new(),
                pid: None,
            };
            if let Err(e) = provider.destroy(&handle).await {
                warn!(lab_id, node = %name, error = %e, "failed to destroy node during lab teardown");
            }
        }
        self.agent.ovs.teardown_lab(lab_id).await?;
        self.agent.workspace.remove_lab_dir(lab_id).await?;
        Ok(())
    }

    /// Queries every enabled provider for each node in the lab and keeps
    /// the first non-`Unknown` answer, so a lab mixing container and VM
    /// nodes gets a complete merged status without the caller having to
    /// know which provider backs which node.
    pub async fn lab_status(&self, lab_id: &str) -> AgentResult<LabStatusResponse> {
        let node_names = self.lab_node_names(lab_id).await.map_err(AgentError::from)?;
        let providers = self.agent.available_providers();

        let mut nodes = Vec::with_capacity(node_names.len());
        for name in node_names {
            let runtime_id = crate::providers::node_runtime_name(lab_id, &name);
            let handle = NodeHandle {
                lab_id: lab_id.to_string(),
                node_name: name.clone(),
                runtime_id,
                netns: String::new(),
                pid: None,
            };
            let mut status = NodeStatus::Unknown;
            for provider in &providers {
                if let Ok(s) = provider.status(&handle).await {
                    if s != NodeStatus::Unknown {
                        status = s;
                        break;
                    }
                }
            }
            nodes.push(NodeInfo {
                name,
                status,
                container_id: None,
                image: None,
                ip_addresses: Vec::new(),
                error: None,
            });
        }

        Ok(LabStatusResponse { lab_id: lab_id.to_string(), nodes, error: None })
    }

    pub async fn reconcile_nodes(&self, lab_id: &str, provider_kind: ProviderKind, request: NodeReconcileRequest) -> AgentResult<NodeReconcileResponse> {
        let provider = self.agent.provider_for(provider_kind)?;
        let mut results = Vec::with_capacity(request.nodes.len());
        for target in request.nodes {
            let handle = NodeHandle {
                lab_id: lab_id.to_string(),
                node_name: target.container_name.clone(),
                runtime_id: target.container_name.clone(),
                netns: String::new(),
                pid: None,
            };
            let outcome = self.reconcile_one(&provider, &handle, target.desired_state).await;
            let (action, success, error) = match outcome {
                Ok(action) => (action, true, None),
                Err(e) => (ReconcileAction::Error, false, Some(e.to_string())),
            };
            results.push(NodeReconcileResult { container_name: target.container_name, action, success, error });
        }
        Ok(NodeReconcileResponse { lab_id: lab_id.to_string(), results, error: None })
    }

    /// Runs each node's vendor-specific config-dump command and stashes
    /// the output in the workspace as its new startup config, so a
    /// subsequent redeploy of the same lab starts from the running state
    /// rather than the original declared topology.
    pub async fn extract_configs(&self, lab_id: &str, provider_kind: ProviderKind) -> AgentResult<agent_types::ExtractConfigsResponse> {
        let provider = self.agent.provider_for(provider_kind)?;
        let kinds = self.agent.workspace.read_node_kinds(lab_id).await.map_err(AgentError::from)?;
        let node_names = self.lab_node_names(lab_id).await.map_err(AgentError::from)?;

        let mut configs = Vec::new();
        for name in node_names {
            let kind = kinds.get(&name).cloned().unwrap_or_else(|| "linux".to_string());
            let descriptor = self.agent.vendors.get(&kind);
            let Some(cmd) = descriptor.config_extract_command.clone() else {
                continue;
            };
            let runtime_id = crate::providers::node_runtime_name(lab_id, &name);
            let handle = NodeHandle { lab_id: lab_id.to_string(), node_name: name.clone(), runtime_id, netns: String::new(), pid: None };
            match provider.exec(&handle, &["sh".to_string(), "-c".to_string(), cmd]).await {
                Ok(content) => {
                    if let Err(e) = self.agent.workspace.write_node_config(lab_id, &name, "startup-config.cfg", content.as_bytes()).await {
                        warn!(lab_id, node = %name, error = %e, "failed to persist extracted config");
                    }
                    configs.push(agent_types::ExtractedConfig { node_name: name, content });
                }
                Err(e) => warn!(lab_id, node = %name, error = %e, "failed to extract config from node"),
            }
        }

        Ok(agent_types::ExtractConfigsResponse { success: true, extracted_count: configs.len() as u32, configs, error: None })
    }

    pub async fn update_node_config(&self, lab_id: &str, node_name: &str, content: &str) -> AgentResult<()> {
        self.agent
            .workspace
            .write_node_config(lab_id, node_name, "startup-config", content.as_bytes())
            .await
            .map_err(AgentError::from)
    }

    /// Hot-connects two already-wired interfaces into a new link, for labs
    /// where the topology wasn't known to be linked at deploy time.
    pub async fn create_link(&self, lab_id: &str, req: agent_types::LinkCreate) -> AgentResult<agent_types::LinkInfo> {
        let a = self
            .agent
            .ovs
            .attach_endpoint(lab_id, &req.source_node, &req.source_interface, "", "")
            .await
            .map_err(|_| AgentError::not_found(format!("no tracked endpoint for {}/{}", req.source_node, req.source_interface)))?;
        let b = self
            .agent
            .ovs
            .attach_endpoint(lab_id, &req.target_node, &req.target_interface, "", "")
            .await
            .map_err(|_| AgentError::not_found(format!("no tracked endpoint for {}/{}", req.target_node, req.target_interface)))?;
        let vlan_tag = self.agent.ovs.hot_connect(&a, &b).await.map_err(AgentError::from)?;

        let link_id = agent_types::LinkInfo::canonical_id(&req.source_node, &req.source_interface, &req.target_node, &req.target_interface);
        let link = agent_types::LinkInfo {
            link_id: link_id.clone(),
            lab_id: lab_id.to_string(),
            source_node: req.source_node,
            source_interface: req.source_interface,
            target_node: req.target_node,
            target_interface: req.target_interface,
            state: agent_types::LinkState::Connected,
            vlan_tag: Some(vlan_tag),
            error: None,
        };
        let mut links = self.agent.workspace.read_links(lab_id).await.map_err(AgentError::from)?;
        links.insert(link_id, link.clone());
        self.agent.workspace.write_links(lab_id, &links).await.map_err(AgentError::from)?;
        Ok(link)
    }

    pub async fn delete_link(&self, lab_id: &str, link_id: &str) -> AgentResult<()> {
        let mut links = self.agent.workspace.read_links(lab_id).await.map_err(AgentError::from)?;
        let Some(link) = links.remove(link_id) else {
            return Err(AgentError::not_found(format!("no link {link_id} in lab {lab_id}")));
        };
        let a = self.agent.ovs.attach_endpoint(lab_id, &link.source_node, &link.source_interface, "", "").await.map_err(AgentError::from)?;
        let b = self.agent.ovs.attach_endpoint(lab_id, &link.target_node, &link.target_interface, "", "").await.map_err(AgentError::from)?;
        self.agent.ovs.hot_disconnect(&a, &b).await.map_err(AgentError::from)?;
        self.agent.workspace.write_links(lab_id, &links).await.map_err(AgentError::from)?;
        Ok(())
    }

    pub async fn list_links(&self, lab_id: &str) -> AgentResult<Vec<agent_types::LinkInfo>> {
        let links = self.agent.workspace.read_links(lab_id).await.map_err(AgentError::from)?;
        Ok(links.into_values().collect())
    }

    async fn reconcile_one(&self, provider: &Arc<dyn crate::providers::Provider>, handle: &NodeHandle, desired: agent_types::DesiredState) -> anyhow::Result<ReconcileAction> {
        let current = provider.status(handle).await.unwrap_or(NodeStatus::Unknown);
        use agent_types::DesiredState::*;
        match (desired, current) {
            (Running, NodeStatus::Running) => Ok(ReconcileAction::AlreadyRunning),
            (Running, _) => {
                provider.start(handle).await?;
                Ok(ReconcileAction::Started)
            }
            (Stopped, NodeStatus::Stopped) => Ok(ReconcileAction::AlreadyStopped),
            (Stopped, _) => {
                provider.stop(handle, 10).await?;
                Ok(ReconcileAction::Stopped)
            }
        }
    }
}

fn failed(job_id: &str, started_at: chrono::DateTime<Utc>, error_message: String) -> JobResult {
    JobResult {
        job_id: job_id.to_string(),
        status: JobStatus::Failed,
        exit_code: 1,
        stdout: String::new(),
        stderr: String::new(),
        error_message: Some(error_message),
        started_at,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use agent_types::{DeployNode, DeployTopology};

    async fn test_agent() -> Arc<Agent> {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            agent_id: "test-agent".to_string(),
            agent_name: "test-agent".to_string(),
            workspace_root: tmp.path().to_path_buf(),
            shared_bridge: "archbr0".to_string(),
            vlan_base: 100,
            vlan_max: 4000,
            vni_base: 10_000,
            vni_max: 16_000_000,
            redis_url: None,
            controller_base_url: None,
            data_plane_ip: Some("10.0.0.1".to_string()),
            max_concurrent_jobs: 4,
            enable_container_provider: false,
            enable_vm_provider: true,
            enable_ovs_plugin: false,
            heartbeat_interval_secs: 15,
            reconcile_interval_secs: 300,
            reconcile_vxlan_orphan_window_secs: 900,
            lock_acquire_timeout_secs: 5,
            lock_ttl_secs: 30,
            test_mode: true,
        };
        Agent::bootstrap(config).await.unwrap()
    }

    #[tokio::test]
    async fn deploy_and_destroy_vm_lab_round_trips() {
        let agent = test_agent().await;
        let orch = Orchestrator::new(agent);

        let topology = DeployTopology {
            nodes: vec![
                DeployNode {
                    name: "r1".to_string(),
                    interface_count: Some(1),
                    image: Some("vm-base".to_string()),
                    machine_type: Some("pc-q35-6.2".to_string()),
                    ..Default::default()
                },
                DeployNode {
                    name: "r2".to_string(),
                    interface_count: Some(1),
                    image: Some("vm-base".to_string()),
                    machine_type: Some("pc-q35-6.2".to_string()),
                    ..Default::default()
                },
            ],
            links: vec![DeployLink {
                source_node: "r1".to_string(),
                source_interface: "eth1".to_string(),
                target_node: "r2".to_string(),
                target_interface: "eth1".to_string(),
                remote_host_ip: None,
                vni: None,
            }],
        };

        let request = DeployRequest {
            job_id: "job-1".to_string(),
            lab_id: "lab-1".to_string(),
            topology: Some(topology),
            provider: ProviderKind::Vm,
            callback_url: None,
        };
        let result = orch.deploy(request).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed, "{:?}", result.error_message);

        let destroy_result = orch
            .destroy(DestroyRequest {
                job_id: "job-2".to_string(),
                lab_id: "lab-1".to_string(),
                provider: ProviderKind::Vm,
                callback_url: None,
            })
            .await
            .unwrap();
        assert_eq!(destroy_result.status, JobStatus::Completed, "{:?}", destroy_result.error_message);
    }

    #[tokio::test]
    async fn deploy_without_topology_is_rejected() {
        let agent = test_agent().await;
        let orch = Orchestrator::new(agent);
        let request = DeployRequest {
            job_id: "job-1".to_string(),
            lab_id: "lab-1".to_string(),
            topology: None,
            provider: ProviderKind::Vm,
            callback_url: None,
        };
        let err = orch.deploy(request).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }
}
