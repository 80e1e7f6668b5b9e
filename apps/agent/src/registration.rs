use crate::agent::Agent;
use agent_types::{
    AgentCapabilities, AgentInfo, AgentStatus, HeartbeatRequest, Provider as ProviderKind,
    RegistrationRequest, RegistrationResponse, ResourceUsage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tracks registration state that can change at runtime: the controller may
/// hand back a different id than the one we started with (re-registering an
/// agent that already exists there), and a lost heartbeat flips us back to
/// unregistered so the next tick retries registration instead of heartbeats.
pub struct RegistrationState {
    registered: AtomicBool,
    effective_agent_id: RwLock<String>,
}

impl RegistrationState {
    pub fn new(agent_id: &str) -> Self {
        Self {
            registered: AtomicBool::new(false),
            effective_agent_id: RwLock::new(agent_id.to_string()),
        }
    }

    pub async fn agent_id(&self) -> String {
        self.effective_agent_id.read().await.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }
}

fn capabilities(agent: &Agent) -> AgentCapabilities {
    let mut providers = Vec::new();
    if agent.container_provider.is_some() {
        providers.push(ProviderKind::Docker);
    }
    if agent.vm_provider.is_some() {
        providers.push(ProviderKind::Vm);
    }
    let mut features = vec!["links".to_string(), "overlay".to_string()];
    if agent.config.enable_ovs_plugin {
        features.push("ovs-plugin".to_string());
    }
    AgentCapabilities {
        providers,
        max_concurrent_jobs: agent.config.max_concurrent_jobs,
        features,
    }
}

fn advertise_address(agent: &Agent) -> String {
    let host = agent
        .config
        .advertise_host
        .clone()
        .or_else(|| agent.config.data_plane_ip.clone())
        .unwrap_or_else(|| agent.config.agent_name.clone());
    let port = agent
        .config
        .bind_addr
        .rsplit(':')
        .next()
        .unwrap_or("9090")
        .to_string();
    format!("{host}:{port}")
}

async fn build_agent_info(agent: &Agent, agent_id: &str) -> AgentInfo {
    AgentInfo {
        agent_id: agent_id.to_string(),
        name: agent.config.agent_name.clone(),
        address: advertise_address(agent),
        capabilities: capabilities(agent),
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: option_env!("VERGEN_GIT_SHA").unwrap_or("unknown").to_string(),
        started_at: Some(agent.started_at),
        is_local: agent.config.is_local,
        deployment_mode: crate::features::admin::detect_deployment_mode(),
        data_plane_ip: agent.config.data_plane_ip.clone(),
    }
}

/// Registers this agent with the controller, if one is configured. Returns
/// `Ok(false)` (not an error) when no controller URL was set, since running
/// standalone against a locally-driven agent is a supported deployment.
pub async fn register_once(agent: &Agent, state: &RegistrationState) -> anyhow::Result<bool> {
    let Some(base) = &agent.config.controller_base_url else {
        return Ok(false);
    };

    let current_id = state.agent_id().await;
    let request = RegistrationRequest {
        agent: build_agent_info(agent, &current_id).await,
        token: agent.config.registration_token.clone(),
    };

    let response = agent
        .http
        .post(format!("{base}/agents/register"))
        .timeout(Duration::from_secs(agent.config.registration_timeout_secs))
        .json(&request)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_connect() => {
            warn!(%base, "cannot connect to controller");
            return Ok(false);
        }
        Err(e) => {
            warn!(error = %e, "registration request failed");
            return Ok(false);
        }
    };

    if !response.status().is_success() {
        warn!(status = %response.status(), "registration rejected by controller");
        return Ok(false);
    }

    let body: RegistrationResponse = response.json().await?;
    if !body.success {
        warn!(message = %body.message, "registration rejected");
        return Ok(false);
    }

    if let Some(assigned) = body.assigned_id {
        if assigned != current_id {
            info!(assigned_id = %assigned, "controller assigned existing agent id");
            *state.effective_agent_id.write().await = assigned;
        }
    }
    state.registered.store(true, Ordering::Relaxed);
    info!(agent_id = %state.agent_id().await, "registered with controller");
    Ok(true)
}

async fn gather_resource_usage(agent: &Agent) -> ResourceUsage {
    let running_containers = match &agent.container_provider {
        Some(p) => p.list_archetype_containers().await.map(|l| l.len() as u32).unwrap_or(0),
        None => 0,
    };

    tokio::task::spawn_blocking(move || {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_percent = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>()
            / sys.cpus().len().max(1) as f32;

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let (disk_used, disk_total) = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .map(|d| {
                let total = d.total_space();
                let available = d.available_space();
                (total.saturating_sub(available), total)
            })
            .unwrap_or((0, 0));

        ResourceUsage {
            cpu_percent,
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
            disk_used_bytes: disk_used,
            disk_total_bytes: disk_total,
            running_containers,
        }
    })
    .await
    .unwrap_or_default()
}

async fn send_heartbeat(agent: &Agent, state: &RegistrationState) -> anyhow::Result<bool> {
    let Some(base) = &agent.config.controller_base_url else {
        return Ok(true);
    };
    let agent_id = state.agent_id().await;
    let active_jobs = agent.locks.get_all_locks().await.map(|l| l.len() as u32).unwrap_or(0);

    let request = HeartbeatRequest {
        agent_id: agent_id.clone(),
        status: AgentStatus::Online,
        active_jobs,
        resource_usage: gather_resource_usage(agent).await,
    };

    let response = agent
        .http
        .post(format!("{base}/agents/{agent_id}/heartbeat"))
        .timeout(Duration::from_secs(agent.config.registration_timeout_secs))
        .json(&request)
        .send()
        .await;

    match response {
        Ok(r) if r.status().is_success() => Ok(true),
        Ok(r) => {
            warn!(status = %r.status(), "heartbeat rejected");
            Ok(false)
        }
        Err(e) => {
            warn!(error = %e, "heartbeat failed");
            Ok(false)
        }
    }
}

/// Background loop: registers once at startup (best-effort, never blocks
/// server readiness) and then alternates between heartbeats and
/// re-registration attempts for as long as the process runs.
pub fn spawn(agent: Arc<Agent>, state: Arc<RegistrationState>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if agent.config.controller_base_url.is_none() {
            debug!("no controller configured, registration loop idle");
            return;
        }

        if let Err(e) = register_once(&agent, &state).await {
            warn!(error = %e, "initial registration failed");
        }

        let mut ticker = interval(Duration::from_secs(agent.config.heartbeat_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !state.is_registered() {
                if let Err(e) = register_once(&agent, &state).await {
                    warn!(error = %e, "re-registration attempt failed");
                }
                continue;
            }

            match send_heartbeat(&agent, &state).await {
                Ok(true) => {}
                Ok(false) => {
                    state.registered.store(false, Ordering::Relaxed);
                    warn!("lost connection to controller, will retry registration");
                }
                Err(e) => warn!(error = %e, "heartbeat loop iteration errored"),
            }
        }
        debug!("registration loop stopped");
    })
}
