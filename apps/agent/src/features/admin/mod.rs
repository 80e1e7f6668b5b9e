use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};
use agent_types::{
    CleanupLabOrphansRequest, CleanupLabOrphansResponse, CleanupOrphansRequest, CleanupOrphansResponse,
    DockerPruneRequest, DockerPruneResponse, UpdateProgressCallback, UpdateRequest, UpdateResponse,
};
use axum::{routing::{get, post}, Extension, Json, Router};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/admin/cleanup-orphans", post(cleanup_orphans))
        .route("/admin/cleanup-lab-orphans", post(cleanup_lab_orphans))
        .route("/admin/prune-docker", post(prune_docker))
        .route("/admin/update", post(update))
        .route("/deployment-mode", get(deployment_mode))
}

async fn cleanup_orphans(
    Extension(agent): Extension<Arc<Agent>>,
    Json(req): Json<CleanupOrphansRequest>,
) -> AgentResult<Json<CleanupOrphansResponse>> {
    let Some(provider) = &agent.container_provider else {
        return Ok(Json(CleanupOrphansResponse::default()));
    };
    let containers = provider.list_archetype_containers().await.map_err(AgentError::from)?;
    let mut removed = Vec::new();
    let mut errors = Vec::new();
    for container in containers {
        if req.valid_lab_ids.iter().any(|lab_id| lab_id == &container.lab_id) {
            continue;
        }
        match provider.remove_by_name(&container.name).await {
            Ok(()) => removed.push(container.name),
            Err(e) => errors.push(format!("{}: {e}", container.name)),
        }
    }
    Ok(Json(CleanupOrphansResponse { removed_containers: removed, errors }))
}

async fn cleanup_lab_orphans(
    Extension(agent): Extension<Arc<Agent>>,
    Json(req): Json<CleanupLabOrphansRequest>,
) -> AgentResult<Json<CleanupLabOrphansResponse>> {
    let Some(provider) = &agent.container_provider else {
        return Ok(Json(CleanupLabOrphansResponse::default()));
    };
    let containers = provider.list_archetype_containers().await.map_err(AgentError::from)?;
    let mut removed = Vec::new();
    let mut kept = Vec::new();
    let mut errors = Vec::new();
    for container in containers {
        if container.lab_id != req.lab_id {
            continue;
        }
        if req.keep_node_names.iter().any(|n| n == &container.node_name) {
            kept.push(container.name);
            continue;
        }
        match provider.remove_by_name(&container.name).await {
            Ok(()) => removed.push(container.name),
            Err(e) => errors.push(format!("{}: {e}", container.name)),
        }
    }
    Ok(Json(CleanupLabOrphansResponse { removed_containers: removed, kept_containers: kept, errors }))
}

/// Image and build-cache pruning delegates to the Docker daemon's own
/// prune APIs rather than walking image layers by hand; volumes, stopped
/// containers and unused networks are only touched if the caller opts in,
/// since they can outlive the lab that created them.
async fn prune_docker(
    Extension(agent): Extension<Arc<Agent>>,
    Json(req): Json<DockerPruneRequest>,
) -> Json<DockerPruneResponse> {
    let Some(provider) = &agent.container_provider else {
        return Json(DockerPruneResponse { success: false, errors: vec!["container provider is not enabled on this agent".to_string()], ..Default::default() });
    };
    Json(provider.prune(&req).await)
}

/// A compiled binary can't `git pull` or `pip install` its way to a new
/// version, so unlike the interpreted original this always reports the
/// update as requiring external orchestration (replace the binary,
/// restart the unit or container) and notifies the controller of that
/// verdict over the callback rather than pretending to self-update.
async fn update(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<UpdateRequest>) -> Json<UpdateResponse> {
    let mode = detect_deployment_mode();
    let agent_id = agent.config.agent_id.clone();
    let callback_url = req.callback_url.clone();
    let job_id = req.job_id.clone();
    let http = agent.http.clone();
    tokio::spawn(async move {
        let callback = UpdateProgressCallback {
            job_id,
            agent_id,
            status: "unsupported".to_string(),
            progress_percent: 100,
            error_message: Some(format!("agent build does not support self-update in {mode} mode; replace the binary and restart externally")),
        };
        let _ = http.post(&callback_url).json(&callback).send().await;
    });
    Json(UpdateResponse { accepted: false, message: format!("update must be performed externally for deployment mode {mode}"), deployment_mode: mode })
}

async fn deployment_mode(Extension(agent): Extension<Arc<Agent>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "mode": detect_deployment_mode(),
        "version": env!("CARGO_PKG_VERSION"),
        "agent_id": agent.config.agent_id,
    }))
}

pub fn detect_deployment_mode() -> String {
    if std::path::Path::new("/.dockerenv").exists() {
        return "docker".to_string();
    }
    if let Ok(cgroup) = std::fs::read_to_string("/proc/1/cgroup") {
        if cgroup.contains("docker") {
            return "docker".to_string();
        }
    }
    if std::path::Path::new("/run/systemd/system").exists() {
        return "systemd".to_string();
    }
    "unknown".to_string()
}
