use crate::agent::Agent;
use crate::error::AgentResult;
use crate::orchestrator::Orchestrator;
use agent_types::{
    ExtractConfigsResponse, LabStatusResponse, NodeReconcileRequest, NodeReconcileResponse, Provider as ProviderKind,
    UpdateConfigRequest, UpdateConfigResponse,
};
use axum::{
    extract::{Path, Query},
    routing::{post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/labs/:lab_id/status", axum::routing::get(status))
        .route("/labs/:lab_id/nodes/reconcile", post(reconcile))
        .route("/labs/:lab_id/extract-configs", post(extract_configs))
        .route("/labs/:lab_id/nodes/:node_name/config", put(update_config))
}

#[derive(Debug, Deserialize)]
struct ProviderQuery {
    #[serde(default)]
    provider: Option<ProviderKind>,
}

async fn status(Extension(agent): Extension<Arc<Agent>>, Path(lab_id): Path<String>) -> AgentResult<Json<LabStatusResponse>> {
    let response = Orchestrator::new(agent).lab_status(&lab_id).await?;
    Ok(Json(response))
}

async fn reconcile(
    Extension(agent): Extension<Arc<Agent>>,
    Path(lab_id): Path<String>,
    Query(q): Query<ProviderQuery>,
    Json(request): Json<NodeReconcileRequest>,
) -> AgentResult<Json<NodeReconcileResponse>> {
    let provider = q.provider.unwrap_or_default();
    *agent.last_controller_reconcile.lock().await = Some(std::time::Instant::now());
    let response = Orchestrator::new(agent).reconcile_nodes(&lab_id, provider, request).await?;
    Ok(Json(response))
}

async fn extract_configs(
    Extension(agent): Extension<Arc<Agent>>,
    Path(lab_id): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> AgentResult<Json<ExtractConfigsResponse>> {
    let provider = q.provider.unwrap_or_default();
    let response = Orchestrator::new(agent).extract_configs(&lab_id, provider).await?;
    Ok(Json(response))
}

async fn update_config(
    Extension(agent): Extension<Arc<Agent>>,
    Path((lab_id, node_name)): Path<(String, String)>,
    Json(request): Json<UpdateConfigRequest>,
) -> Json<UpdateConfigResponse> {
    match Orchestrator::new(agent).update_node_config(&lab_id, &node_name, &request.content).await {
        Ok(()) => Json(UpdateConfigResponse { success: true, error: None }),
        Err(e) => Json(UpdateConfigResponse { success: false, error: Some(e.to_string()) }),
    }
}
