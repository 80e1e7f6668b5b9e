use crate::agent::Agent;
use agent_types::{
    BridgeDeletePatchRequest, BridgeDeletePatchResponse, BridgePatchRequest, BridgePatchResponse,
    ExternalConnectRequest, ExternalConnectResponse, ExternalDisconnectRequest, ExternalDisconnectResponse,
    ExternalListResponse,
};
use axum::{
    extract::Path,
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/labs/:lab_id/external/connect", post(connect))
        .route("/labs/:lab_id/external/disconnect", post(disconnect))
        .route("/labs/:lab_id/external", get(list))
        .route("/ovs/patch", post(patch).delete(delete_patch))
}

async fn connect(
    Extension(agent): Extension<Arc<Agent>>,
    Path(lab_id): Path<String>,
    Json(req): Json<ExternalConnectRequest>,
) -> Json<ExternalConnectResponse> {
    match agent.ovs.external_attach(&lab_id, &req.external_interface, req.vlan_tag).await {
        Ok(_port) => Json(ExternalConnectResponse { success: true, vlan_tag: req.vlan_tag, error: None }),
        Err(e) => Json(ExternalConnectResponse { success: false, vlan_tag: None, error: Some(e.to_string()) }),
    }
}

async fn disconnect(
    Extension(agent): Extension<Arc<Agent>>,
    Path(_lab_id): Path<String>,
    Json(req): Json<ExternalDisconnectRequest>,
) -> Json<ExternalDisconnectResponse> {
    match agent.ovs.external_detach(&req.external_interface).await {
        Ok(()) => Json(ExternalDisconnectResponse { success: true, error: None }),
        Err(e) => Json(ExternalDisconnectResponse { success: false, error: Some(e.to_string()) }),
    }
}

async fn list(Extension(agent): Extension<Arc<Agent>>, Path(lab_id): Path<String>) -> Json<ExternalListResponse> {
    let connections = agent
        .ovs
        .list_external_connections()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|c| c.lab_id.as_deref() == Some(lab_id.as_str()))
        .collect();
    Json(ExternalListResponse { connections })
}

async fn patch(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<BridgePatchRequest>) -> Json<BridgePatchResponse> {
    match agent.ovs.patch_to_bridge(&req.target_bridge).await {
        Ok((p1, _p2)) => Json(BridgePatchResponse { success: true, patch_port: Some(p1), error: None }),
        Err(e) => Json(BridgePatchResponse { success: false, patch_port: None, error: Some(e.to_string()) }),
    }
}

async fn delete_patch(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<BridgeDeletePatchRequest>) -> Json<BridgeDeletePatchResponse> {
    match agent.ovs.delete_patch_to_bridge(&req.target_bridge).await {
        Ok(()) => Json(BridgeDeletePatchResponse { success: true, error: None }),
        Err(e) => Json(BridgeDeletePatchResponse { success: false, error: Some(e.to_string()) }),
    }
}
