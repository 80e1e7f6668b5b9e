use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};
use crate::orchestrator::Orchestrator;
use agent_types::{
    CarrierState, CarrierStateRequest, CarrierStateResponse, LinkCreate, LinkCreateResponse, LinkDeleteResponse,
    LinkInfo, LinkListResponse, OvsStatusResponse, PortIsolateResponse, PortRestoreRequest, PortRestoreResponse,
    PortVlanResponse,
};
use axum::{
    extract::Path,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/labs/:lab_id/links", post(create_link).get(list_links))
        .route("/labs/:lab_id/links/:link_id", delete(delete_link))
        .route("/labs/:lab_id/interfaces/:node/:interface/carrier", post(set_carrier))
        .route("/labs/:lab_id/interfaces/:node/:interface/isolate", post(isolate))
        .route("/labs/:lab_id/interfaces/:node/:interface/restore", post(restore))
        .route("/labs/:lab_id/interfaces/:node/:interface/vlan", get(vlan))
        .route("/ovs/status", get(ovs_status))
}

async fn create_link(
    Extension(agent): Extension<Arc<Agent>>,
    Path(lab_id): Path<String>,
    Json(req): Json<LinkCreate>,
) -> Json<LinkCreateResponse> {
    match Orchestrator::new(agent).create_link(&lab_id, req).await {
        Ok(link) => Json(LinkCreateResponse { success: true, link: Some(link), error: None }),
        Err(e) => Json(LinkCreateResponse { success: false, link: None, error: Some(e.to_string()) }),
    }
}

async fn delete_link(
    Extension(agent): Extension<Arc<Agent>>,
    Path((lab_id, link_id)): Path<(String, String)>,
) -> Json<LinkDeleteResponse> {
    match Orchestrator::new(agent).delete_link(&lab_id, &link_id).await {
        Ok(()) => Json(LinkDeleteResponse { success: true, error: None }),
        Err(e) => Json(LinkDeleteResponse { success: false, error: Some(e.to_string()) }),
    }
}

async fn list_links(Extension(agent): Extension<Arc<Agent>>, Path(lab_id): Path<String>) -> AgentResult<Json<LinkListResponse>> {
    let links: Vec<LinkInfo> = Orchestrator::new(agent).list_links(&lab_id).await?;
    Ok(Json(LinkListResponse { links, timestamp: chrono::Utc::now() }))
}

async fn set_carrier(
    Extension(agent): Extension<Arc<Agent>>,
    Path((lab_id, node, interface)): Path<(String, String, String)>,
    Json(req): Json<CarrierStateRequest>,
) -> Json<CarrierStateResponse> {
    let up = req.state == CarrierState::On;
    let result = agent.ovs.set_carrier(&lab_id, &node, &interface, up).await;
    Json(CarrierStateResponse {
        success: result.is_ok(),
        container: node,
        interface,
        state: req.state,
        error: result.err().map(|e| e.to_string()),
    })
}

async fn isolate(
    Extension(agent): Extension<Arc<Agent>>,
    Path((lab_id, node, interface)): Path<(String, String, String)>,
) -> Json<PortIsolateResponse> {
    match agent.ovs.isolate_endpoint(&lab_id, &node, &interface).await {
        Ok(tag) => Json(PortIsolateResponse { success: true, container: node, interface, vlan_tag: Some(tag), error: None }),
        Err(e) => Json(PortIsolateResponse { success: false, container: node, interface, vlan_tag: None, error: Some(e.to_string()) }),
    }
}

async fn restore(
    Extension(agent): Extension<Arc<Agent>>,
    Path((lab_id, node, interface)): Path<(String, String, String)>,
    Json(req): Json<PortRestoreRequest>,
) -> Json<PortRestoreResponse> {
    let result = agent.ovs.restore_endpoint(&lab_id, &node, &interface, req.target_vlan).await;
    Json(PortRestoreResponse {
        success: result.is_ok(),
        container: node,
        interface,
        vlan_tag: req.target_vlan,
        error: result.err().map(|e| e.to_string()),
    })
}

async fn vlan(
    Extension(agent): Extension<Arc<Agent>>,
    Path((lab_id, node, interface)): Path<(String, String, String)>,
) -> Json<PortVlanResponse> {
    let status = agent.ovs.status().await.unwrap_or_default();
    let found = status.ports.iter().find(|p| p.lab_id == lab_id && p.node_name == node && p.iface_name == interface);
    match found {
        Some(p) => Json(PortVlanResponse { container: node, interface, vlan_tag: Some(p.vlan_tag), error: None }),
        None => Json(PortVlanResponse { container: node, interface, vlan_tag: None, error: Some("endpoint not tracked".to_string()) }),
    }
}

async fn ovs_status(Extension(agent): Extension<Arc<Agent>>) -> AgentResult<Json<OvsStatusResponse>> {
    let status = agent.ovs.status().await.map_err(AgentError::from)?;
    Ok(Json(status))
}
