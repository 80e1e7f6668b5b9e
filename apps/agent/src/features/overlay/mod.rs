use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};
use agent_types::{
    AttachOverlayExternalRequest, AttachOverlayExternalResponse, AttachOverlayInterfaceRequest,
    AttachOverlayInterfaceResponse, CleanupOverlayRequest, CleanupOverlayResponse, DetachOverlayInterfaceRequest,
    DetachOverlayInterfaceResponse, EnsureVtepRequest, EnsureVtepResponse, OverlayStatusResponse,
};
use axum::{routing::{get, post}, Extension, Json, Router};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/overlay/vtep", post(ensure_vtep))
        .route("/overlay/attach-link", post(attach_link))
        .route("/overlay/detach-link", post(detach_link))
        .route("/overlay/attach-external", post(attach_external))
        .route("/overlay/cleanup", post(cleanup))
        .route("/overlay/status", get(status))
}

async fn ensure_vtep(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<EnsureVtepRequest>) -> Json<EnsureVtepResponse> {
    match agent.overlay.ensure_vtep(&req.remote_ip, &req.local_ip, agent.config.vni_base).await {
        Ok(vtep) => Json(EnsureVtepResponse { success: true, created: vtep.refcount == 1, vtep: Some(vtep), error: None }),
        Err(e) => Json(EnsureVtepResponse { success: false, vtep: None, created: false, error: Some(e.to_string()) }),
    }
}

/// Resolves the local VLAN tag backing `container_name`/`interface_name`,
/// attaching the endpoint first if this agent hasn't wired it yet. The
/// request field is named `container_name` for parity with the provider
/// APIs, but carries whatever node identifier this agent tracks endpoints
/// under.
async fn local_vlan_for(agent: &Agent, lab_id: &str, node: &str, interface: &str) -> anyhow::Result<u16> {
    let status = agent.ovs.status().await?;
    if let Some(port) = status.ports.iter().find(|p| p.lab_id == lab_id && p.node_name == node && p.iface_name == interface) {
        return Ok(port.vlan_tag);
    }
    let endpoint = agent.ovs.attach_endpoint(lab_id, node, interface, "", "").await?;
    Ok(endpoint.vlan_tag)
}

async fn attach_link(
    Extension(agent): Extension<Arc<Agent>>,
    Json(req): Json<AttachOverlayInterfaceRequest>,
) -> Json<AttachOverlayInterfaceResponse> {
    let local_vlan = match local_vlan_for(&agent, &req.lab_id, &req.container_name, &req.interface_name).await {
        Ok(v) => v,
        Err(e) => return Json(AttachOverlayInterfaceResponse { success: false, local_vlan: None, vni: None, error: Some(e.to_string()) }),
    };
    match agent.overlay.attach_link(&req.link_id, local_vlan, req.vni, &req.remote_ip, &req.local_ip).await {
        Ok(tunnel) => {
            if let Err(e) = agent.workspace.add_overlay_link(&req.lab_id, &req.link_id).await {
                tracing::warn!(lab_id = %req.lab_id, link_id = %req.link_id, error = %e, "failed to record overlay link for cleanup tracking");
            }
            Json(AttachOverlayInterfaceResponse { success: true, local_vlan: Some(tunnel.local_vlan), vni: Some(tunnel.vni), error: None })
        }
        Err(e) => Json(AttachOverlayInterfaceResponse { success: false, local_vlan: Some(local_vlan), vni: None, error: Some(e.to_string()) }),
    }
}

async fn detach_link(
    Extension(agent): Extension<Arc<Agent>>,
    Json(req): Json<DetachOverlayInterfaceRequest>,
) -> Json<DetachOverlayInterfaceResponse> {
    let new_vlan = agent.ovs.isolate_endpoint(&req.lab_id, &req.container_name, &req.interface_name).await.ok();
    match agent.overlay.detach_link(&req.link_id).await {
        Ok(()) => {
            if let Err(e) = agent.workspace.remove_overlay_link(&req.lab_id, &req.link_id).await {
                tracing::warn!(lab_id = %req.lab_id, link_id = %req.link_id, error = %e, "failed to drop overlay link from cleanup tracking");
            }
            Json(DetachOverlayInterfaceResponse {
                success: true,
                interface_isolated: new_vlan.is_some(),
                new_vlan,
                tunnel_deleted: true,
                error: None,
            })
        }
        Err(e) => Json(DetachOverlayInterfaceResponse {
            success: false,
            interface_isolated: new_vlan.is_some(),
            new_vlan,
            tunnel_deleted: false,
            error: Some(e.to_string()),
        }),
    }
}

async fn attach_external(
    Extension(agent): Extension<Arc<Agent>>,
    Json(req): Json<AttachOverlayExternalRequest>,
) -> Json<AttachOverlayExternalResponse> {
    if let Err(e) = agent.ovs.external_attach(&req.lab_id, &req.external_interface, Some(req.vlan_tag)).await {
        return Json(AttachOverlayExternalResponse { success: false, vni: None, error: Some(e.to_string()) });
    }
    match agent.overlay.attach_link(&req.link_id, req.vlan_tag, req.vni, &req.remote_ip, &req.local_ip).await {
        Ok(tunnel) => {
            if let Err(e) = agent.workspace.add_overlay_link(&req.lab_id, &req.link_id).await {
                tracing::warn!(lab_id = %req.lab_id, link_id = %req.link_id, error = %e, "failed to record overlay link for cleanup tracking");
            }
            Json(AttachOverlayExternalResponse { success: true, vni: Some(tunnel.vni), error: None })
        }
        Err(e) => Json(AttachOverlayExternalResponse { success: false, vni: None, error: Some(e.to_string()) }),
    }
}

async fn cleanup(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<CleanupOverlayRequest>) -> AgentResult<Json<CleanupOverlayResponse>> {
    let link_ids = agent.workspace.read_overlay_links(&req.lab_id).await.map_err(AgentError::from)?;
    let mut errors = Vec::new();
    let mut tunnels_deleted = 0u32;
    for link_id in &link_ids {
        match agent.overlay.detach_link(link_id).await {
            Ok(()) => tunnels_deleted += 1,
            Err(e) => errors.push(format!("{link_id}: {e}")),
        }
        let _ = agent.workspace.remove_overlay_link(&req.lab_id, link_id).await;
    }
    Ok(Json(CleanupOverlayResponse { tunnels_deleted, bridges_deleted: 0, errors }))
}

async fn status(Extension(agent): Extension<Arc<Agent>>) -> AgentResult<Json<OverlayStatusResponse>> {
    let status = agent.overlay.status().await.map_err(AgentError::from)?;
    Ok(Json(status))
}
