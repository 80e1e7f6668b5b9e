use crate::agent::Agent;
use agent_types::{
    PluginBridgeInfo, PluginExternalAttachRequest, PluginExternalAttachResponse, PluginExternalInfo,
    PluginExternalListResponse, PluginFlowsResponse, PluginHealthResponse, PluginLabPortsResponse,
    PluginMgmtAttachRequest, PluginMgmtAttachResponse, PluginMgmtNetworkInfo, PluginMgmtNetworkResponse,
    PluginPortInfo, PluginStatusResponse, PluginVxlanRequest, PluginVxlanResponse,
};
use axum::{extract::Path, routing::{get, post}, Extension, Json, Router};
use std::sync::Arc;
use tokio::process::Command;

/// A read-only introspection and thin management surface for the OVS
/// Docker network plugin sidecar, gated behind `enable_ovs_plugin` since
/// most deployments run the data plane without a libnetwork driver
/// attached at all.
pub fn router() -> Router {
    Router::new()
        .route("/plugin/health", get(health))
        .route("/plugin/status", get(status))
        .route("/plugin/labs/:lab_id/ports", get(lab_ports))
        .route("/plugin/flows", get(flows))
        .route("/plugin/vxlan", post(vxlan))
        .route("/plugin/labs/:lab_id/external/attach", post(external_attach))
        .route("/plugin/labs/:lab_id/external", get(external_list))
        .route("/plugin/labs/:lab_id/mgmt-network", post(create_mgmt_network))
        .route("/plugin/mgmt-network/:network_id/attach", post(mgmt_attach))
}

fn gate(agent: &Agent) -> bool {
    agent.config.enable_ovs_plugin
}

async fn health(Extension(agent): Extension<Arc<Agent>>) -> Json<PluginHealthResponse> {
    let uptime = (chrono::Utc::now() - agent.started_at).num_milliseconds() as f64 / 1000.0;
    Json(PluginHealthResponse { healthy: gate(&agent), uptime_seconds: uptime.max(0.0) })
}

async fn status(Extension(agent): Extension<Arc<Agent>>) -> Json<PluginStatusResponse> {
    if !gate(&agent) {
        return Json(PluginStatusResponse::default());
    }
    let ovs_status = agent.ovs.status().await.unwrap_or_default();
    let overlay_status = agent.overlay.status().await.unwrap_or_default();
    let labs_count = agent.workspace.known_labs().await.map(|l| l.len() as u32).unwrap_or(0);
    let external = agent.ovs.list_external_connections().await.unwrap_or_default();
    let uptime = (chrono::Utc::now() - agent.started_at).num_milliseconds() as f64 / 1000.0;
    Json(PluginStatusResponse {
        healthy: true,
        labs_count,
        endpoints_count: ovs_status.ports.len() as u32,
        networks_count: 0,
        management_networks_count: 0,
        bridges: vec![PluginBridgeInfo {
            lab_id: "*".to_string(),
            bridge_name: agent.config.shared_bridge.clone(),
            port_count: ovs_status.ports.len() as u32,
            vlan_range_used: (agent.config.vlan_base, agent.config.vlan_max),
            vxlan_tunnels: overlay_status.tunnels.len() as u32,
            external_interfaces: external,
        }],
        uptime_seconds: uptime.max(0.0),
    })
}

async fn lab_ports(Extension(agent): Extension<Arc<Agent>>, Path(lab_id): Path<String>) -> Json<PluginLabPortsResponse> {
    let ovs_status = agent.ovs.status().await.unwrap_or_default();
    let ports = ovs_status
        .ports
        .into_iter()
        .filter(|p| p.lab_id == lab_id)
        .map(|p| PluginPortInfo {
            port_name: p.port_name,
            bridge_name: Some(agent.config.shared_bridge.clone()),
            container: Some(p.node_name),
            interface: p.iface_name,
            vlan_tag: p.vlan_tag,
            rx_bytes: 0,
            tx_bytes: 0,
        })
        .collect();
    Json(PluginLabPortsResponse { lab_id, ports })
}

async fn flows(Extension(agent): Extension<Arc<Agent>>) -> Json<PluginFlowsResponse> {
    if agent.config.test_mode {
        return Json(PluginFlowsResponse { bridge: Some(agent.config.shared_bridge.clone()), flow_count: 0, flows: vec![], error: None });
    }
    let output = Command::new("sudo").args(["-n", "ovs-ofctl", "dump-flows", &agent.config.shared_bridge]).output().await;
    match output {
        Ok(o) if o.status.success() => {
            let flows: Vec<String> = String::from_utf8_lossy(&o.stdout).lines().map(|l| l.to_string()).collect();
            Json(PluginFlowsResponse { bridge: Some(agent.config.shared_bridge.clone()), flow_count: flows.len() as u32, flows, error: None })
        }
        Ok(o) => Json(PluginFlowsResponse { bridge: Some(agent.config.shared_bridge.clone()), flow_count: 0, flows: vec![], error: Some(String::from_utf8_lossy(&o.stderr).trim().to_string()) }),
        Err(e) => Json(PluginFlowsResponse { bridge: Some(agent.config.shared_bridge.clone()), flow_count: 0, flows: vec![], error: Some(e.to_string()) }),
    }
}

async fn vxlan(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<PluginVxlanRequest>) -> Json<PluginVxlanResponse> {
    match agent.overlay.attach_link(&req.link_id, req.vlan_tag, req.vni, &req.remote_ip, &req.local_ip).await {
        Ok(tunnel) => Json(PluginVxlanResponse { success: true, port_name: Some(tunnel.device_name), error: None }),
        Err(e) => Json(PluginVxlanResponse { success: false, port_name: None, error: Some(e.to_string()) }),
    }
}

async fn external_attach(
    Extension(agent): Extension<Arc<Agent>>,
    Path(lab_id): Path<String>,
    Json(req): Json<PluginExternalAttachRequest>,
) -> Json<PluginExternalAttachResponse> {
    match agent.ovs.external_attach(&lab_id, &req.external_interface, req.vlan_tag).await {
        Ok(_port) => Json(PluginExternalAttachResponse { success: true, vlan_tag: req.vlan_tag.unwrap_or(0), error: None }),
        Err(e) => Json(PluginExternalAttachResponse { success: false, vlan_tag: 0, error: Some(e.to_string()) }),
    }
}

async fn external_list(Extension(agent): Extension<Arc<Agent>>, Path(lab_id): Path<String>) -> Json<PluginExternalListResponse> {
    let interfaces = agent
        .ovs
        .list_external_connections()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|c| c.lab_id.as_deref() == Some(lab_id.as_str()))
        .map(|c| PluginExternalInfo { interface: c.external_interface, vlan_tag: c.vlan_tag.unwrap_or(0) })
        .collect();
    Json(PluginExternalListResponse { lab_id, interfaces })
}

async fn create_mgmt_network(
    Extension(agent): Extension<Arc<Agent>>,
    Path(lab_id): Path<String>,
) -> Json<PluginMgmtNetworkResponse> {
    let Some(provider) = &agent.container_provider else {
        return Json(PluginMgmtNetworkResponse { success: false, network: None, error: Some("container provider not enabled".to_string()) });
    };
    let octet = (crc32(&lab_id) % 200 + 20) as u8;
    let subnet = format!("172.{octet}.0.0/24");
    let gateway = format!("172.{octet}.0.1");
    match provider.create_mgmt_network(&lab_id, &subnet, &gateway).await {
        Ok((network_id, network_name)) => Json(PluginMgmtNetworkResponse {
            success: true,
            network: Some(PluginMgmtNetworkInfo { lab_id, network_id, network_name, subnet, gateway }),
            error: None,
        }),
        Err(e) => Json(PluginMgmtNetworkResponse { success: false, network: None, error: Some(e.to_string()) }),
    }
}

async fn mgmt_attach(
    Extension(agent): Extension<Arc<Agent>>,
    Path(network_id): Path<String>,
    Json(req): Json<PluginMgmtAttachRequest>,
) -> Json<PluginMgmtAttachResponse> {
    let Some(provider) = &agent.container_provider else {
        return Json(PluginMgmtAttachResponse { success: false, ip_address: None, error: Some("container provider not enabled".to_string()) });
    };
    if let Err(e) = provider.attach_to_network(&network_id, &req.container_id).await {
        return Json(PluginMgmtAttachResponse { success: false, ip_address: None, error: Some(e.to_string()) });
    }
    let ip = provider.inspect_container_ip(&req.container_id, &network_id).await.ok().flatten();
    Json(PluginMgmtAttachResponse { success: true, ip_address: ip, error: None })
}

fn crc32(s: &str) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    (hasher.finish() & 0xffff_ffff) as u32
}
