use crate::agent::Agent;
use agent_types::{BridgeInfo, BridgeInventoryResponse, InterfaceDetail, InterfaceDetailsResponse, SetMtuRequest, SetMtuResponse};
use axum::{extract::Path, routing::{get, post}, Extension, Json, Router};
use std::sync::Arc;
use tokio::process::Command;

pub fn router() -> Router {
    Router::new()
        .route("/interfaces", get(list_interfaces))
        .route("/interfaces/details", get(interface_details))
        .route("/interfaces/:name/mtu", post(set_mtu))
        .route("/bridges", get(list_bridges))
}

/// Physical interfaces are ones `ip -j link show` reports without a
/// parent `link` (veth peers, bridges, and tap devices all carry one),
/// which is enough to tell host NICs apart from the overlay's own
/// synthetic ports without maintaining an allowlist of driver names.
async fn interface_details(Extension(agent): Extension<Arc<Agent>>) -> Json<InterfaceDetailsResponse> {
    if agent.config.test_mode {
        return Json(InterfaceDetailsResponse::default());
    }
    let links = match ip_json(&["-j", "link", "show"]).await {
        Some(v) => v,
        None => return Json(InterfaceDetailsResponse::default()),
    };
    let default_route_interface = default_route_interface().await;
    let interfaces = links
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|l| {
            let name = l.get("ifname")?.as_str()?.to_string();
            let mtu = l.get("mtu")?.as_u64()? as u16;
            let mac = l.get("address").and_then(|v| v.as_str()).map(|s| s.to_string());
            let state = l.get("operstate").and_then(|v| v.as_str()).unwrap_or("UNKNOWN").to_string();
            let is_physical = l.get("link_type").and_then(|v| v.as_str()) == Some("ether")
                && l.get("linkinfo").is_none()
                && name != "lo";
            let is_default_route = default_route_interface.as_deref() == Some(name.as_str());
            Some(InterfaceDetail { name, mtu, is_physical, is_default_route, mac, state })
        })
        .collect();
    Json(InterfaceDetailsResponse {
        interfaces,
        default_route_interface,
        network_manager: detect_network_manager(),
    })
}

async fn list_interfaces(Extension(agent): Extension<Arc<Agent>>) -> Json<Vec<String>> {
    if agent.config.test_mode {
        return Json(Vec::new());
    }
    let names = ip_json(&["-j", "link", "show"])
        .await
        .and_then(|v| v.as_array().map(|a| a.iter().filter_map(|l| l.get("ifname")?.as_str().map(|s| s.to_string())).collect()))
        .unwrap_or_default();
    Json(names)
}

async fn set_mtu(
    Extension(agent): Extension<Arc<Agent>>,
    Path(name): Path<String>,
    Json(req): Json<SetMtuRequest>,
) -> Json<SetMtuResponse> {
    let previous_mtu = if agent.config.test_mode {
        1500
    } else {
        ip_json(&["-j", "link", "show", "dev", &name])
            .await
            .and_then(|v| v.as_array().and_then(|a| a.first().cloned()))
            .and_then(|l| l.get("mtu").and_then(|m| m.as_u64()))
            .unwrap_or(1500) as u16
    };

    if agent.config.test_mode {
        return Json(SetMtuResponse { success: true, interface: name, previous_mtu, new_mtu: req.mtu, persisted: false });
    }

    let output = Command::new("sudo").args(["-n", "ip", "link", "set", "dev", &name, "mtu", &req.mtu.to_string()]).output().await;
    let success = matches!(output, Ok(o) if o.status.success());
    Json(SetMtuResponse { success, interface: name, previous_mtu, new_mtu: req.mtu, persisted: success && req.persist })
}

async fn list_bridges(Extension(agent): Extension<Arc<Agent>>) -> Json<BridgeInventoryResponse> {
    if agent.config.test_mode {
        return Json(BridgeInventoryResponse { bridges: vec![BridgeInfo { name: agent.config.shared_bridge.clone(), is_ovs: true, port_count: 0 }] });
    }
    let mut bridges = Vec::new();
    if let Ok(output) = Command::new("sudo").args(["-n", "ovs-vsctl", "list-br"]).output().await {
        if output.status.success() {
            for name in String::from_utf8_lossy(&output.stdout).lines() {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let port_count = Command::new("sudo")
                    .args(["-n", "ovs-vsctl", "list-ports", name])
                    .output()
                    .await
                    .map(|o| String::from_utf8_lossy(&o.stdout).lines().filter(|l| !l.trim().is_empty()).count() as u32)
                    .unwrap_or(0);
                bridges.push(BridgeInfo { name: name.to_string(), is_ovs: true, port_count });
            }
        }
    }
    Json(BridgeInventoryResponse { bridges })
}

async fn ip_json(args: &[&str]) -> Option<serde_json::Value> {
    let output = Command::new("ip").args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

async fn default_route_interface() -> Option<String> {
    let output = Command::new("ip").args(["-j", "route", "show", "default"]).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    parsed.as_array()?.first()?.get("dev")?.as_str().map(|s| s.to_string())
}

fn detect_network_manager() -> Option<String> {
    if std::path::Path::new("/run/systemd/netif/state").exists() {
        Some("systemd-networkd".to_string())
    } else if std::path::Path::new("/var/run/NetworkManager").exists() {
        Some("NetworkManager".to_string())
    } else {
        None
    }
}
