use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connected,
    Disconnected,
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState::Disconnected
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCreate {
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub link_id: String,
    pub lab_id: String,
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    #[serde(default)]
    pub state: LinkState,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

impl LinkInfo {
    /// Canonical identity: alphabetically-sorted `{node}:{iface}-{node}:{iface}`.
    pub fn canonical_id(
        node_a: &str,
        iface_a: &str,
        node_b: &str,
        iface_b: &str,
    ) -> String {
        let a = format!("{node_a}:{iface_a}");
        let b = format!("{node_b}:{iface_b}");
        if a <= b {
            format!("{a}-{b}")
        } else {
            format!("{b}-{a}")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCreateResponse {
    pub success: bool,
    #[serde(default)]
    pub link: Option<LinkInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDeleteResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkListResponse {
    #[serde(default)]
    pub links: Vec<LinkInfo>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierState {
    On,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierStateRequest {
    pub state: CarrierState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierStateResponse {
    pub success: bool,
    pub container: String,
    pub interface: String,
    pub state: CarrierState,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortIsolateResponse {
    pub success: bool,
    pub container: String,
    pub interface: String,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRestoreRequest {
    pub target_vlan: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRestoreResponse {
    pub success: bool,
    pub container: String,
    pub interface: String,
    pub vlan_tag: u16,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortVlanResponse {
    pub container: String,
    pub interface: String,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvsPortInfo {
    pub port_name: String,
    pub lab_id: String,
    pub node_name: String,
    pub iface_name: String,
    pub vlan_tag: u16,
    #[serde(default)]
    pub isolated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OvsStatusResponse {
    pub bridge: String,
    #[serde(default)]
    pub ports: Vec<OvsPortInfo>,
    #[serde(default)]
    pub links: Vec<LinkInfo>,
    #[serde(default)]
    pub vlan_allocations: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalConnectRequest {
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    pub interface_name: String,
    pub external_interface: String,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConnectResponse {
    pub success: bool,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDisconnectRequest {
    pub external_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDisconnectResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConnectionInfo {
    pub external_interface: String,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    #[serde(default)]
    pub connected_ports: Vec<String>,
    #[serde(default)]
    pub lab_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalListResponse {
    #[serde(default)]
    pub connections: Vec<ExternalConnectionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgePatchRequest {
    pub target_bridge: String,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgePatchResponse {
    pub success: bool,
    #[serde(default)]
    pub patch_port: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeDeletePatchRequest {
    pub target_bridge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeDeletePatchResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMtuRequest {
    pub mtu: u16,
    #[serde(default = "default_true")]
    pub persist: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMtuResponse {
    pub success: bool,
    pub interface: String,
    pub previous_mtu: u16,
    pub new_mtu: u16,
    #[serde(default)]
    pub persisted: bool,
    #[serde(default)]
    pub network_manager: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtuTestRequest {
    pub target_ip: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub source_ip: Option<String>,
}

fn default_mtu() -> u16 {
    1450
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtuTestResponse {
    pub success: bool,
    #[serde(default)]
    pub tested_mtu: Option<u16>,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub ttl: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
}
