use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginHealthResponse {
    pub healthy: bool,
    #[serde(default)]
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginBridgeInfo {
    pub lab_id: String,
    pub bridge_name: String,
    #[serde(default)]
    pub port_count: u32,
    #[serde(default)]
    pub vlan_range_used: (u16, u16),
    #[serde(default)]
    pub vxlan_tunnels: u32,
    #[serde(default)]
    pub external_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginStatusResponse {
    pub healthy: bool,
    #[serde(default)]
    pub labs_count: u32,
    #[serde(default)]
    pub endpoints_count: u32,
    #[serde(default)]
    pub networks_count: u32,
    #[serde(default)]
    pub management_networks_count: u32,
    #[serde(default)]
    pub bridges: Vec<PluginBridgeInfo>,
    #[serde(default)]
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginPortInfo {
    pub port_name: String,
    #[serde(default)]
    pub bridge_name: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    pub interface: String,
    #[serde(default)]
    pub vlan_tag: u16,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginLabPortsResponse {
    pub lab_id: String,
    #[serde(default)]
    pub ports: Vec<PluginPortInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginFlowsResponse {
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub flow_count: u32,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginVxlanRequest {
    pub link_id: String,
    pub local_ip: String,
    pub remote_ip: String,
    pub vni: u32,
    pub vlan_tag: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginVxlanResponse {
    pub success: bool,
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginExternalAttachRequest {
    pub external_interface: String,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginExternalAttachResponse {
    pub success: bool,
    #[serde(default)]
    pub vlan_tag: u16,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginExternalInfo {
    pub interface: String,
    #[serde(default)]
    pub vlan_tag: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginExternalListResponse {
    pub lab_id: String,
    #[serde(default)]
    pub interfaces: Vec<PluginExternalInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMgmtNetworkInfo {
    pub lab_id: String,
    pub network_id: String,
    pub network_name: String,
    pub subnet: String,
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMgmtNetworkResponse {
    pub success: bool,
    #[serde(default)]
    pub network: Option<PluginMgmtNetworkInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMgmtAttachRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMgmtAttachResponse {
    pub success: bool,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
