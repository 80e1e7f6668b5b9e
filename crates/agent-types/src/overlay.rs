use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub link_id: String,
    pub device_name: String,
    pub vni: u32,
    pub remote_ip: String,
    pub local_vlan: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VtepInfo {
    pub device_name: String,
    pub remote_ip: String,
    pub refcount: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureVtepRequest {
    pub local_ip: String,
    pub remote_ip: String,
    #[serde(default)]
    pub remote_host_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureVtepResponse {
    pub success: bool,
    #[serde(default)]
    pub vtep: Option<VtepInfo>,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachOverlayInterfaceRequest {
    pub lab_id: String,
    pub container_name: String,
    pub interface_name: String,
    pub vni: u32,
    pub local_ip: String,
    pub remote_ip: String,
    pub link_id: String,
    #[serde(default)]
    pub tenant_mtu: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachOverlayInterfaceResponse {
    pub success: bool,
    #[serde(default)]
    pub local_vlan: Option<u16>,
    #[serde(default)]
    pub vni: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachOverlayInterfaceRequest {
    pub lab_id: String,
    pub container_name: String,
    pub interface_name: String,
    pub link_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetachOverlayInterfaceResponse {
    pub success: bool,
    #[serde(default)]
    pub interface_isolated: bool,
    #[serde(default)]
    pub new_vlan: Option<u16>,
    #[serde(default)]
    pub tunnel_deleted: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachOverlayExternalRequest {
    pub lab_id: String,
    pub external_interface: String,
    pub vlan_tag: u16,
    pub vni: u32,
    pub local_ip: String,
    pub remote_ip: String,
    pub link_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachOverlayExternalResponse {
    pub success: bool,
    #[serde(default)]
    pub vni: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOverlayRequest {
    pub lab_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOverlayResponse {
    #[serde(default)]
    pub tunnels_deleted: u32,
    #[serde(default)]
    pub bridges_deleted: u32,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayStatusResponse {
    #[serde(default)]
    pub tunnels: Vec<TunnelInfo>,
    #[serde(default)]
    pub vteps: Vec<VtepInfo>,
}
