use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::agent::NodeStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReconcileTarget {
    pub container_name: String,
    pub desired_state: DesiredState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReconcileRequest {
    pub nodes: Vec<NodeReconcileTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Started,
    Stopped,
    Removed,
    AlreadyRunning,
    AlreadyStopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReconcileResult {
    pub container_name: String,
    pub action: ReconcileAction,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReconcileResponse {
    pub lab_id: String,
    #[serde(default)]
    pub results: Vec<NodeReconcileResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredLab {
    pub lab_id: String,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverLabsResponse {
    #[serde(default)]
    pub labs: Vec<DiscoveredLab>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    pub node_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub interface_count: Option<u32>,
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub startup_config: Option<String>,

    #[serde(default)]
    pub memory: Option<u32>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub cpu_limit: Option<u8>,
    #[serde(default)]
    pub disk_driver: Option<String>,
    #[serde(default)]
    pub nic_driver: Option<String>,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub libvirt_driver: Option<String>,
    #[serde(default)]
    pub readiness_probe: Option<String>,
    #[serde(default)]
    pub readiness_pattern: Option<String>,
    #[serde(default)]
    pub readiness_timeout: Option<u32>,
    #[serde(default)]
    pub efi_boot: Option<bool>,
    #[serde(default)]
    pub efi_vars: Option<String>,
    #[serde(default)]
    pub data_volume_gb: Option<u32>,
}

fn default_kind() -> String {
    "linux".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodeResponse {
    pub success: bool,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default = "default_unknown")]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

fn default_unknown() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartNodeRequest {
    #[serde(default = "default_true")]
    pub repair_endpoints: bool,
    #[serde(default = "default_true")]
    pub fix_interfaces: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StartNodeRequest {
    fn default() -> Self {
        Self {
            repair_endpoints: true,
            fix_interfaces: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartNodeResponse {
    pub success: bool,
    #[serde(default = "default_unknown")]
    pub status: String,
    #[serde(default)]
    pub endpoints_repaired: u32,
    #[serde(default)]
    pub interfaces_fixed: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopNodeResponse {
    pub success: bool,
    #[serde(default = "default_unknown")]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyNodeResponse {
    pub success: bool,
    #[serde(default)]
    pub container_removed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairEndpointsRequest {
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRepairResult {
    pub interface: String,
    pub status: String,
    #[serde(default)]
    pub host_veth: Option<String>,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairEndpointsResponse {
    pub success: bool,
    #[serde(default)]
    pub nodes_repaired: u32,
    #[serde(default)]
    pub total_endpoints_repaired: u32,
    #[serde(default)]
    pub results: HashMap<String, Vec<EndpointRepairResult>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixInterfacesResponse {
    pub success: bool,
    pub node: String,
    #[serde(default)]
    pub fixed: u32,
    #[serde(default)]
    pub already_correct: u32,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Set of labels every Archetype-managed host resource carries, used for GC scans.
#[derive(Debug, Clone, Default)]
pub struct ValidLabIds(pub HashSet<String>);

impl ValidLabIds {
    pub fn contains(&self, lab_id: &str) -> bool {
        self.0.contains(lab_id)
    }
}
