use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDetail {
    pub name: String,
    pub mtu: u16,
    pub is_physical: bool,
    pub is_default_route: bool,
    #[serde(default)]
    pub mac: Option<String>,
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceDetailsResponse {
    #[serde(default)]
    pub interfaces: Vec<InterfaceDetail>,
    #[serde(default)]
    pub default_route_interface: Option<String>,
    #[serde(default)]
    pub network_manager: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub name: String,
    #[serde(default)]
    pub is_ovs: bool,
    #[serde(default)]
    pub port_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeInventoryResponse {
    #[serde(default)]
    pub bridges: Vec<BridgeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub lab_id: String,
    pub owner: String,
    pub age_secs: u64,
    pub ttl_secs: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStatusResponse {
    #[serde(default)]
    pub redis_connected: bool,
    #[serde(default)]
    pub locks: Vec<LockRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReleaseResponse {
    pub success: bool,
    pub lab_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub callback_url: String,
    pub attempts: u32,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterResponse {
    #[serde(default)]
    pub entries: Vec<DeadLetterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub job_id: String,
    pub target_version: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProgressCallback {
    pub job_id: String,
    pub agent_id: String,
    pub status: String,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub accepted: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_unknown")]
    pub deployment_mode: String,
}

fn default_unknown() -> String {
    "unknown".to_string()
}
