use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::agent::{JobStatus, Provider};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployNode {
    pub name: String,
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
    pub ports: Vec<String>,
    #[serde(default)]
    pub startup_config: Option<String>,
    #[serde(default)]
    pub exec_cmds: Vec<String>,

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
pub struct DeployLink {
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    /// Present only for links whose other endpoint lives on a different host.
    #[serde(default)]
    pub remote_host_ip: Option<String>,
    #[serde(default)]
    pub vni: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployTopology {
    pub nodes: Vec<DeployNode>,
    #[serde(default)]
    pub links: Vec<DeployLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub job_id: String,
    pub lab_id: String,
    #[serde(default)]
    pub topology: Option<DeployTopology>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub job_id: String,
    pub lab_id: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabStatusResponse {
    pub lab_id: String,
    #[serde(default)]
    pub nodes: Vec<crate::nodes::NodeInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfigsResponse {
    pub success: bool,
    #[serde(default)]
    pub extracted_count: u32,
    #[serde(default)]
    pub configs: Vec<ExtractedConfig>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedConfig {
    pub node_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOrphansRequest {
    #[serde(default)]
    pub valid_lab_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOrphansResponse {
    #[serde(default)]
    pub removed_containers: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupLabOrphansRequest {
    pub lab_id: String,
    #[serde(default)]
    pub keep_node_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupLabOrphansResponse {
    #[serde(default)]
    pub removed_containers: Vec<String>,
    #[serde(default)]
    pub kept_containers: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerPruneRequest {
    #[serde(default)]
    pub valid_lab_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub prune_dangling_images: bool,
    #[serde(default = "default_true")]
    pub prune_build_cache: bool,
    #[serde(default)]
    pub prune_unused_volumes: bool,
    #[serde(default)]
    pub prune_stopped_containers: bool,
    #[serde(default)]
    pub prune_unused_networks: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerPruneResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub images_removed: u32,
    #[serde(default)]
    pub build_cache_removed: u32,
    #[serde(default)]
    pub volumes_removed: u32,
    #[serde(default)]
    pub containers_removed: u32,
    #[serde(default)]
    pub networks_removed: u32,
    #[serde(default)]
    pub space_reclaimed: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}
