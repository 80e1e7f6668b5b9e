use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerImageInfo {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInventoryResponse {
    #[serde(default)]
    pub images: Vec<DockerImageInfo>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageExistsResponse {
    pub exists: bool,
    #[serde(default)]
    pub image: Option<DockerImageInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReceiveRequest {
    pub image_id: String,
    pub reference: String,
    pub total_bytes: u64,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageReceiveResponse {
    pub success: bool,
    #[serde(default)]
    pub loaded_images: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePullRequest {
    pub image_id: String,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePullResponse {
    pub job_id: String,
    #[serde(default = "default_pending")]
    pub status: String,
}

fn default_pending() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePullProgress {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub error: Option<String>,
}
