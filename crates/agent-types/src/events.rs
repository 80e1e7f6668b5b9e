use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeEventType {
    Started,
    Stopped,
    Died,
    Removed,
    Oom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub lab_id: String,
    pub node_name: String,
    pub container_id: String,
    pub event_type: NodeEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEventCallback {
    pub agent_id: String,
    pub lab_id: String,
    pub node_name: String,
    pub container_id: String,
    pub event_type: NodeEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}
