use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleRequest {
    pub lab_id: String,
    pub node_name: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleInfo {
    pub websocket_path: String,
    pub session_id: String,
}

/// In-band control frame sent over the console WebSocket alongside raw PTY bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleControlMessage {
    Resize { rows: u16, cols: u16 },
}
