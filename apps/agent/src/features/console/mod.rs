use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};
use agent_types::{ConsoleControlMessage, ConsoleInfo, ConsoleRequest};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::Path,
    response::Response,
    routing::{get, post},
    Extension, Json, Router,
};
use bollard::exec::StartExecResults;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/console/session", post(open_session))
        .route("/console/ws/:session_id", get(ws_handler))
}

async fn open_session(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<ConsoleRequest>) -> AgentResult<Json<ConsoleInfo>> {
    if agent.container_provider.is_none() {
        return Err(AgentError::not_available("console sessions require the container provider"));
    }
    let runtime_id = crate::providers::node_runtime_name(&req.lab_id, &req.node_name);
    let session_id = uuid::Uuid::new_v4().to_string();
    agent.console_sessions.lock().await.insert(session_id.clone(), (runtime_id, req.shell));
    Ok(Json(ConsoleInfo { websocket_path: format!("/agent/v1/console/ws/{session_id}"), session_id }))
}

async fn ws_handler(Extension(agent): Extension<Arc<Agent>>, Path(session_id): Path<String>, ws: WebSocketUpgrade) -> Response {
    let session = agent.console_sessions.lock().await.remove(&session_id);
    ws.on_upgrade(move |socket| async move {
        let Some((runtime_id, shell)) = session else {
            let _ = socket.close().await;
            return;
        };
        if let Err(e) = proxy_console(agent, &runtime_id, &shell, socket).await {
            tracing::warn!(runtime_id = %runtime_id, error = %e, "console websocket proxy failed");
        }
    })
}

async fn proxy_console(agent: Arc<Agent>, runtime_id: &str, shell: &str, socket: WebSocket) -> anyhow::Result<()> {
    let provider = agent
        .container_provider
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("container provider not enabled"))?;
    let (exec_id, started) = provider.interactive_exec(runtime_id, shell).await?;
    let StartExecResults::Attached { mut output, mut input } = started else {
        anyhow::bail!("docker refused to attach an interactive stream for this exec");
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    let to_ws = async {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(msg) => {
                    if ws_tx.send(Message::Binary(msg.into_bytes().to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    };

    let provider = provider.clone();
    let exec_id_for_resize = exec_id.clone();
    let from_ws = async move {
        while let Some(msg) = ws_rx.next().await {
            let Ok(msg) = msg else { break };
            match msg {
                Message::Binary(data) => {
                    if tokio::io::AsyncWriteExt::write_all(&mut input, &data).await.is_err() {
                        break;
                    }
                }
                Message::Text(text) => {
                    if let Ok(ConsoleControlMessage::Resize { rows, cols }) = serde_json::from_str(&text) {
                        let _ = provider.resize_exec(&exec_id_for_resize, rows, cols).await;
                    } else if tokio::io::AsyncWriteExt::write_all(&mut input, text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = to_ws => {},
        _ = from_ws => {},
    }
    Ok(())
}
