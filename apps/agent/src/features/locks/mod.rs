use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};
use agent_types::{LockRecord, LockReleaseResponse, LockStatusResponse};
use axum::{extract::Path, routing::{delete, get}, Extension, Json, Router};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/locks", get(status))
        .route("/locks/:lab_id", delete(release))
}

/// Redis stores an opaque ownership token per lab, not an acquisition
/// time or remaining TTL, so age/ttl are not derivable from the primitive
/// this manager exposes; callers that need exact expiry should watch the
/// lock's own heartbeat instead of polling this endpoint.
async fn status(Extension(agent): Extension<Arc<Agent>>) -> AgentResult<Json<LockStatusResponse>> {
    let locks = agent.locks.get_all_locks().await.map_err(AgentError::from)?;
    let locks = locks
        .into_iter()
        .map(|(lab_id, owner)| LockRecord { lab_id, owner, age_secs: 0, ttl_secs: -1 })
        .collect();
    Ok(Json(LockStatusResponse { redis_connected: agent.locks.is_distributed(), locks }))
}

async fn release(Extension(agent): Extension<Arc<Agent>>, Path(lab_id): Path<String>) -> AgentResult<Json<LockReleaseResponse>> {
    let success = agent.locks.force_release(&lab_id).await.map_err(AgentError::from)?;
    Ok(Json(LockReleaseResponse { success, lab_id }))
}
