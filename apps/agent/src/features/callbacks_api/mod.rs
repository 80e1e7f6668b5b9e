use crate::agent::Agent;
use agent_types::{DeadLetterEntry, DeadLetterResponse};
use axum::{routing::get, Extension, Json, Router};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new().route("/callbacks/dead-letters", get(dead_letters))
}

async fn dead_letters(Extension(agent): Extension<Arc<Agent>>) -> Json<DeadLetterResponse> {
    let entries = agent
        .callbacks
        .dead_letters()
        .await
        .into_iter()
        .map(|d| DeadLetterEntry {
            job_id: d.job_id,
            callback_url: d.callback_url,
            attempts: d.attempts,
            last_error: d.last_error,
            first_failed_at: d.failed_at,
        })
        .collect();
    Json(DeadLetterResponse { entries })
}
