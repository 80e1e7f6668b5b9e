use crate::agent::Agent;
use crate::error::AgentResult;
use crate::orchestrator::Orchestrator;
use agent_types::{DeployRequest, DestroyRequest, JobResult};
use axum::{routing::post, Extension, Json, Router};
use std::sync::Arc;

pub fn router() -> Router {
    Router::new()
        .route("/jobs/deploy", post(deploy))
        .route("/jobs/destroy", post(destroy))
}

async fn deploy(Extension(agent): Extension<Arc<Agent>>, Json(request): Json<DeployRequest>) -> AgentResult<Json<JobResult>> {
    let result = Orchestrator::new(agent).deploy(request).await?;
    Ok(Json(result))
}

async fn destroy(Extension(agent): Extension<Arc<Agent>>, Json(request): Json<DestroyRequest>) -> AgentResult<Json<JobResult>> {
    let result = Orchestrator::new(agent).destroy(request).await?;
    Ok(Json(result))
}
