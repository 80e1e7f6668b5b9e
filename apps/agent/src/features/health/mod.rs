use crate::agent::Agent;
use axum::{response::IntoResponse, routing::get, Extension, Json, Router};
use std::sync::Arc;
use sysinfo::System;

pub fn router() -> Router {
    Router::new()
        .route("/agent/v1/health", get(health))
        .route("/agent/v1/capacity", get(capacity))
}

async fn health(Extension(agent): Extension<Arc<Agent>>) -> impl IntoResponse {
    let uptime = (chrono::Utc::now() - agent.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "agent_id": agent.config.agent_id,
        "uptime_seconds": uptime,
        "container_provider": agent.container_provider.is_some(),
        "vm_provider": agent.vm_provider.is_some(),
        "redis_connected": agent.locks.is_distributed(),
        "time": chrono::Utc::now(),
    }))
}

async fn capacity(Extension(agent): Extension<Arc<Agent>>) -> impl IntoResponse {
    let mut sys = System::new();
    sys.refresh_memory();
    Json(serde_json::json!({
        "cpu_total": num_cpus::get(),
        "mem_mib_total": sys.total_memory() / 1024 / 1024,
        "mem_mib_free": sys.available_memory() / 1024 / 1024,
        "max_concurrent_jobs": agent.config.max_concurrent_jobs,
    }))
}
