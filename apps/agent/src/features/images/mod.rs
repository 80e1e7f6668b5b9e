use crate::agent::Agent;
use agent_types::{
    ImageExistsResponse, ImageInventoryResponse, ImagePullProgress, ImagePullRequest, ImagePullResponse,
    ImageReceiveResponse,
};
use axum::{
    extract::{Multipart, Path},
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;
use tokio::process::Command;

pub fn router() -> Router {
    Router::new()
        .route("/images", get(list_images))
        .route("/images/pull", post(pull_image))
        .route("/images/receive", post(receive_image))
        .route("/images/pull/:job_id/progress", get(pull_progress))
        .route("/images/*reference", get(check_image))
}

async fn list_images(Extension(agent): Extension<Arc<Agent>>) -> Json<ImageInventoryResponse> {
    let images = match &agent.container_provider {
        Some(p) => p.list_images().await.unwrap_or_default(),
        None => Vec::new(),
    };
    Json(ImageInventoryResponse { images, timestamp: chrono::Utc::now() })
}

async fn check_image(Extension(agent): Extension<Arc<Agent>>, Path(reference): Path<String>) -> Json<ImageExistsResponse> {
    let Some(provider) = &agent.container_provider else {
        return Json(ImageExistsResponse { exists: false, image: None });
    };
    match provider.inspect_image(&reference).await {
        Ok(Some(image)) => Json(ImageExistsResponse { exists: true, image: Some(image) }),
        _ => Json(ImageExistsResponse { exists: false, image: None }),
    }
}

/// Accepts a streamed `docker save` tar from the controller and loads it
/// into the local daemon via the `docker` CLI, the same mechanism the
/// provider's bollard client doesn't expose as cleanly as a multipart
/// upload needs. Mirrors the original's temp-file-then-load flow.
async fn receive_image(Extension(agent): Extension<Arc<Agent>>, mut multipart: Multipart) -> Json<ImageReceiveResponse> {
    let mut job_id = String::new();
    let mut reference = String::new();
    let mut total_bytes: u64 = 0;
    let mut tar_bytes: Option<bytes::Bytes> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return Json(ImageReceiveResponse { success: false, loaded_images: vec![], error: Some(e.to_string()) }),
        };
        match field.name().unwrap_or_default() {
            "job_id" => job_id = field.text().await.unwrap_or_default(),
            "reference" => reference = field.text().await.unwrap_or_default(),
            "total_bytes" => total_bytes = field.text().await.unwrap_or_default().parse().unwrap_or(0),
            "file" => match field.bytes().await {
                Ok(b) => tar_bytes = Some(b),
                Err(e) => return Json(ImageReceiveResponse { success: false, loaded_images: vec![], error: Some(e.to_string()) }),
            },
            _ => {}
        }
    }

    let Some(tar_bytes) = tar_bytes else {
        return Json(ImageReceiveResponse { success: false, loaded_images: vec![], error: Some("no file field in upload".to_string()) });
    };

    if !job_id.is_empty() {
        let mut jobs = agent.image_jobs.lock().await;
        jobs.insert(
            job_id.clone(),
            ImagePullProgress { job_id: job_id.clone(), status: "transferring".to_string(), progress_percent: 50, bytes_transferred: tar_bytes.len() as u64, total_bytes, error: None },
        );
    }

    let tmp_path = std::env::temp_dir().join(format!("archetype-image-{}.tar", uuid::Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp_path, &tar_bytes).await {
        return Json(ImageReceiveResponse { success: false, loaded_images: vec![], error: Some(e.to_string()) });
    }

    if !job_id.is_empty() {
        let mut jobs = agent.image_jobs.lock().await;
        jobs.insert(
            job_id.clone(),
            ImagePullProgress { job_id: job_id.clone(), status: "loading".to_string(), progress_percent: 90, bytes_transferred: tar_bytes.len() as u64, total_bytes, error: None },
        );
    }

    let result = Command::new("docker").args(["load", "-i"]).arg(&tmp_path).output().await;
    let _ = tokio::fs::remove_file(&tmp_path).await;

    let response = match result {
        Ok(output) if output.status.success() => {
            let text = format!("{}{}", String::from_utf8_lossy(&output.stdout), String::from_utf8_lossy(&output.stderr));
            let loaded_images = text
                .lines()
                .filter_map(|line| {
                    line.split_once("Loaded image:").or_else(|| line.split_once("Loaded image ID:")).map(|(_, rest)| rest.trim().to_string())
                })
                .collect();
            ImageReceiveResponse { success: true, loaded_images, error: None }
        }
        Ok(output) => {
            let err = String::from_utf8_lossy(&output.stderr).trim().to_string();
            ImageReceiveResponse { success: false, loaded_images: vec![], error: Some(if err.is_empty() { "docker load failed".to_string() } else { err }) }
        }
        Err(e) => ImageReceiveResponse { success: false, loaded_images: vec![], error: Some(e.to_string()) },
    };

    if !job_id.is_empty() {
        let mut jobs = agent.image_jobs.lock().await;
        let status = if response.success { "completed" } else { "failed" }.to_string();
        jobs.insert(
            job_id.clone(),
            ImagePullProgress {
                job_id,
                status,
                progress_percent: if response.success { 100 } else { 0 },
                bytes_transferred: tar_bytes.len() as u64,
                total_bytes,
                error: response.error.clone(),
            },
        );
    }
    let _ = reference;
    Json(response)
}

/// Initiates a pull from the controller's own image library rather than a
/// public registry, so the agent doesn't need registry credentials for
/// images the controller already vetted and cached.
async fn pull_image(Extension(agent): Extension<Arc<Agent>>, Json(req): Json<ImagePullRequest>) -> Json<ImagePullResponse> {
    let job_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    {
        let mut jobs = agent.image_jobs.lock().await;
        jobs.insert(job_id.clone(), ImagePullProgress { job_id: job_id.clone(), status: "pending".to_string(), progress_percent: 0, bytes_transferred: 0, total_bytes: 0, error: None });
    }

    let Some(controller_url) = agent.config.controller_base_url.clone() else {
        let mut jobs = agent.image_jobs.lock().await;
        jobs.insert(
            job_id.clone(),
            ImagePullProgress { job_id: job_id.clone(), status: "failed".to_string(), progress_percent: 0, bytes_transferred: 0, total_bytes: 0, error: Some("no controller URL configured".to_string()) },
        );
        return Json(ImagePullResponse { job_id, status: "failed".to_string() });
    };

    let agent2 = agent.clone();
    let image_id = req.image_id.clone();
    let reference = req.reference.clone();
    let job_id2 = job_id.clone();
    tokio::spawn(async move {
        run_pull_from_controller(agent2, job_id2, controller_url, image_id, reference).await;
    });

    Json(ImagePullResponse { job_id, status: "pending".to_string() })
}

async fn run_pull_from_controller(agent: Arc<Agent>, job_id: String, controller_url: String, image_id: String, reference: String) {
    let url = format!("{}/images/library/{}/stream", controller_url.trim_end_matches('/'), urlencoding::encode(&image_id));
    let response = match agent.http.get(&url).send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            fail_job(&agent, &job_id, format!("controller returned {}", r.status())).await;
            return;
        }
        Err(e) => {
            fail_job(&agent, &job_id, e.to_string()).await;
            return;
        }
    };
    let total_bytes = response.content_length().unwrap_or(0);
    let bytes = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            fail_job(&agent, &job_id, e.to_string()).await;
            return;
        }
    };
    {
        let mut jobs = agent.image_jobs.lock().await;
        jobs.insert(job_id.clone(), ImagePullProgress { job_id: job_id.clone(), status: "loading".to_string(), progress_percent: 90, bytes_transferred: bytes.len() as u64, total_bytes, error: None });
    }

    let tmp_path = std::env::temp_dir().join(format!("archetype-image-{}.tar", uuid::Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp_path, &bytes).await {
        fail_job(&agent, &job_id, e.to_string()).await;
        return;
    }
    let result = Command::new("docker").args(["load", "-i"]).arg(&tmp_path).output().await;
    let _ = tokio::fs::remove_file(&tmp_path).await;

    let mut jobs = agent.image_jobs.lock().await;
    match result {
        Ok(output) if output.status.success() => {
            jobs.insert(job_id.clone(), ImagePullProgress { job_id, status: "completed".to_string(), progress_percent: 100, bytes_transferred: bytes.len() as u64, total_bytes, error: None });
        }
        Ok(output) => {
            let err = String::from_utf8_lossy(&output.stderr).trim().to_string();
            jobs.insert(job_id.clone(), ImagePullProgress { job_id, status: "failed".to_string(), progress_percent: 0, bytes_transferred: bytes.len() as u64, total_bytes, error: Some(err) });
        }
        Err(e) => {
            jobs.insert(job_id.clone(), ImagePullProgress { job_id, status: "failed".to_string(), progress_percent: 0, bytes_transferred: bytes.len() as u64, total_bytes, error: Some(e.to_string()) });
        }
    }
    let _ = reference;
}

async fn fail_job(agent: &Agent, job_id: &str, error: String) {
    let mut jobs = agent.image_jobs.lock().await;
    jobs.insert(
        job_id.to_string(),
        ImagePullProgress { job_id: job_id.to_string(), status: "failed".to_string(), progress_percent: 0, bytes_transferred: 0, total_bytes: 0, error: Some(error) },
    );
}

async fn pull_progress(Extension(agent): Extension<Arc<Agent>>, Path(job_id): Path<String>) -> Json<Option<ImagePullProgress>> {
    let jobs = agent.image_jobs.lock().await;
    Json(jobs.get(&job_id).cloned())
}
