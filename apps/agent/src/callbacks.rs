use agent_types::{JobResult, JobStatus};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF_MS: u64 = 500;
const DEAD_LETTER_CAPACITY: usize = 200;

/// A callback that exhausted its retry budget, kept around for operator
/// inspection via the admin API rather than silently dropped.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetter {
    pub callback_url: String,
    pub job_id: String,
    pub last_error: String,
    pub attempts: u32,
    pub failed_at: chrono::DateTime<Utc>,
}

/// Delivers job results to controller-supplied callback URLs with
/// exponential backoff, and keeps a bounded in-memory dead-letter queue
/// for deliveries that never succeed.
#[derive(Clone)]
pub struct CallbackDispatcher {
    http: reqwest::Client,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl CallbackDispatcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            dead_letters: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Fire-and-forget delivery: spawns a background task so the caller
    /// (the orchestrator's async job path) never blocks on a slow or
    /// unreachable controller.
    pub fn deliver_in_background(&self, callback_url: String, result: JobResult) {
        let this = self.clone();
        tokio::spawn(async move {
            this.deliver(&callback_url, &result).await;
        });
    }

    pub async fn deliver(&self, callback_url: &str, result: &JobResult) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.post(callback_url).json(result).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%callback_url, job_id = %result.job_id, attempt, "callback delivered");
                    return;
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt >= MAX_ATTEMPTS {
                        self.dead_letter(callback_url, &result.job_id, format!("controller returned {status}"), attempt)
                            .await;
                        return;
                    }
                    warn!(%callback_url, job_id = %result.job_id, %status, attempt, "callback delivery rejected, retrying");
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        self.dead_letter(callback_url, &result.job_id, e.to_string(), attempt).await;
                        return;
                    }
                    warn!(%callback_url, job_id = %result.job_id, error = %e, attempt, "callback delivery failed, retrying");
                }
            }
            let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1).min(5));
            tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
        }
    }

    /// Sends a lightweight progress marker so a long-running async job
    /// doesn't look dead to the controller while it's still executing.
    pub async fn heartbeat(&self, callback_url: &str, job_id: &str) {
        let payload = JobResult {
            job_id: job_id.to_string(),
            status: JobStatus::Heartbeat,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        };
        // Heartbeats are best-effort: a dropped one isn't worth retrying,
        // the next interval tick will try again.
        let _ = self.http.post(callback_url).json(&payload).send().await;
    }

    async fn dead_letter(&self, callback_url: &str, job_id: &str, last_error: String, attempts: u32) {
        warn!(%callback_url, job_id, attempts, %last_error, "callback exhausted retries, moving to dead-letter queue");
        let mut dl = self.dead_letters.lock().await;
        if dl.len() >= DEAD_LETTER_CAPACITY {
            dl.pop_front();
        }
        dl.push_back(DeadLetter {
            callback_url: callback_url.to_string(),
            job_id: job_id.to_string(),
            last_error,
            attempts,
            failed_at: Utc::now(),
        });
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }
}

/// Periodically pings `callback_url` while `job` runs, cancelled as soon
/// as `job` resolves.
pub async fn with_heartbeat<F, T>(dispatcher: &CallbackDispatcher, callback_url: &str, job_id: &str, interval_secs: u64, job: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let cancel = tokio_util::sync::CancellationToken::new();
    let bg_cancel = cancel.clone();
    let bg = dispatcher.clone();
    let bg_url = callback_url.to_string();
    let bg_job_id = job_id.to_string();
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        tick.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = bg_cancel.cancelled() => break,
                _ = tick.tick() => bg.heartbeat(&bg_url, &bg_job_id).await,
            }
        }
    });
    let result = job.await;
    cancel.cancel();
    let _ = handle.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dead_letter_queue_records_exhausted_delivery() {
        let dispatcher = CallbackDispatcher::new(reqwest::Client::new());
        dispatcher.dead_letter("http://127.0.0.1:0/callback", "job-1", "boom".to_string(), MAX_ATTEMPTS).await;
        let letters = dispatcher.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, "job-1");
    }

    #[tokio::test]
    async fn dead_letter_queue_is_bounded() {
        let dispatcher = CallbackDispatcher::new(reqwest::Client::new());
        for i in 0..(DEAD_LETTER_CAPACITY + 10) {
            dispatcher
                .dead_letter("http://127.0.0.1:0/callback", &format!("job-{i}"), "boom".to_string(), MAX_ATTEMPTS)
                .await;
        }
        let letters = dispatcher.dead_letters().await;
        assert_eq!(letters.len(), DEAD_LETTER_CAPACITY);
        assert_eq!(letters[0].job_id, "job-10");
    }
}
