use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

fn lock_key(lab_id: &str) -> String {
    format!("archetype:agent-lock:{lab_id}")
}

/// A held distributed lock. Dropping it does not release the lock (the
/// release is fallible and needs the tokio runtime); callers must call
/// `release` explicitly, normally from a `defer`-style `Drop` guard is
/// avoided here in favor of explicit release in the orchestrator's
/// success and failure paths.
pub struct LockHandle {
    pub lab_id: String,
    pub token: String,
    cancel: CancellationToken,
}

impl LockHandle {
    /// Stops the background TTL-extend heartbeat for this lock. Must be
    /// called before `LockManager::release` so the heartbeat doesn't race
    /// a concurrent acquire by another agent.
    pub fn stop_heartbeat(&self) {
        self.cancel.cancel();
    }
}

/// Redis-backed mutual-exclusion lock per lab id, with a background
/// heartbeat that extends the TTL so a long-running deploy doesn't lose
/// the lock out from under it, and crash recovery that clears any locks
/// this agent instance held before a restart.
///
/// When no Redis URL is configured the manager runs in a no-op mode:
/// every acquire succeeds locally and no cross-agent exclusion is
/// enforced. That is a deliberate degraded mode for single-agent
/// deployments, not a bug.
#[derive(Clone)]
pub struct LockManager {
    agent_id: String,
    ttl_secs: u64,
    extend_interval_secs: u64,
    inner: Option<ConnectionManager>,
    local: Arc<Mutex<HashMap<String, String>>>,
}

impl LockManager {
    pub async fn connect(redis_url: Option<&str>, agent_id: &str, ttl_secs: u64, extend_interval_secs: u64) -> Result<Self> {
        let inner = match redis_url {
            Some(url) => {
                let client = redis::Client::open(url)?;
                match client.get_connection_manager().await {
                    Ok(mgr) => Some(mgr),
                    Err(e) => {
                        warn!(error = %e, "redis unreachable at startup, lock manager running in local-only mode");
                        None
                    }
                }
            }
            None => None,
        };
        Ok(Self {
            agent_id: agent_id.to_string(),
            ttl_secs,
            extend_interval_secs,
            inner,
            local: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.inner.is_some()
    }

    /// Acquires the per-lab lock and spawns a heartbeat task that refreshes
    /// its TTL every `extend_interval_secs` until `stop_heartbeat` is
    /// called. Returns `None` if another agent currently holds the lock.
    pub async fn acquire_with_heartbeat(&self, lab_id: &str) -> Result<Option<LockHandle>> {
        let Some(token) = self.try_acquire(lab_id).await? else {
            return Ok(None);
        };
        let cancel = CancellationToken::new();
        let bg_cancel = cancel.clone();
        let mgr = self.clone();
        let bg_lab = lab_id.to_string();
        let bg_token = token.clone();
        let interval = self.extend_interval_secs.max(1);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval));
            loop {
                tokio::select! {
                    _ = bg_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = mgr.extend(&bg_lab, &bg_token).await {
                            warn!(lab_id = %bg_lab, error = %e, "failed to extend lock TTL");
                        }
                    }
                }
            }
            debug!(lab_id = %bg_lab, "lock heartbeat stopped");
        });
        Ok(Some(LockHandle {
            lab_id: lab_id.to_string(),
            token,
            cancel,
        }))
    }

    async fn try_acquire(&self, lab_id: &str) -> Result<Option<String>> {
        let token = uuid::Uuid::new_v4().to_string();
        let Some(mgr) = self.inner.clone() else {
            let mut local = self.local.lock().await;
            if local.contains_key(lab_id) {
                return Ok(None);
            }
            local.insert(lab_id.to_string(), token.clone());
            return Ok(Some(token));
        };
        let mut conn = mgr;
        let key = lock_key(lab_id);
        let ok: bool = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .unwrap_or(false);
        if ok {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn extend(&self, lab_id: &str, token: &str) -> Result<()> {
        let Some(mgr) = self.inner.clone() else {
            return Ok(());
        };
        let mut conn = mgr;
        let key = lock_key(lab_id);
        let current: Option<String> = conn.get(&key).await?;
        if current.as_deref() == Some(token) {
            let _: () = conn.expire(&key, self.ttl_secs as i64).await?;
        }
        Ok(())
    }

    /// Releases the lock, compare-and-delete on the held token so a lock
    /// that was already stolen back by the owner after a TTL expiry is
    /// never released out from under them.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        handle.stop_heartbeat();
        let Some(mgr) = self.inner.clone() else {
            self.local.lock().await.remove(&handle.lab_id);
            return Ok(());
        };
        let mut conn = mgr;
        let key = lock_key(&handle.lab_id);
        let script = redis::Script::new(RELEASE_SCRIPT);
        let _: i64 = script.key(&key).arg(&handle.token).invoke_async(&mut conn).await?;
        Ok(())
    }

    /// Force-releases a lock regardless of token, used by the admin API
    /// to break a stuck lock left by a crashed agent.
    pub async fn force_release(&self, lab_id: &str) -> Result<bool> {
        let Some(mgr) = self.inner.clone() else {
            return Ok(self.local.lock().await.remove(lab_id).is_some());
        };
        let mut conn = mgr;
        let key = lock_key(lab_id);
        let deleted: i64 = conn.del(&key).await?;
        Ok(deleted > 0)
    }

    pub async fn get_all_locks(&self) -> Result<Vec<(String, String)>> {
        let Some(mgr) = self.inner.clone() else {
            let local = self.local.lock().await;
            return Ok(local.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        };
        let mut conn = mgr;
        let keys: Vec<String> = conn.keys("archetype:agent-lock:*").await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(Some(token)) = conn.get::<_, Option<String>>(&key).await {
                if let Some(lab_id) = key.strip_prefix("archetype:agent-lock:") {
                    out.push((lab_id.to_string(), token));
                }
            }
        }
        Ok(out)
    }

    /// Startup crash recovery: drops any lock this agent still appears to
    /// hold, on the assumption a previous process instance died without
    /// releasing them. Identifying "this agent's" locks is approximate
    /// (Redis stores an opaque token, not an agent id) so this only
    /// clears locks recorded in the agent's own on-disk state by the
    /// caller; the manager itself just exposes the primitive.
    pub async fn clear_agent_locks(&self, lab_ids: &[String]) -> Result<()> {
        for lab_id in lab_ids {
            if let Err(e) = self.force_release(lab_id).await {
                warn!(lab_id = %lab_id, agent_id = %self.agent_id, error = %e, "failed to clear lock during startup recovery");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_mode_acquire_is_mutually_exclusive() {
        let mgr = LockManager::connect(None, "agent-1", 30, 10).await.unwrap();
        let h1 = mgr.acquire_with_heartbeat("lab-1").await.unwrap();
        assert!(h1.is_some());
        let h2 = mgr.acquire_with_heartbeat("lab-1").await.unwrap();
        assert!(h2.is_none(), "second acquire of the same lab should fail while the first is held");
        mgr.release(&h1.unwrap()).await.unwrap();
        let h3 = mgr.acquire_with_heartbeat("lab-1").await.unwrap();
        assert!(h3.is_some(), "lock should be acquirable again after release");
    }

    #[tokio::test]
    async fn force_release_clears_local_lock() {
        let mgr = LockManager::connect(None, "agent-1", 30, 10).await.unwrap();
        let _h = mgr.acquire_with_heartbeat("lab-2").await.unwrap().unwrap();
        let cleared = mgr.force_release("lab-2").await.unwrap();
        assert!(cleared);
        let reacquired = mgr.acquire_with_heartbeat("lab-2").await.unwrap();
        assert!(reacquired.is_some());
    }
}
