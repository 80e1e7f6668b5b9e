use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// Startup configuration, assembled once from the environment and validated
/// before any component is constructed. Mirrors the env-driven style of the
/// agent's original minimal `AppState`, generalized into one typed struct so
/// no handler reaches for `std::env::var` directly.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_addr: String,
    pub agent_id: String,
    pub agent_name: String,
    pub workspace_root: PathBuf,
    pub shared_bridge: String,
    pub vlan_base: u16,
    pub vlan_max: u16,
    pub vni_base: u32,
    pub vni_max: u32,
    pub redis_url: Option<String>,
    pub controller_base_url: Option<String>,
    pub data_plane_ip: Option<String>,
    pub advertise_host: Option<String>,
    pub registration_token: Option<String>,
    pub registration_timeout_secs: u64,
    pub is_local: bool,
    pub max_concurrent_jobs: u32,
    pub enable_container_provider: bool,
    pub enable_vm_provider: bool,
    pub enable_ovs_plugin: bool,
    pub heartbeat_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_vxlan_orphan_window_secs: u64,
    pub lock_acquire_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub test_mode: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {v}")),
        Err(_) => Ok(default),
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            bind_addr: env_or("AGENT_BIND", "0.0.0.0:9090"),
            agent_id: env_or("AGENT_ID", &uuid::Uuid::new_v4().to_string()),
            agent_name: env_or("AGENT_NAME", &hostname_or_unknown()),
            workspace_root: PathBuf::from(env_or("AGENT_WORKSPACE_ROOT", "/var/lib/archetype/labs")),
            shared_bridge: env_or("AGENT_SHARED_BRIDGE", "archbr0"),
            vlan_base: env_num("AGENT_VLAN_BASE", 100u16).context("AGENT_VLAN_BASE")?,
            vlan_max: env_num("AGENT_VLAN_MAX", 4000u16).context("AGENT_VLAN_MAX")?,
            vni_base: env_num("AGENT_VNI_BASE", 10_000u32).context("AGENT_VNI_BASE")?,
            vni_max: env_num("AGENT_VNI_MAX", 16_000_000u32).context("AGENT_VNI_MAX")?,
            redis_url: std::env::var("AGENT_REDIS_URL").ok(),
            controller_base_url: std::env::var("AGENT_CONTROLLER_URL").ok(),
            data_plane_ip: std::env::var("AGENT_DATA_PLANE_IP").ok(),
            advertise_host: std::env::var("AGENT_ADVERTISE_HOST").ok(),
            registration_token: std::env::var("AGENT_REGISTRATION_TOKEN").ok(),
            registration_timeout_secs: env_num("AGENT_REGISTRATION_TIMEOUT_SECS", 10u64)
                .context("AGENT_REGISTRATION_TIMEOUT_SECS")?,
            is_local: env_bool("AGENT_IS_LOCAL", false),
            max_concurrent_jobs: env_num("AGENT_MAX_CONCURRENT_JOBS", 4u32)
                .context("AGENT_MAX_CONCURRENT_JOBS")?,
            enable_container_provider: env_bool("AGENT_ENABLE_CONTAINER_PROVIDER", true),
            enable_vm_provider: env_bool("AGENT_ENABLE_VM_PROVIDER", false),
            enable_ovs_plugin: env_bool("AGENT_ENABLE_OVS_PLUGIN", false),
            heartbeat_interval_secs: env_num("AGENT_HEARTBEAT_INTERVAL_SECS", 15u64)
                .context("AGENT_HEARTBEAT_INTERVAL_SECS")?,
            reconcile_interval_secs: env_num("AGENT_RECONCILE_INTERVAL_SECS", 300u64)
                .context("AGENT_RECONCILE_INTERVAL_SECS")?,
            reconcile_vxlan_orphan_window_secs: env_num(
                "AGENT_RECONCILE_VXLAN_ORPHAN_WINDOW_SECS",
                900u64,
            )
            .context("AGENT_RECONCILE_VXLAN_ORPHAN_WINDOW_SECS")?,
            lock_acquire_timeout_secs: env_num("AGENT_LOCK_ACQUIRE_TIMEOUT_SECS", 30u64)
                .context("AGENT_LOCK_ACQUIRE_TIMEOUT_SECS")?,
            lock_ttl_secs: env_num("AGENT_LOCK_TTL_SECS", 30u64).context("AGENT_LOCK_TTL_SECS")?,
            test_mode: env_bool("AGENT_TEST_MODE", false),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.vlan_base >= self.vlan_max {
            bail!(
                "AGENT_VLAN_BASE ({}) must be < AGENT_VLAN_MAX ({})",
                self.vlan_base,
                self.vlan_max
            );
        }
        if self.vni_base >= self.vni_max {
            bail!(
                "AGENT_VNI_BASE ({}) must be < AGENT_VNI_MAX ({})",
                self.vni_base,
                self.vni_max
            );
        }
        if self.max_concurrent_jobs == 0 {
            bail!("AGENT_MAX_CONCURRENT_JOBS must be > 0");
        }
        if !self.enable_container_provider && !self.enable_vm_provider {
            bail!("at least one of AGENT_ENABLE_CONTAINER_PROVIDER / AGENT_ENABLE_VM_PROVIDER must be set");
        }
        if self.lock_ttl_secs == 0 {
            bail!("AGENT_LOCK_TTL_SECS must be > 0");
        }
        Ok(())
    }

    /// Cadence for the lock heartbeat extender: comfortably inside the TTL.
    pub fn lock_extend_interval_secs(&self) -> u64 {
        (self.lock_ttl_secs / 3).max(1)
    }
}

fn hostname_or_unknown() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

mod hostname {
    use std::ffi::OsString;
    use std::io;

    pub fn get() -> io::Result<OsString> {
        let mut buf = vec![0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        buf.truncate(len);
        Ok(OsString::from(String::from_utf8_lossy(&buf).into_owned()))
    }
}
