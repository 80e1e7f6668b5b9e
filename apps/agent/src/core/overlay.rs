use super::net::{link_show_name, run_cmd, run_cmd_ignore};
use super::vlan_alloc::VniAllocator;
use agent_types::{OverlayStatusResponse, TunnelInfo, VtepInfo};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Vtep {
    device_name: String,
    remote_ip: String,
    refcount: u32,
}

#[derive(Default)]
struct OverlayState {
    vteps: HashMap<String, Vtep>,
    vni_alloc: Option<VniAllocator>,
    link_vnis: HashMap<String, u32>,
}

/// Manages the VXLAN overlay that connects this agent's shared bridge to
/// its peers: one access-mode VXLAN port per cross-host link, keyed by
/// VNI and tagged with the link's local VLAN, plus an optional legacy
/// trunk VTEP for peers that predate per-link VNIs.
pub struct OverlayEngine {
    bridge: String,
    vni_base: u32,
    vni_max: u32,
    test_mode: bool,
    legacy_trunk_enabled: bool,
    state: Mutex<OverlayState>,
}

impl OverlayEngine {
    pub fn new(bridge: impl Into<String>, vni_base: u32, vni_max: u32, test_mode: bool, legacy_trunk_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            bridge: bridge.into(),
            vni_base,
            vni_max,
            test_mode,
            legacy_trunk_enabled,
            state: Mutex::new(OverlayState {
                vni_alloc: Some(VniAllocator::new(vni_base, vni_max)),
                ..Default::default()
            }),
        })
    }

    /// Scans the bridge for VXLAN interfaces already present and seeds the
    /// VNI allocator and link table from them, so an agent restart doesn't
    /// reassign a VNI still carrying live traffic.
    pub async fn recover(&self) -> Result<()> {
        if self.test_mode {
            return Ok(());
        }
        let out = Command::new("sudo")
            .args(["-n", "ovs-vsctl", "--format=json", "--columns=name,options", "find", "Interface", "type=vxlan"])
            .output()
            .await
            .context("ovs-vsctl find Interface type=vxlan")?;
        if !out.status.success() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        if let Some(rows) = parsed.get("data").and_then(|d| d.as_array()) {
            for row in rows {
                let Some(cells) = row.as_array() else { continue };
                let name = cells.first().and_then(|v| v.as_str()).unwrap_or_default().to_string();
                if let Some(vni) = options_key_u32(cells.get(1), "key") {
                    state.vni_alloc.get_or_insert_with(|| VniAllocator::new(self.vni_base, self.vni_max)).reserve(vni);
                    state.link_vnis.insert(name.clone(), vni);
                }
            }
        }
        info!(vxlan_ports = state.link_vnis.len(), "recovered overlay state from OVS scan");
        Ok(())
    }

    /// Idempotently ensures a trunk-mode VTEP to `remote_ip` exists,
    /// refcounting it by link so the last detach tears the VTEP down.
    /// This is the legacy path used only when the peer agent predates
    /// per-link access VXLAN ports.
    pub async fn ensure_vtep(&self, remote_ip: &str, local_ip: &str, vni: u32) -> Result<VtepInfo> {
        if !self.legacy_trunk_enabled {
            anyhow::bail!("legacy trunk VTEP path is disabled for this agent");
        }
        let device_name = format!("vtep-{}", short_hash(remote_ip));
        let mut state = self.state.lock().await;
        if let Some(existing) = state.vteps.get_mut(remote_ip) {
            existing.refcount += 1;
            return Ok(VtepInfo {
                device_name: existing.device_name.clone(),
                remote_ip: existing.remote_ip.clone(),
                refcount: existing.refcount,
            });
        }
        if !self.test_mode {
            run_cmd(
                "ovs-vsctl",
                &[
                    "--",
                    "add-port",
                    &self.bridge,
                    &device_name,
                    "--",
                    "set",
                    "Interface",
                    &device_name,
                    "type=vxlan",
                    &format!("options:remote_ip={remote_ip}"),
                    &format!("options:local_ip={local_ip}"),
                    &format!("options:key={vni}"),
                ],
            )
            .await?;
        }
        let vtep = Vtep {
            device_name: device_name.clone(),
            remote_ip: remote_ip.to_string(),
            refcount: 1,
        };
        state.vteps.insert(remote_ip.to_string(), vtep);
        Ok(VtepInfo {
            device_name,
            remote_ip: remote_ip.to_string(),
            refcount: 1,
        })
    }

    /// Attaches a per-link access-mode VXLAN port: tagged with the local
    /// endpoint's VLAN, keyed by `vni`, pointed at the peer's data-plane
    /// address. The VNI is assigned by the controller and must be identical
    /// on both sides of the link, so it is always taken from the caller
    /// rather than allocated locally — a per-host allocator would hand out
    /// different VNIs to each side of the same link. This is the default
    /// path (one port per cross-host link, no shared trunk).
    pub async fn attach_link(&self, link_id: &str, local_vlan: u16, vni: u32, remote_ip: &str, local_ip: &str) -> Result<TunnelInfo> {
        let mut state = self.state.lock().await;
        if let Some(existing_vni) = state.link_vnis.get(link_id).copied() {
            let device_name = format!("vx-{}", short_hash(link_id));
            return Ok(TunnelInfo {
                link_id: link_id.to_string(),
                device_name,
                vni: existing_vni,
                remote_ip: remote_ip.to_string(),
                local_vlan,
            });
        }
        if let Some(alloc) = state.vni_alloc.as_mut() {
            alloc.reserve(vni);
        }
        let device_name = format!("vx-{}", short_hash(link_id));
        if !self.test_mode {
            run_cmd(
                "ovs-vsctl",
                &[
                    "--",
                    "add-port",
                    &self.bridge,
                    &device_name,
                    &format!("tag={local_vlan}"),
                    "--",
                    "set",
                    "Interface",
                    &device_name,
                    "type=vxlan",
                    &format!("options:remote_ip={remote_ip}"),
                    &format!("options:local_ip={local_ip}"),
                    &format!("options:key={vni}"),
                ],
            )
            .await?;
        }
        state.link_vnis.insert(link_id.to_string(), vni);
        Ok(TunnelInfo {
            link_id: link_id.to_string(),
            device_name,
            vni,
            remote_ip: remote_ip.to_string(),
            local_vlan,
        })
    }

    pub async fn detach_link(&self, link_id: &str) -> Result<()> {
        let vni = {
            let mut state = self.state.lock().await;
            state.link_vnis.remove(link_id)
        };
        let device_name = format!("vx-{}", short_hash(link_id));
        if !self.test_mode {
            run_cmd_ignore("ovs-vsctl", &["del-port", &self.bridge, &device_name]).await;
        }
        if let Some(vni) = vni {
            let mut state = self.state.lock().await;
            if let Some(alloc) = state.vni_alloc.as_mut() {
                alloc.free(vni);
            }
        }
        Ok(())
    }

    /// Probes the effective path MTU to a remote VTEP by sending
    /// decreasing-size ICMP echoes with the don't-fragment bit set,
    /// binary-searching down from `starting_mtu` until one gets through.
    pub async fn discover_mtu(&self, remote_ip: &str, starting_mtu: u32) -> Result<u32> {
        if self.test_mode {
            return Ok(starting_mtu.saturating_sub(50));
        }
        let mut lo: u32 = 576;
        let mut hi: u32 = starting_mtu;
        let mut best = lo;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let payload = mid.saturating_sub(28);
            let ok = probe_df(remote_ip, payload).await;
            if ok {
                best = mid;
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }
        Ok(best)
    }

    /// Deletes kernel VXLAN interfaces matching this engine's naming
    /// conventions (`vx-...` per-link ports, `vtep-...` legacy trunk VTEPs)
    /// that have no bridge master at all, i.e. debris from a crashed
    /// `ovs-vsctl add-port` that got as far as creating the interface.
    /// Distinct from the tracked-tunnel orphan sweep in `cleanup`, which
    /// operates on ports this engine still has a master/bridge for but no
    /// longer has a lab reference to.
    pub async fn gc_orphan_vxlan_interfaces(&self) -> Result<u32> {
        if self.test_mode {
            return Ok(0);
        }
        let out = Command::new("sudo")
            .args(["-n", "ip", "-o", "link", "show", "type", "vxlan"])
            .output()
            .await
            .context("ip link show type vxlan")?;
        if !out.status.success() {
            return Ok(0);
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let mut removed = 0u32;
        for line in text.lines() {
            let Some(name) = link_show_name(line) else { continue };
            if !(name.starts_with("vx-") || name.starts_with("vtep-")) {
                continue;
            }
            let master_check = Command::new("sudo").args(["-n", "ip", "-o", "link", "show", "dev", &name]).output().await;
            let has_master = master_check.map(|o| String::from_utf8_lossy(&o.stdout).contains("master")).unwrap_or(true);
            if has_master {
                continue;
            }
            run_cmd_ignore("ip", &["link", "delete", &name]).await;
            removed += 1;
            info!(interface = %name, "deleted orphaned VXLAN interface with no bridge master");
        }
        Ok(removed)
    }

    pub async fn cleanup(&self, link_ids: &[String]) -> Result<()> {
        for link_id in link_ids {
            self.detach_link(link_id).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<OverlayStatusResponse> {
        let state = self.state.lock().await;
        let tunnels = state
            .link_vnis
            .iter()
            .map(|(link_id, vni)| TunnelInfo {
                link_id: link_id.clone(),
                device_name: format!("vx-{}", short_hash(link_id)),
                vni: *vni,
                remote_ip: String::new(),
                local_vlan: 0,
            })
            .collect();
        let vteps = state
            .vteps
            .values()
            .map(|v| VtepInfo {
                device_name: v.device_name.clone(),
                remote_ip: v.remote_ip.clone(),
                refcount: v.refcount,
            })
            .collect();
        Ok(OverlayStatusResponse { tunnels, vteps })
    }
}

async fn probe_df(remote_ip: &str, payload_size: u32) -> bool {
    let size_arg = payload_size.to_string();
    let output = Command::new("ping")
        .args(["-M", "do", "-c", "1", "-W", "1", "-s", &size_arg, remote_ip])
        .output()
        .await;
    match output {
        Ok(o) => o.status.success(),
        Err(e) => {
            debug!(error = %e, "ping probe failed to execute");
            false
        }
    }
}

fn options_key_u32(options: Option<&serde_json::Value>, key: &str) -> Option<u32> {
    let arr = options?.as_array()?;
    if arr.first().and_then(|t| t.as_str()) != Some("map") {
        return None;
    }
    let pairs = arr.get(1)?.as_array()?;
    for pair in pairs {
        let pair = pair.as_array()?;
        if pair.first()?.as_str()? == key {
            return pair.get(1)?.as_str()?.parse().ok();
        }
    }
    None
}

fn short_hash(s: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    format!("{:x}", hasher.finish())[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<OverlayEngine> {
        OverlayEngine::new("archbr0", 10_000, 16_000_000, true, true)
    }

    #[tokio::test]
    async fn attach_link_is_idempotent_per_link() {
        let engine = engine();
        let t1 = engine.attach_link("link-1", 105, 10_500, "10.0.0.2", "10.0.0.1").await.unwrap();
        let t2 = engine.attach_link("link-1", 105, 10_500, "10.0.0.2", "10.0.0.1").await.unwrap();
        assert_eq!(t1.vni, t2.vni);
    }

    #[tokio::test]
    async fn attach_link_uses_caller_supplied_vni_not_a_local_allocation() {
        // Two hosts attaching the same cross-host link must land on the same
        // VNI; the engine must never substitute its own allocation for it.
        let engine = engine();
        let tunnel = engine.attach_link("link-1", 105, 123_456, "10.0.0.2", "10.0.0.1").await.unwrap();
        assert_eq!(tunnel.vni, 123_456);
    }

    #[tokio::test]
    async fn detach_link_allows_vni_reuse_by_a_new_link() {
        let engine = engine();
        engine.attach_link("link-1", 105, 10_500, "10.0.0.2", "10.0.0.1").await.unwrap();
        engine.detach_link("link-1").await.unwrap();
        let t2 = engine.attach_link("link-2", 106, 10_500, "10.0.0.3", "10.0.0.1").await.unwrap();
        assert_eq!(t2.vni, 10_500, "a VNI freed by detach should be assignable to a different link");
    }

    #[tokio::test]
    async fn ensure_vtep_refcounts_shared_peer() {
        let engine = engine();
        let v1 = engine.ensure_vtep("10.0.0.2", "10.0.0.1", 10_000).await.unwrap();
        assert_eq!(v1.refcount, 1);
        let v2 = engine.ensure_vtep("10.0.0.2", "10.0.0.1", 10_000).await.unwrap();
        assert_eq!(v2.refcount, 2);
    }

    #[tokio::test]
    async fn discover_mtu_in_test_mode_returns_reduced_value() {
        let engine = engine();
        let mtu = engine.discover_mtu("10.0.0.2", 1500).await.unwrap();
        assert_eq!(mtu, 1450);
    }
}
