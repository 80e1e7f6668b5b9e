use super::vlan_alloc::VlanAllocator;
use agent_types::{ExternalConnectionInfo, OvsPortInfo, OvsStatusResponse};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One endpoint wired into the shared bridge: a veth pair whose container
/// side lives inside the node's network namespace and whose host side is
/// an OVS port carrying the endpoint's current VLAN tag.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub lab_id: String,
    pub node_name: String,
    pub iface_name: String,
    pub host_veth: String,
    pub vlan_tag: u16,
    pub isolated: bool,
}

#[derive(Default)]
struct OvsState {
    vlan_alloc: HashMap<String, VlanAllocator>,
    endpoints: HashMap<(String, String, String), EndpointRecord>,
    externals: HashMap<String, ExternalConnectionInfo>,
}

/// Wraps the shared OVS bridge: veth provisioning, VLAN tag wiring between
/// two endpoints to realize a point-to-point link, port isolation, and
/// patch/external attachment to the outside world. All mutating bridge
/// operations shell out to `ovs-vsctl`/`ip` under `sudo -n`, matching the
/// rest of the agent's provisioning code; `test_mode` short-circuits every
/// one of them so unit tests can exercise the bookkeeping without a real
/// OVS instance present.
pub struct OvsEngine {
    bridge: String,
    vlan_base: u16,
    vlan_max: u16,
    test_mode: bool,
    state: Mutex<OvsState>,
}

impl OvsEngine {
    pub fn new(bridge: impl Into<String>, vlan_base: u16, vlan_max: u16, test_mode: bool) -> Arc<Self> {
        Arc::new(Self {
            bridge: bridge.into(),
            vlan_base,
            vlan_max,
            test_mode,
            state: Mutex::new(OvsState::default()),
        })
    }

    pub async fn ensure_bridge(&self) -> Result<()> {
        if self.test_mode {
            debug!(bridge = %self.bridge, "test mode: skipping bridge creation");
            return Ok(());
        }
        let exists = run_cmd_status("ovs-vsctl", &["br-exists", &self.bridge]).await?;
        if !exists {
            run_cmd("ovs-vsctl", &["add-br", &self.bridge]).await?;
            run_cmd("ip", &["link", "set", &self.bridge, "up"]).await?;
            info!(bridge = %self.bridge, "created shared integration bridge");
        }
        Ok(())
    }

    /// Scans the bridge for ports tagged with this agent's external-ids and
    /// rebuilds the in-memory VLAN allocators and endpoint table. Run once
    /// at startup so a restarted agent doesn't reuse a VLAN tag that is
    /// still wired to a live container.
    pub async fn recover(&self) -> Result<()> {
        if self.test_mode {
            return Ok(());
        }
        let out = Command::new("sudo")
            .args(["-n", "ovs-vsctl", "--format=json", "--columns=name,tag,external_ids", "list", "Port"])
            .output()
            .await
            .context("ovs-vsctl list Port")?;
        if !out.status.success() {
            warn!("ovs-vsctl list Port failed during recovery, starting with an empty endpoint table");
            return Ok(());
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let parsed: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        let mut state = self.state.lock().await;
        if let Some(rows) = parsed.get("data").and_then(|d| d.as_array()) {
            for row in rows {
                let Some(cells) = row.as_array() else { continue };
                let name = cells.first().and_then(|v| v.as_str()).unwrap_or_default();
                let tag = cells.get(1).and_then(tag_from_ovsjson);
                let ids = cells.get(2).and_then(ext_ids_from_ovsjson);
                let Some(tag) = tag else { continue };
                let Some(ids) = ids else { continue };
                let (Some(lab_id), Some(node_name), Some(iface_name)) = (
                    ids.get("archetype.lab_id").cloned(),
                    ids.get("archetype.node_name").cloned(),
                    ids.get("archetype.iface_name").cloned(),
                ) else {
                    continue;
                };
                state
                    .vlan_alloc
                    .entry(lab_id.clone())
                    .and_modify(|a| *a = VlanAllocator::recover_from(self.vlan_base, self.vlan_max, [tag]))
                    .or_insert_with(|| VlanAllocator::recover_from(self.vlan_base, self.vlan_max, [tag]));
                state.endpoints.insert(
                    (lab_id.clone(), node_name.clone(), iface_name.clone()),
                    EndpointRecord {
                        lab_id,
                        node_name,
                        iface_name,
                        host_veth: name.to_string(),
                        vlan_tag: tag,
                        isolated: false,
                    },
                );
            }
        }
        info!(endpoints = state.endpoints.len(), "recovered OVS endpoint state");
        Ok(())
    }

    fn veth_name(&self, lab_id: &str, node_name: &str, iface_name: &str) -> String {
        // OVS/kernel interface names are capped at 15 bytes; hash the
        // identity tuple down to a short, collision-resistant suffix.
        format!("arv{}", short_hash(&format!("{lab_id}:{node_name}:{iface_name}")))
    }

    /// Creates a veth pair and attaches its host side to the shared bridge
    /// carrying a freshly allocated VLAN tag, tagging the OVS port with the
    /// endpoint's identity so `recover` can rebuild state after a restart.
    pub async fn attach_endpoint(&self, lab_id: &str, node_name: &str, iface_name: &str, netns: &str, container_ifname: &str) -> Result<EndpointRecord> {
        let key = (lab_id.to_string(), node_name.to_string(), iface_name.to_string());
        {
            let state = self.state.lock().await;
            if let Some(existing) = state.endpoints.get(&key) {
                return Ok(existing.clone());
            }
        }
        let host_veth = self.veth_name(lab_id, node_name, iface_name);
        let peer = format!("{host_veth}p");

        let tag = {
            let mut state = self.state.lock().await;
            let alloc = state
                .vlan_alloc
                .entry(lab_id.to_string())
                .or_insert_with(|| VlanAllocator::new(self.vlan_base, self.vlan_max));
            alloc.alloc().context("VLAN tag space exhausted for lab")?
        };

        if self.test_mode {
            debug!(%host_veth, "test mode: skipping veth creation");
        } else {
            run_cmd("ip", &["link", "add", &host_veth, "type", "veth", "peer", "name", &peer]).await?;
            run_cmd("ip", &["link", "set", &host_veth, "up"]).await?;
            run_cmd("ip", &["link", "set", &peer, "netns", netns]).await?;
            run_cmd_in_netns(netns, &["ip", "link", "set", &peer, "name", container_ifname]).await?;
            run_cmd_in_netns(netns, &["ip", "link", "set", container_ifname, "up"]).await?;
            run_cmd(
                "ovs-vsctl",
                &[
                    "--",
                    "add-port",
                    &self.bridge,
                    &host_veth,
                    "--",
                    "set",
                    "Port",
                    &host_veth,
                    &format!("tag={tag}"),
                    &format!("external-ids:archetype.lab_id={lab_id}"),
                    &format!("external-ids:archetype.node_name={node_name}"),
                    &format!("external-ids:archetype.iface_name={iface_name}"),
                ],
            )
            .await?;
        }

        let record = EndpointRecord {
            lab_id: lab_id.to_string(),
            node_name: node_name.to_string(),
            iface_name: iface_name.to_string(),
            host_veth,
            vlan_tag: tag,
            isolated: false,
        };
        self.state.lock().await.endpoints.insert(key, record.clone());
        Ok(record)
    }

    /// Allocates `count` fresh VLAN tags from the lab's allocator without
    /// wiring any port, for providers (VMs) that bake the tag straight into
    /// their own interface definitions instead of going through
    /// `attach_endpoint`. Draws from the same per-lab allocator as
    /// container endpoints so a lab never double-assigns a tag across
    /// providers.
    pub async fn alloc_vlan_tags(&self, lab_id: &str, count: u32) -> Result<Vec<u16>> {
        let mut state = self.state.lock().await;
        let alloc = state.vlan_alloc.entry(lab_id.to_string()).or_insert_with(|| VlanAllocator::new(self.vlan_base, self.vlan_max));
        (0..count).map(|_| alloc.alloc().context("VLAN tag space exhausted for lab")).collect()
    }

    /// Wires two already-attached endpoints together by giving both host
    /// ports the same VLAN tag, in a single `ovs-vsctl` transaction so the
    /// link never observably exists half-connected.
    pub async fn hot_connect(&self, a: &EndpointRecord, b: &EndpointRecord) -> Result<u16> {
        let tag = {
            let mut state = self.state.lock().await;
            let alloc = state
                .vlan_alloc
                .entry(a.lab_id.clone())
                .or_insert_with(|| VlanAllocator::new(self.vlan_base, self.vlan_max));
            alloc.alloc().context("VLAN tag space exhausted for lab")?
        };
        if !self.test_mode {
            run_cmd(
                "ovs-vsctl",
                &[
                    "--",
                    "set",
                    "Port",
                    &a.host_veth,
                    &format!("tag={tag}"),
                    "--",
                    "set",
                    "Port",
                    &b.host_veth,
                    &format!("tag={tag}"),
                ],
            )
            .await?;
        }
        self.update_tag(&a.lab_id, &a.node_name, &a.iface_name, tag, false).await;
        self.update_tag(&b.lab_id, &b.node_name, &b.iface_name, tag, false).await;
        Ok(tag)
    }

    /// Strands both endpoints of a link onto fresh, pairwise-distinct
    /// isolation tags so neither can reach the other or anything else on
    /// the bridge, without tearing down the veths themselves.
    pub async fn hot_disconnect(&self, a: &EndpointRecord, b: &EndpointRecord) -> Result<()> {
        let (tag_a, tag_b) = {
            let mut state = self.state.lock().await;
            let alloc = state
                .vlan_alloc
                .entry(a.lab_id.clone())
                .or_insert_with(|| VlanAllocator::new(self.vlan_base, self.vlan_max));
            let ta = alloc.alloc_isolation().context("VLAN tag space exhausted for lab")?;
            let tb = alloc.alloc_isolation().context("VLAN tag space exhausted for lab")?;
            (ta, tb)
        };
        if !self.test_mode {
            run_cmd(
                "ovs-vsctl",
                &[
                    "--",
                    "set",
                    "Port",
                    &a.host_veth,
                    &format!("tag={tag_a}"),
                    "--",
                    "set",
                    "Port",
                    &b.host_veth,
                    &format!("tag={tag_b}"),
                ],
            )
            .await?;
        }
        self.update_tag(&a.lab_id, &a.node_name, &a.iface_name, tag_a, true).await;
        self.update_tag(&b.lab_id, &b.node_name, &b.iface_name, tag_b, true).await;
        Ok(())
    }

    async fn update_tag(&self, lab_id: &str, node_name: &str, iface_name: &str, tag: u16, isolated: bool) {
        let mut state = self.state.lock().await;
        let key = (lab_id.to_string(), node_name.to_string(), iface_name.to_string());
        if let Some(rec) = state.endpoints.get_mut(&key) {
            rec.vlan_tag = tag;
            rec.isolated = isolated;
        }
    }

    pub async fn isolate_endpoint(&self, lab_id: &str, node_name: &str, iface_name: &str) -> Result<u16> {
        let tag = {
            let mut state = self.state.lock().await;
            let alloc = state
                .vlan_alloc
                .entry(lab_id.to_string())
                .or_insert_with(|| VlanAllocator::new(self.vlan_base, self.vlan_max));
            alloc.alloc_isolation().context("VLAN tag space exhausted for lab")?
        };
        let host_veth = self.host_veth_for(lab_id, node_name, iface_name).await?;
        if !self.test_mode {
            run_cmd("ovs-vsctl", &["set", "Port", &host_veth, &format!("tag={tag}")]).await?;
        }
        self.update_tag(lab_id, node_name, iface_name, tag, true).await;
        Ok(tag)
    }

    pub async fn restore_endpoint(&self, lab_id: &str, node_name: &str, iface_name: &str, target_tag: u16) -> Result<()> {
        let host_veth = self.host_veth_for(lab_id, node_name, iface_name).await?;
        if !self.test_mode {
            run_cmd("ovs-vsctl", &["set", "Port", &host_veth, &format!("tag={target_tag}")]).await?;
        }
        self.update_tag(lab_id, node_name, iface_name, target_tag, false).await;
        Ok(())
    }

    pub async fn set_carrier(&self, lab_id: &str, node_name: &str, iface_name: &str, up: bool) -> Result<()> {
        let host_veth = self.host_veth_for(lab_id, node_name, iface_name).await?;
        let state_flag = if up { "up" } else { "down" };
        if !self.test_mode {
            run_cmd("ip", &["link", "set", &host_veth, state_flag]).await?;
        }
        Ok(())
    }

    async fn host_veth_for(&self, lab_id: &str, node_name: &str, iface_name: &str) -> Result<String> {
        let state = self.state.lock().await;
        let key = (lab_id.to_string(), node_name.to_string(), iface_name.to_string());
        state
            .endpoints
            .get(&key)
            .map(|e| e.host_veth.clone())
            .with_context(|| format!("no tracked endpoint for {lab_id}/{node_name}/{iface_name}"))
    }

    pub async fn external_attach(&self, lab_id: &str, physical_iface: &str, vlan_tag: Option<u16>) -> Result<String> {
        let port_name = format!("ext-{}", short_hash(&format!("{lab_id}:{physical_iface}")));
        if !self.test_mode {
            let mut args = vec!["add-port", &self.bridge, physical_iface];
            let tag_arg;
            if let Some(tag) = vlan_tag {
                tag_arg = format!("tag={tag}");
                args.push("--");
                args.push("set");
                args.push("Port");
                args.push(physical_iface);
                args.push(&tag_arg);
            }
            run_cmd("ovs-vsctl", &args).await?;
        }
        let mut state = self.state.lock().await;
        state.externals.insert(
            physical_iface.to_string(),
            ExternalConnectionInfo {
                external_interface: physical_iface.to_string(),
                vlan_tag,
                connected_ports: vec![port_name.clone()],
                lab_id: Some(lab_id.to_string()),
            },
        );
        Ok(port_name)
    }

    pub async fn external_detach(&self, physical_iface: &str) -> Result<()> {
        if !self.test_mode {
            run_cmd_ignore("ovs-vsctl", &["del-port", &self.bridge, physical_iface]).await;
        }
        self.state.lock().await.externals.remove(physical_iface);
        Ok(())
    }

    pub async fn list_external_connections(&self) -> Result<Vec<ExternalConnectionInfo>> {
        Ok(self.state.lock().await.externals.values().cloned().collect())
    }

    pub async fn patch_to_bridge(&self, peer_bridge: &str) -> Result<(String, String)> {
        let p1 = format!("patch-{}-to-{}", short_hash(&self.bridge), short_hash(peer_bridge));
        let p2 = format!("patch-{}-to-{}", short_hash(peer_bridge), short_hash(&self.bridge));
        if !self.test_mode {
            run_cmd(
                "ovs-vsctl",
                &[
                    "--",
                    "add-port",
                    &self.bridge,
                    &p1,
                    "--",
                    "set",
                    "Interface",
                    &p1,
                    "type=patch",
                    &format!("options:peer={p2}"),
                    "--",
                    "add-port",
                    peer_bridge,
                    &p2,
                    "--",
                    "set",
                    "Interface",
                    &p2,
                    "type=patch",
                    &format!("options:peer={p1}"),
                ],
            )
            .await?;
        }
        Ok((p1, p2))
    }

    pub async fn delete_patch_to_bridge(&self, peer_bridge: &str) -> Result<()> {
        let p1 = format!("patch-{}-to-{}", short_hash(&self.bridge), short_hash(peer_bridge));
        let p2 = format!("patch-{}-to-{}", short_hash(peer_bridge), short_hash(&self.bridge));
        if !self.test_mode {
            run_cmd_ignore("ovs-vsctl", &["del-port", &self.bridge, &p1]).await;
            run_cmd_ignore("ovs-vsctl", &["del-port", peer_bridge, &p2]).await;
        }
        Ok(())
    }

    pub async fn check_port_exists(&self, port: &str) -> Result<bool> {
        if self.test_mode {
            return Ok(false);
        }
        run_cmd_status("ovs-vsctl", &["port-to-br", port]).await
    }

    /// Called when the event listener observes a container restart: the
    /// veth that used to sit in its namespace is gone, so every endpoint
    /// tracked for that node is torn down and rewired from scratch at the
    /// same VLAN tags they previously held.
    pub async fn handle_container_restart(&self, lab_id: &str, node_name: &str, netns: &str, iface_map: &[(String, String)]) -> Result<()> {
        let existing: Vec<EndpointRecord> = {
            let state = self.state.lock().await;
            state
                .endpoints
                .values()
                .filter(|e| e.lab_id == lab_id && e.node_name == node_name)
                .cloned()
                .collect()
        };
        for rec in existing {
            if !self.test_mode {
                run_cmd_ignore("ip", &["link", "delete", &rec.host_veth]).await;
            }
            let container_ifname = iface_map
                .iter()
                .find(|(vendor_if, _)| vendor_if == &rec.iface_name)
                .map(|(_, kernel)| kernel.clone())
                .unwrap_or_else(|| rec.iface_name.clone());
            let peer = format!("{}p", rec.host_veth);
            if !self.test_mode {
                run_cmd("ip", &["link", "add", &rec.host_veth, "type", "veth", "peer", "name", &peer]).await?;
                run_cmd("ip", &["link", "set", &rec.host_veth, "up"]).await?;
                run_cmd("ip", &["link", "set", &peer, "netns", netns]).await?;
                run_cmd_in_netns(netns, &["ip", "link", "set", &peer, "name", &container_ifname]).await?;
                run_cmd_in_netns(netns, &["ip", "link", "set", &container_ifname, "up"]).await?;
                run_cmd(
                    "ovs-vsctl",
                    &["--", "add-port", &self.bridge, &rec.host_veth, "--", "set", "Port", &rec.host_veth, &format!("tag={}", rec.vlan_tag)],
                )
                .await?;
            }
            info!(lab_id, node_name, iface = %rec.iface_name, "re-wired endpoint after container restart");
        }
        Ok(())
    }

    pub async fn teardown_lab(&self, lab_id: &str) -> Result<()> {
        let endpoints: Vec<EndpointRecord> = {
            let mut state = self.state.lock().await;
            let keys: Vec<_> = state.endpoints.keys().filter(|k| k.0 == lab_id).cloned().collect();
            let mut out = Vec::new();
            for k in keys {
                if let Some(v) = state.endpoints.remove(&k) {
                    out.push(v);
                }
            }
            state.vlan_alloc.remove(lab_id);
            state.externals.retain(|_, e| e.lab_id.as_deref() != Some(lab_id));
            out
        };
        for rec in endpoints {
            if !self.test_mode {
                run_cmd_ignore("ovs-vsctl", &["del-port", &self.bridge, &rec.host_veth]).await;
                run_cmd_ignore("ip", &["link", "delete", &rec.host_veth]).await;
            }
        }
        Ok(())
    }

    /// Deletes kernel veth devices matching this agent's naming convention
    /// (`arv...`) that have neither a tracked endpoint record nor a live
    /// OVS master. A veth with no master that also isn't ours to track is
    /// debris from a crash between `ip link add` and the matching
    /// `ovs-vsctl add-port`, or from a container runtime that recreated a
    /// namespace without going through `handle_container_restart`.
    pub async fn gc_orphan_veths(&self) -> Result<u32> {
        if self.test_mode {
            return Ok(0);
        }
        let out = Command::new("sudo")
            .args(["-n", "ip", "-o", "link", "show", "type", "veth"])
            .output()
            .await
            .context("ip link show type veth")?;
        if !out.status.success() {
            return Ok(0);
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let tracked: std::collections::HashSet<String> =
            self.state.lock().await.endpoints.values().map(|e| e.host_veth.clone()).collect();

        let mut removed = 0u32;
        for line in text.lines() {
            let Some(name) = link_show_name(line) else { continue };
            if !name.starts_with("arv") || tracked.contains(&name) {
                continue;
            }
            let has_master = run_cmd_status("ovs-vsctl", &["port-to-br", &name]).await.unwrap_or(true);
            if has_master {
                continue;
            }
            run_cmd_ignore("ip", &["link", "delete", &name]).await;
            removed += 1;
            info!(veth = %name, "deleted orphaned veth with no tracked endpoint and no OVS master");
        }
        Ok(removed)
    }

    /// Deletes kernel bridges that look like ours (share the shared
    /// integration bridge's naming prefix) but aren't the one this agent
    /// currently manages, and carry no ports. This agent only ever creates
    /// one persistent shared bridge; any other one matching the prefix is
    /// leftover from an interrupted reconfiguration.
    pub async fn gc_orphan_bridges(&self) -> Result<u32> {
        if self.test_mode {
            return Ok(0);
        }
        let prefix: String = self.bridge.chars().take_while(|c| !c.is_ascii_digit()).collect();
        if prefix.is_empty() {
            return Ok(0);
        }
        let out = Command::new("sudo")
            .args(["-n", "ip", "-o", "link", "show", "type", "bridge"])
            .output()
            .await
            .context("ip link show type bridge")?;
        if !out.status.success() {
            return Ok(0);
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let mut removed = 0u32;
        for line in text.lines() {
            let Some(name) = link_show_name(line) else { continue };
            if name == self.bridge || !name.starts_with(&prefix) {
                continue;
            }
            let port_check = Command::new("sudo").args(["-n", "ip", "-o", "link", "show", "master", &name]).output().await;
            let has_ports = port_check.map(|o| !String::from_utf8_lossy(&o.stdout).trim().is_empty()).unwrap_or(true);
            if has_ports {
                continue;
            }
            run_cmd_ignore("ip", &["link", "delete", &name, "type", "bridge"]).await;
            removed += 1;
            info!(bridge = %name, "deleted orphaned bridge with no attached ports");
        }
        Ok(removed)
    }

    /// Compares tracked endpoints against the bridge's live port list:
    /// drops tracking for ports that no longer exist, deletes live ports
    /// matching our veth naming convention that this agent never recorded,
    /// and re-applies the tracked VLAN tag to any port whose live tag has
    /// drifted from it. Returns `(stale_tracking_removed, untracked_deleted,
    /// drift_corrected)`.
    pub async fn reconcile_live_ports(&self) -> Result<(u32, u32, u32)> {
        if self.test_mode {
            return Ok((0, 0, 0));
        }
        let out = Command::new("sudo")
            .args(["-n", "ovs-vsctl", "--format=json", "--columns=name,tag", "list", "Port"])
            .output()
            .await
            .context("ovs-vsctl list Port")?;
        if !out.status.success() {
            return Ok((0, 0, 0));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let parsed: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => return Ok((0, 0, 0)),
        };
        let mut live: HashMap<String, Option<u16>> = HashMap::new();
        if let Some(rows) = parsed.get("data").and_then(|d| d.as_array()) {
            for row in rows {
                let Some(cells) = row.as_array() else { continue };
                let name = cells.first().and_then(|v| v.as_str()).unwrap_or_default().to_string();
                if name.is_empty() {
                    continue;
                }
                let tag = cells.get(1).and_then(tag_from_ovsjson);
                live.insert(name, tag);
            }
        }

        let (stale_keys, drift, tracked_names) = {
            let state = self.state.lock().await;
            let stale_keys: Vec<(String, String, String)> = state
                .endpoints
                .iter()
                .filter(|(_, rec)| !live.contains_key(&rec.host_veth))
                .map(|(k, _)| k.clone())
                .collect();
            let drift: Vec<(String, u16)> = state
                .endpoints
                .values()
                .filter_map(|rec| match live.get(&rec.host_veth) {
                    Some(Some(live_tag)) if *live_tag != rec.vlan_tag => Some((rec.host_veth.clone(), rec.vlan_tag)),
                    _ => None,
                })
                .collect();
            let tracked_names: std::collections::HashSet<String> = state.endpoints.values().map(|e| e.host_veth.clone()).collect();
            (stale_keys, drift, tracked_names)
        };

        if !stale_keys.is_empty() {
            let mut state = self.state.lock().await;
            for k in &stale_keys {
                state.endpoints.remove(k);
            }
        }

        for (name, tracked_tag) in &drift {
            run_cmd_ignore("ovs-vsctl", &["set", "Port", name, &format!("tag={tracked_tag}")]).await;
            warn!(port = %name, tag = tracked_tag, "corrected VLAN tag drift on tracked port");
        }

        let mut untracked_deleted = 0u32;
        for name in live.keys() {
            if name.starts_with("arv") && !tracked_names.contains(name) {
                run_cmd_ignore("ovs-vsctl", &["del-port", &self.bridge, name]).await;
                run_cmd_ignore("ip", &["link", "delete", name]).await;
                untracked_deleted += 1;
                info!(port = %name, "deleted untracked veth port absent from the endpoint table");
            }
        }

        Ok((stale_keys.len() as u32, untracked_deleted, drift.len() as u32))
    }

    pub async fn status(&self) -> Result<OvsStatusResponse> {
        let state = self.state.lock().await;
        let ports = state
            .endpoints
            .values()
            .map(|e| OvsPortInfo {
                port_name: e.host_veth.clone(),
                lab_id: e.lab_id.clone(),
                node_name: e.node_name.clone(),
                iface_name: e.iface_name.clone(),
                vlan_tag: e.vlan_tag,
                isolated: e.isolated,
            })
            .collect();
        Ok(OvsStatusResponse {
            bridge: self.bridge.clone(),
            ports,
        })
    }
}

/// Pulls the interface name out of one line of `ip -o link show` output
/// (`"3: arvabcd1234@if4: <flags> ..."` or `"3: arvabcd1234: <flags> ..."`).
pub(super) fn link_show_name(line: &str) -> Option<String> {
    let field = line.split_whitespace().nth(1)?;
    let name = field.trim_end_matches(':').split('@').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn short_hash(s: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    format!("{:x}", hasher.finish())[..8].to_string()
}

fn tag_from_ovsjson(v: &serde_json::Value) -> Option<u16> {
    v.as_u64().map(|n| n as u16).or_else(|| {
        v.as_array()
            .and_then(|a| a.get(1))
            .and_then(|inner| inner.as_array())
            .and_then(|inner| inner.first())
            .and_then(|n| n.as_u64())
            .map(|n| n as u16)
    })
}

fn ext_ids_from_ovsjson(v: &serde_json::Value) -> Option<HashMap<String, String>> {
    let arr = v.as_array()?;
    if arr.first().and_then(|t| t.as_str()) != Some("map") {
        return None;
    }
    let pairs = arr.get(1)?.as_array()?;
    let mut out = HashMap::new();
    for pair in pairs {
        let pair = pair.as_array()?;
        let k = pair.first()?.as_str()?.to_string();
        let val = pair.get(1)?.as_str()?.to_string();
        out.insert(k, val);
    }
    Some(out)
}

pub(super) async fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    let mut full_args = vec!["-n", cmd];
    full_args.extend_from_slice(args);
    let output = Command::new("sudo").args(&full_args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("command `sudo {} {}` failed: {}", cmd, args.join(" "), stderr.trim());
    }
    Ok(())
}

pub(super) async fn run_cmd_ignore(cmd: &str, args: &[&str]) {
    let _ = run_cmd(cmd, args).await;
}

async fn run_cmd_status(cmd: &str, args: &[&str]) -> Result<bool> {
    let mut full_args = vec!["-n", cmd];
    full_args.extend_from_slice(args);
    let output = Command::new("sudo").args(&full_args).output().await?;
    Ok(output.status.success())
}

async fn run_cmd_in_netns(netns: &str, args: &[&str]) -> Result<()> {
    let mut full_args = vec!["-n", "ip", "netns", "exec", netns];
    full_args.extend_from_slice(args);
    let output = Command::new("sudo").args(&full_args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("command `sudo ip netns exec {} {}` failed: {}", netns, args.join(" "), stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<OvsEngine> {
        OvsEngine::new("archbr0", 100, 4000, true)
    }

    #[tokio::test]
    async fn attach_endpoint_is_idempotent() {
        let engine = engine();
        let r1 = engine.attach_endpoint("lab-1", "r1", "Ethernet1", "ns1", "eth1").await.unwrap();
        let r2 = engine.attach_endpoint("lab-1", "r1", "Ethernet1", "ns1", "eth1").await.unwrap();
        assert_eq!(r1.host_veth, r2.host_veth);
        assert_eq!(r1.vlan_tag, r2.vlan_tag);
    }

    #[tokio::test]
    async fn hot_connect_assigns_shared_tag() {
        let engine = engine();
        let a = engine.attach_endpoint("lab-1", "r1", "Ethernet1", "ns1", "eth1").await.unwrap();
        let b = engine.attach_endpoint("lab-1", "r2", "Ethernet1", "ns2", "eth1").await.unwrap();
        let tag = engine.hot_connect(&a, &b).await.unwrap();
        let status = engine.status().await.unwrap();
        let tags: Vec<u16> = status.ports.iter().map(|p| p.vlan_tag).collect();
        assert!(tags.iter().all(|t| *t == tag));
    }

    #[tokio::test]
    async fn hot_disconnect_gives_distinct_isolation_tags() {
        let engine = engine();
        let a = engine.attach_endpoint("lab-1", "r1", "Ethernet1", "ns1", "eth1").await.unwrap();
        let b = engine.attach_endpoint("lab-1", "r2", "Ethernet1", "ns2", "eth1").await.unwrap();
        engine.hot_connect(&a, &b).await.unwrap();
        engine.hot_disconnect(&a, &b).await.unwrap();
        let status = engine.status().await.unwrap();
        let tags: Vec<u16> = status.ports.iter().map(|p| p.vlan_tag).collect();
        assert_ne!(tags[0], tags[1]);
        assert!(status.ports.iter().all(|p| p.isolated));
    }

    #[tokio::test]
    async fn teardown_lab_frees_vlan_tags() {
        let engine = engine();
        engine.attach_endpoint("lab-1", "r1", "Ethernet1", "ns1", "eth1").await.unwrap();
        engine.teardown_lab("lab-1").await.unwrap();
        let status = engine.status().await.unwrap();
        assert!(status.ports.is_empty());
    }
}
