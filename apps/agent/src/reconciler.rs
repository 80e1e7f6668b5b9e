use crate::agent::Agent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic housekeeping independent of any single deploy/destroy request:
/// sweeps runtime resources (containers, VXLAN tunnels) that no longer have
/// a corresponding lab on disk. A crashed agent or a controller that never
/// got to call `/destroy` both leave this kind of debris behind.
///
/// `stale_since` tracks how long each overlay link id has looked orphaned:
/// a lab mid-deploy can briefly have a tunnel up before its
/// `overlay_links.json` write lands, so a tunnel only gets torn down once
/// it's looked orphaned for `reconcile_vxlan_orphan_window_secs`.
/// Controller-driven reconciles (`/labs/:lab_id/nodes/reconcile`) already
/// sweep orphaned VXLAN tunnels from the controller's authoritative view;
/// this agent backs off its own tunnel-orphan sweep for this long after one
/// runs so the two don't fight over the same tunnel.
const CONTROLLER_RECONCILE_BACKOFF: Duration = Duration::from_secs(15 * 60);

async fn reconcile_once(agent: &Agent, stale_since: &mut HashMap<String, Instant>) {
    let known_labs: HashSet<String> = match agent.workspace.known_labs().await {
        Ok(labs) => labs.into_iter().collect(),
        Err(e) => {
            warn!(error = %e, "reconciler could not list known labs");
            return;
        }
    };

    match agent.ovs.gc_orphan_veths().await {
        Ok(n) if n > 0 => info!(count = n, "reconciler removed orphaned veths"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "reconciler could not GC orphan veths"),
    }

    match agent.ovs.gc_orphan_bridges().await {
        Ok(n) if n > 0 => info!(count = n, "reconciler removed orphaned bridges"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "reconciler could not GC orphan bridges"),
    }

    match agent.overlay.gc_orphan_vxlan_interfaces().await {
        Ok(n) if n > 0 => info!(count = n, "reconciler removed orphaned VXLAN interfaces"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "reconciler could not GC orphan VXLAN interfaces"),
    }

    match agent.ovs.reconcile_live_ports().await {
        Ok((stale, untracked, drift)) if stale + untracked + drift > 0 => {
            info!(stale, untracked, drift, "reconciler reconciled tracked OVS ports against the live bridge");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "reconciler could not reconcile live OVS ports"),
    }

    if let Some(provider) = &agent.container_provider {
        match provider.list_archetype_containers().await {
            Ok(containers) => {
                for container in containers {
                    if known_labs.contains(&container.lab_id) {
                        continue;
                    }
                    info!(container = %container.name, lab_id = %container.lab_id, "removing orphaned container with no matching lab");
                    if let Err(e) = provider.remove_by_name(&container.name).await {
                        warn!(container = %container.name, error = %e, "failed to remove orphaned container");
                    }
                }
            }
            Err(e) => warn!(error = %e, "reconciler could not list containers"),
        }
    }

    let tracked_overlay_links: HashSet<String> = {
        let mut links = HashSet::new();
        for lab_id in &known_labs {
            match agent.workspace.read_overlay_links(lab_id).await {
                Ok(ids) => links.extend(ids),
                Err(e) => warn!(lab_id, error = %e, "failed to read overlay links during reconcile"),
            }
        }
        links
    };

    let recent_controller_reconcile = agent
        .last_controller_reconcile
        .lock()
        .await
        .map(|t| t.elapsed() < CONTROLLER_RECONCILE_BACKOFF)
        .unwrap_or(false);
    if recent_controller_reconcile {
        debug!("skipping VXLAN tunnel orphan sweep, controller drove a reconcile recently");
    } else {
        match agent.overlay.status().await {
            Ok(status) => {
                let now = Instant::now();
                let orphan_window = Duration::from_secs(agent.config.reconcile_vxlan_orphan_window_secs);
                let seen_this_pass: HashSet<String> = status.tunnels.iter().map(|t| t.link_id.clone()).collect();
                stale_since.retain(|id, _| seen_this_pass.contains(id));

                let mut to_cleanup = Vec::new();
                for link_id in status.tunnels.iter().map(|t| &t.link_id).filter(|id| !tracked_overlay_links.contains(*id)) {
                    let first_seen = *stale_since.entry(link_id.clone()).or_insert(now);
                    if now.duration_since(first_seen) >= orphan_window {
                        to_cleanup.push(link_id.clone());
                    }
                }

                if !to_cleanup.is_empty() {
                    info!(count = to_cleanup.len(), "tearing down overlay tunnels with no tracked lab link");
                    if let Err(e) = agent.overlay.cleanup(&to_cleanup).await {
                        warn!(error = %e, "failed to clean up orphaned overlay tunnels");
                    }
                    for link_id in &to_cleanup {
                        stale_since.remove(link_id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "reconciler could not read overlay status"),
        }
    }

    debug!(labs = known_labs.len(), "reconcile pass complete");
}

pub fn spawn(agent: Arc<Agent>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(agent.config.reconcile_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stale_since = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => reconcile_once(&agent, &mut stale_since).await,
            }
        }
        debug!("reconciler stopped");
    })
}
