use crate::agent::Agent;
use agent_types::{NodeEvent, NodeEventCallback, NodeEventType};
use bollard::system::EventsOptions;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pulls the lab/node identity back out of a Docker event's actor
/// attributes, which carry every label the container was created with
/// alongside built-ins like `name` and `image`.
fn parse_node_identity(attributes: &HashMap<String, String>) -> Option<(String, String)> {
    let lab_id = attributes.get("archetype.lab_id")?.clone();
    let node_name = attributes.get("archetype.node_name")?.clone();
    Some((lab_id, node_name))
}

fn classify(action: &str) -> Option<NodeEventType> {
    match action {
        "start" => Some(NodeEventType::Started),
        "stop" => Some(NodeEventType::Stopped),
        "die" => Some(NodeEventType::Died),
        "destroy" => Some(NodeEventType::Removed),
        "oom" => Some(NodeEventType::Oom),
        _ => None,
    }
}

async fn forward_to_controller(agent: &Agent, event: &NodeEvent) {
    let Some(base) = &agent.config.controller_base_url else { return };
    let callback = NodeEventCallback {
        agent_id: agent.config.agent_id.clone(),
        lab_id: event.lab_id.clone(),
        node_name: event.node_name.clone(),
        container_id: event.container_id.clone(),
        event_type: event.event_type,
        timestamp: event.timestamp,
        status: event.status.clone(),
        attributes: event.attributes.clone(),
    };
    let result = agent
        .http
        .post(format!("{base}/events/node"))
        .timeout(Duration::from_secs(5))
        .json(&callback)
        .send()
        .await;
    if let Err(e) = result {
        warn!(error = %e, lab_id = %event.lab_id, node = %event.node_name, "failed to forward node event to controller");
    }
}

/// Rebuilds the OVS endpoints for a node after a restart is observed: the
/// container gets a new network namespace, so every veth that used to sit
/// in it is gone and must be rewired at the same VLAN tags it had before.
async fn reprovision_after_restart(agent: &Agent, lab_id: &str, node_name: &str) {
    let Some(provider) = &agent.container_provider else { return };
    let links = match agent.workspace.read_links(lab_id).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, lab_id, node_name, "failed to read links for restart reprovisioning");
            return;
        }
    };
    let kinds = agent.workspace.read_node_kinds(lab_id).await.unwrap_or_default();
    let kind = kinds.get(node_name).cloned().unwrap_or_else(|| "generic".to_string());
    let vendor = agent.vendors.get(&kind);

    let mut iface_map = Vec::new();
    for link in links.values() {
        if link.source_node == node_name {
            let kernel = vendor.kernel_ifname(&link.source_interface, None);
            iface_map.push((link.source_interface.clone(), kernel));
        }
        if link.target_node == node_name {
            let kernel = vendor.kernel_ifname(&link.target_interface, None);
            iface_map.push((link.target_interface.clone(), kernel));
        }
    }
    if iface_map.is_empty() {
        return;
    }

    let runtime_name = crate::providers::node_runtime_name(lab_id, node_name);
    let netns = match provider.inspect_netns(&runtime_name).await {
        Ok(Some(netns)) => netns,
        _ => return,
    };

    if let Err(e) = agent.ovs.handle_container_restart(lab_id, node_name, &netns, &iface_map).await {
        warn!(error = %e, lab_id, node_name, "failed to reprovision interfaces after restart");
    }
}

async fn handle_event(agent: &Agent, container_name: &str, container_id: &str, action: &str, labels: &HashMap<String, String>) {
    let Some(event_type) = classify(action) else { return };
    let Some((lab_id, node_name)) = parse_node_identity(labels) else { return };

    let mut attributes = HashMap::new();
    attributes.insert("container_name".to_string(), container_name.to_string());

    let event = NodeEvent {
        lab_id: lab_id.clone(),
        node_name: node_name.clone(),
        container_id: container_id.to_string(),
        event_type,
        timestamp: chrono::Utc::now(),
        status: Some(action.to_string()),
        attributes,
    };

    if event_type == NodeEventType::Started {
        reprovision_after_restart(agent, &lab_id, &node_name).await;
    }

    forward_to_controller(agent, &event).await;
}

/// Streams Docker daemon events filtered to container lifecycle changes and
/// turns the ones touching `archetype.lab_id`-labeled containers into node
/// events. Runs for the lifetime of the process; a stream error just
/// restarts the subscription after a short backoff rather than exiting the
/// task.
pub fn spawn(agent: Arc<Agent>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(provider) = agent.container_provider.clone() else {
            debug!("no container provider, event listener idle");
            return;
        };

        'reconnect: loop {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            filters.insert(
                "event".to_string(),
                vec!["start".to_string(), "stop".to_string(), "die".to_string(), "destroy".to_string(), "oom".to_string()],
            );
            filters.insert("label".to_string(), vec!["archetype.lab_id".to_string()]);
            let options = EventsOptions::<String> { filters, ..Default::default() };
            let mut stream = provider.docker_events(options);

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    item = stream.next() => item,
                };
                let Some(item) = item else { break };
                match item {
                    Ok(event) => {
                        let action = event.action.unwrap_or_default();
                        let actor = event.actor.unwrap_or_default();
                        let attributes = actor.attributes.unwrap_or_default();
                        let name = attributes.get("name").cloned().unwrap_or_default();
                        let id = actor.id.unwrap_or_default();
                        if attributes.contains_key("archetype.lab_id") {
                            handle_event(&agent, &name, &id, &action, &attributes).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "docker event stream error, reconnecting");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        }
        debug!("event listener stopped");
    })
}
