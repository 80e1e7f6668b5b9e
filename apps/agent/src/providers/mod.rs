pub mod container;
pub mod vm;

use agent_types::{DeployNode, NodeStatus};
use anyhow::Result;
use async_trait::async_trait;

pub use container::ContainerProvider;
pub use vm::VmProvider;

/// Deterministic runtime identifier shared by every provider: a Docker
/// container and a libvirt domain for the same lab/node pair carry the
/// same name, so orchestrator code that doesn't know which provider is
/// active can still address a node by name alone.
pub fn node_runtime_name(lab_id: &str, node_name: &str) -> String {
    format!("archetype-{lab_id}-{node_name}")
}

/// A running node's handle for the lifetime of a lab: the identifiers a
/// provider needs to address it again without re-deriving them from the
/// node spec.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    pub lab_id: String,
    pub node_name: String,
    pub runtime_id: String,
    pub netns: String,
    pub pid: Option<i32>,
}

/// Uniform lifecycle surface the orchestrator drives regardless of
/// whether a node is backed by a container or a VM. Each provider owns
/// its own notion of "runtime id" (container id, libvirt domain name)
/// behind the opaque `NodeHandle`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `vlan_tags` carries pre-allocated per-interface OVS VLAN tags for
    /// providers that need them baked in at creation time (VM domain XML);
    /// providers that wire VLAN tags later through `OvsEngine::attach_endpoint`
    /// (containers) ignore it.
    async fn create(&self, lab_id: &str, node: &DeployNode, vlan_tags: &[u16]) -> Result<NodeHandle>;

    async fn start(&self, handle: &NodeHandle) -> Result<()>;

    async fn stop(&self, handle: &NodeHandle, timeout_secs: u64) -> Result<()>;

    async fn destroy(&self, handle: &NodeHandle) -> Result<()>;

    async fn status(&self, handle: &NodeHandle) -> Result<NodeStatus>;

    /// Reads up to `tail_lines` of the most recent boot/console log, used
    /// by the log-pattern readiness probe.
    async fn boot_log_tail(&self, handle: &NodeHandle, tail_lines: usize) -> Result<String>;

    /// Runs a one-shot command inside the node, used by the CLI readiness
    /// probe and by config extraction. Returns stdout on success.
    async fn exec(&self, handle: &NodeHandle, command: &[String]) -> Result<String>;
}
