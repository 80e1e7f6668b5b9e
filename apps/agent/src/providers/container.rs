use super::{NodeHandle, Provider};
use agent_types::{DeployNode, NodeStatus};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

/// Drives the local Docker daemon over its unix socket. Container names
/// are namespaced by lab id so two labs can both declare a node called
/// `r1` without colliding.
pub struct ContainerProvider {
    docker: Docker,
}

/// One container discovered through the `archetype.lab_id` label, as
/// opposed to a container spec known from a lab's own manifest.
#[derive(Debug, Clone)]
pub struct ArchetypeContainer {
    pub name: String,
    pub lab_id: String,
    pub node_name: String,
}

impl ContainerProvider {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connecting to local Docker daemon")?;
        Ok(Self { docker })
    }

    pub fn container_name(lab_id: &str, node_name: &str) -> String {
        super::node_runtime_name(lab_id, node_name)
    }

    /// Lists every container this agent manages, identified by the
    /// `archetype.lab_id` label rather than its name, for orphan sweeps
    /// that run independent of any single lab's manifest.
    pub async fn list_archetype_containers(&self) -> Result<Vec<ArchetypeContainer>> {
        use bollard::container::ListContainersOptions;
        let mut filters = std::collections::HashMap::new();
        filters.insert("label".to_string(), vec!["archetype.lab_id".to_string()]);
        let opts = ListContainersOptions::<String> { all: true, filters, ..Default::default() };
        let containers = self.docker.list_containers(Some(opts)).await.context("listing archetype containers")?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let labels = c.labels.unwrap_or_default();
                let lab_id = labels.get("archetype.lab_id")?.clone();
                let node_name = labels.get("archetype.node_name").cloned().unwrap_or_default();
                let name = c.names.unwrap_or_default().into_iter().next()?.trim_start_matches('/').to_string();
                Some(ArchetypeContainer { name, lab_id, node_name })
            })
            .collect())
    }

    pub async fn remove_by_name(&self, name: &str) -> Result<()> {
        let opts = RemoveContainerOptions { force: true, v: true, ..Default::default() };
        match self.docker.remove_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs the Docker daemon's own prune endpoints per the request's flags,
    /// accumulating counts and continuing past a failed category rather than
    /// aborting the whole pass on the first error.
    pub async fn prune(&self, req: &agent_types::DockerPruneRequest) -> agent_types::DockerPruneResponse {
        use bollard::container::PruneContainersOptions;
        use bollard::image::PruneImagesOptions;
        use bollard::network::PruneNetworksOptions;
        use bollard::system::PruneBuildOptions;
        use bollard::volume::PruneVolumesOptions;
        use std::collections::HashMap;

        let mut resp = agent_types::DockerPruneResponse { success: true, ..Default::default() };

        if req.prune_dangling_images {
            let mut filters = HashMap::new();
            filters.insert("dangling".to_string(), vec!["true".to_string()]);
            match self.docker.prune_images(Some(PruneImagesOptions::<String> { filters })).await {
                Ok(r) => {
                    resp.images_removed = r.images_deleted.map(|v| v.len() as u32).unwrap_or(0);
                    resp.space_reclaimed += r.space_reclaimed.unwrap_or(0).max(0) as u64;
                }
                Err(e) => {
                    resp.success = false;
                    resp.errors.push(format!("image prune: {e}"));
                }
            }
        }

        if req.prune_build_cache {
            match self.docker.prune_build(PruneBuildOptions::default()).await {
                Ok(r) => {
                    resp.build_cache_removed = r.caches_deleted.map(|v| v.len() as u32).unwrap_or(0);
                    resp.space_reclaimed += r.space_reclaimed.unwrap_or(0).max(0) as u64;
                }
                Err(e) => {
                    resp.success = false;
                    resp.errors.push(format!("build cache prune: {e}"));
                }
            }
        }

        if req.prune_unused_volumes {
            match self.docker.prune_volumes(Some(PruneVolumesOptions::<String> { filters: HashMap::new() })).await {
                Ok(r) => {
                    resp.volumes_removed = r.volumes_deleted.map(|v| v.len() as u32).unwrap_or(0);
                    resp.space_reclaimed += r.space_reclaimed.unwrap_or(0).max(0) as u64;
                }
                Err(e) => {
                    resp.success = false;
                    resp.errors.push(format!("volume prune: {e}"));
                }
            }
        }

        if req.prune_stopped_containers {
            match self.docker.prune_containers(Some(PruneContainersOptions::<String> { filters: HashMap::new() })).await {
                Ok(r) => {
                    resp.containers_removed = r.containers_deleted.map(|v| v.len() as u32).unwrap_or(0);
                    resp.space_reclaimed += r.space_reclaimed.unwrap_or(0).max(0) as u64;
                }
                Err(e) => {
                    resp.success = false;
                    resp.errors.push(format!("container prune: {e}"));
                }
            }
        }

        if req.prune_unused_networks {
            match self.docker.prune_networks(Some(PruneNetworksOptions::<String> { filters: HashMap::new() })).await {
                Ok(r) => {
                    resp.networks_removed = r.networks_deleted.map(|v| v.len() as u32).unwrap_or(0);
                }
                Err(e) => {
                    resp.success = false;
                    resp.errors.push(format!("network prune: {e}"));
                }
            }
        }

        resp
    }

    pub async fn list_images(&self) -> Result<Vec<agent_types::DockerImageInfo>> {
        use bollard::image::ListImagesOptions;
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> { all: false, ..Default::default() }))
            .await
            .context("listing Docker images")?;
        Ok(images
            .into_iter()
            .map(|img| agent_types::DockerImageInfo {
                id: img.id,
                tags: img.repo_tags,
                size_bytes: img.size.max(0) as u64,
                created: Some(img.created.to_string()),
            })
            .collect())
    }

    /// Opens an interactive, TTY-attached exec session for a console
    /// websocket to proxy. Unlike `exec`, the returned streams stay open
    /// until the caller drops them or the shell exits.
    pub async fn interactive_exec(
        &self,
        runtime_id: &str,
        shell: &str,
    ) -> Result<(String, bollard::exec::StartExecResults)> {
        let exec = self
            .docker
            .create_exec(
                runtime_id,
                CreateExecOptions {
                    cmd: Some(vec![shell.to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("creating interactive exec instance")?;
        let started = self.docker.start_exec(&exec.id, None).await.context("starting interactive exec")?;
        Ok((exec.id, started))
    }

    pub async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.docker
            .resize_exec(exec_id, bollard::exec::ResizeExecOptions { height: rows, width: cols })
            .await
            .context("resizing exec tty")
    }

    /// Creates a per-lab bridge network for management-plane connectivity,
    /// separate from the OVS data plane: node consoles and config
    /// extraction reach nodes through this network rather than the
    /// emulated topology's own links.
    pub async fn create_mgmt_network(&self, lab_id: &str, subnet: &str, gateway: &str) -> Result<(String, String)> {
        use bollard::network::CreateNetworkOptions;
        use bollard::models::{Ipam, IpamConfig};
        let name = format!("archetype-mgmt-{lab_id}");
        let options = CreateNetworkOptions {
            name: name.as_str(),
            driver: "bridge",
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    gateway: Some(gateway.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = self.docker.create_network(options).await.context("creating management network")?;
        Ok((created.id.unwrap_or_default(), name))
    }

    pub async fn attach_to_network(&self, network_id: &str, container_id: &str) -> Result<()> {
        use bollard::network::ConnectNetworkOptions;
        self.docker
            .connect_network(network_id, ConnectNetworkOptions::<String> { container: container_id.to_string(), ..Default::default() })
            .await
            .context("attaching container to management network")
    }

    /// Resolves a running container's network namespace path from its PID,
    /// the same way `create` derives it for a freshly started container.
    pub async fn inspect_netns(&self, runtime_id: &str) -> Result<Option<String>> {
        let inspected = self.docker.inspect_container(runtime_id, None).await?;
        Ok(inspected.state.and_then(|s| s.pid).filter(|pid| *pid > 0).map(|pid| format!("/proc/{pid}/ns/net")))
    }

    pub async fn inspect_container_ip(&self, container_id: &str, network_name: &str) -> Result<Option<String>> {
        let inspected = self.docker.inspect_container(container_id, None).await?;
        Ok(inspected
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|nets| nets.get(network_name).cloned())
            .and_then(|n| n.ip_address)
            .filter(|ip| !ip.is_empty()))
    }

    /// Raw Docker event stream, filtered by the caller. Kept as a thin
    /// passthrough so the event listener owns the reconnect/backoff policy
    /// rather than this provider.
    pub fn docker_events(
        &self,
        options: bollard::system::EventsOptions<String>,
    ) -> impl futures::Stream<Item = Result<bollard::models::EventMessage, bollard::errors::Error>> + '_ {
        self.docker.events(Some(options))
    }

    pub async fn inspect_image(&self, reference: &str) -> Result<Option<agent_types::DockerImageInfo>> {
        match self.docker.inspect_image(reference).await {
            Ok(img) => Ok(Some(agent_types::DockerImageInfo {
                id: img.id.unwrap_or_default(),
                tags: img.repo_tags.unwrap_or_default(),
                size_bytes: img.size.unwrap_or(0).max(0) as u64,
                created: img.created,
            })),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Provider for ContainerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, lab_id: &str, node: &DeployNode, _vlan_tags: &[u16]) -> Result<NodeHandle> {
        let name = Self::container_name(lab_id, &node.name);
        let image = node
            .image
            .clone()
            .with_context(|| format!("node {} has no image set", node.name))?;

        let env: Vec<String> = node.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let labels = std::collections::HashMap::from([
            ("archetype.lab_id".to_string(), lab_id.to_string()),
            ("archetype.node_name".to_string(), node.name.clone()),
            ("archetype.node_kind".to_string(), node.kind.clone()),
        ]);

        let host_config = HostConfig {
            binds: if node.binds.is_empty() { None } else { Some(node.binds.clone()) },
            memory: node.memory.map(|mb| (mb as i64) * 1024 * 1024),
            nano_cpus: node.cpu.map(|cores| (cores as i64) * 1_000_000_000),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            cap_add: Some(vec!["NET_ADMIN".to_string()]),
            privileged: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(host_config),
            hostname: Some(node.name.clone()),
            labels: Some(labels),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        info!(lab_id, node = %node.name, %image, "creating container");
        let created = self.docker.create_container(Some(options), config).await.with_context(|| format!("creating container {name}"))?;

        let inspected = self.docker.inspect_container(&created.id, None).await?;
        let netns = inspected
            .state
            .as_ref()
            .and_then(|s| s.pid)
            .map(|pid| format!("/proc/{pid}/ns/net"))
            .unwrap_or_default();
        let pid = inspected.state.as_ref().and_then(|s| s.pid).map(|p| p as i32);

        Ok(NodeHandle {
            lab_id: lab_id.to_string(),
            node_name: node.name.clone(),
            runtime_id: created.id,
            netns,
            pid,
        })
    }

    async fn start(&self, handle: &NodeHandle) -> Result<()> {
        debug!(container = %handle.runtime_id, "starting container");
        self.docker.start_container::<String>(&handle.runtime_id, None).await.context("starting container")?;
        Ok(())
    }

    async fn stop(&self, handle: &NodeHandle, timeout_secs: u64) -> Result<()> {
        let opts = StopContainerOptions { t: timeout_secs as i64 };
        match self.docker.stop_container(&handle.runtime_id, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self, handle: &NodeHandle) -> Result<()> {
        let opts = RemoveContainerOptions { force: true, v: true, ..Default::default() };
        match self.docker.remove_container(&handle.runtime_id, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, handle: &NodeHandle) -> Result<NodeStatus> {
        let inspected = match self.docker.inspect_container(&handle.runtime_id, None).await {
            Ok(i) => i,
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                return Ok(NodeStatus::Unknown)
            }
            Err(e) => return Err(e.into()),
        };
        let status = inspected
            .state
            .and_then(|s| s.status)
            .map(|s| match s {
                bollard::models::ContainerStateStatusEnum::RUNNING => NodeStatus::Running,
                bollard::models::ContainerStateStatusEnum::CREATED => NodeStatus::Pending,
                bollard::models::ContainerStateStatusEnum::RESTARTING => NodeStatus::Starting,
                bollard::models::ContainerStateStatusEnum::PAUSED => NodeStatus::Stopping,
                bollard::models::ContainerStateStatusEnum::EXITED => NodeStatus::Stopped,
                bollard::models::ContainerStateStatusEnum::DEAD => NodeStatus::Error,
                _ => NodeStatus::Unknown,
            })
            .unwrap_or(NodeStatus::Unknown);
        Ok(status)
    }

    async fn boot_log_tail(&self, handle: &NodeHandle, tail_lines: usize) -> Result<String> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_lines.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(&handle.runtime_id, Some(opts));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    async fn exec(&self, handle: &NodeHandle, command: &[String]) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                &handle.runtime_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("creating exec instance")?;

        let mut out = String::new();
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(msg) => out.push_str(&msg.to_string()),
                    Err(e) => bail!("exec stream error: {e}"),
                }
            }
        }
        Ok(out)
    }
}
