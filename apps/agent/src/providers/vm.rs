use super::{NodeHandle, Provider};
use agent_types::{DeployNode, NodeStatus};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

const VALID_MACHINE_TYPES: &[&str] = &["pc", "q35", "virt", "pc-i440fx-6.2", "pc-q35-9.0"];

/// Drives QEMU/KVM domains through `virsh`, generating libvirt domain XML
/// by hand (no libvirt client library dependency, matching the rest of
/// the agent's CLI-wrapping style). One domain per node, named after the
/// lab/node pair the same way the container provider names containers.
pub struct VmProvider {
    test_mode: bool,
    uri: String,
}

impl VmProvider {
    pub fn new(test_mode: bool) -> Self {
        Self {
            test_mode,
            uri: "qemu:///system".to_string(),
        }
    }

    pub fn domain_name(lab_id: &str, node_name: &str) -> String {
        super::node_runtime_name(lab_id, node_name)
    }

    /// Deterministic locally-administered MAC so a redeployed lab gets the
    /// same addresses every time, aiding reproducible packet captures.
    pub fn generate_mac_address(domain_name: &str, index: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(domain_name.as_bytes());
        hasher.update(index.to_le_bytes());
        let digest = hasher.finalize();
        format!(
            "52:54:00:{:02x}:{:02x}:{:02x}",
            digest[0], digest[1], digest[2]
        )
    }

    fn resolve_nic_driver(requested: &str) -> Result<&'static str> {
        match requested {
            "virtio" => Ok("virtio"),
            "e1000" => Ok("e1000"),
            "vmxnet3" => Ok("virtio"),
            "vmxnet2" => Ok("e1000"),
            other => bail!("invalid NIC driver: {other}"),
        }
    }

    fn disk_bus(driver: &str) -> Result<&'static str> {
        match driver {
            "virtio" => Ok("virtio"),
            "ide" => Ok("ide"),
            "sata" => Ok("sata"),
            other => bail!("invalid disk driver: {other}"),
        }
    }

    /// Generates the full domain XML for one node. `vlan_tags` gives one
    /// OVS VLAN tag per bridge-type network interface, in order.
    pub fn generate_domain_xml(
        &self,
        domain_name: &str,
        node: &DeployNode,
        bridge: &str,
        overlay_path: &str,
        data_volume_path: Option<&str>,
        vlan_tags: &[u16],
    ) -> Result<String> {
        let machine_type = node.machine_type.as_deref().unwrap_or("pc-q35-9.0");
        if !VALID_MACHINE_TYPES.contains(&machine_type) {
            bail!("Invalid machine type: {machine_type}");
        }
        let disk_driver = node.disk_driver.as_deref().unwrap_or("virtio");
        let disk_bus = Self::disk_bus(disk_driver)?;
        let nic_driver = Self::resolve_nic_driver(node.nic_driver.as_deref().unwrap_or("virtio"))?;

        let memory_mb = node.memory.unwrap_or(2048);
        let cpu = node.cpu.unwrap_or(1);

        let mut disks = format!(
            r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none' io='native' discard='unmap'/>
      <source file='{overlay_path}'/>
      <target dev='vda' bus='{disk_bus}'/>
    </disk>
"#,
        );
        if let Some(data_path) = data_volume_path {
            disks.push_str(&format!(
                r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none' io='native' discard='unmap'/>
      <source file='{data_path}'/>
      <target dev='vdb' bus='{disk_bus}'/>
    </disk>
"#,
            ));
        }

        let mut interfaces = String::new();
        for (i, tag) in vlan_tags.iter().enumerate() {
            let mac = Self::generate_mac_address(domain_name, i as u32);
            interfaces.push_str(&format!(
                r#"    <interface type='bridge'>
      <source bridge='{bridge}'/>
      <vlan><tag id='{tag}'/></vlan>
      <mac address='{mac}'/>
      <model type='{nic_driver}'/>
    </interface>
"#,
            ));
        }

        let cputune = node
            .cpu_limit
            .map(|pct| {
                let period = 100_000u64;
                let quota = period * cpu as u64 * pct as u64 / 100;
                format!("  <cputune>\n    <period>{period}</period>\n    <quota>{quota}</quota>\n  </cputune>\n")
            })
            .unwrap_or_default();

        let (os_firmware, os_loader_nvram) = self.efi_block(node);

        let xml = format!(
            r#"<domain type='kvm'>
  <name>{domain_name}</name>
  <memory unit='MiB'>{memory_mb}</memory>
  <vcpu>{cpu}</vcpu>
{cputune}  <os{os_firmware}>
    <type arch='x86_64' machine='{machine_type}'>hvm</type>
{os_loader_nvram}  </os>
  <cpu mode='host-passthrough' migratable='off'/>
  <on_reboot>restart</on_reboot>
  <on_crash>restart</on_crash>
  <devices>
{disks}{interfaces}    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <memballoon model='none'/>
    <rng model='virtio'>
      <backend model='random'>/dev/urandom</backend>
    </rng>
  </devices>
</domain>"#,
        );
        Ok(xml)
    }

    fn efi_block(&self, node: &DeployNode) -> (String, String) {
        if node.efi_boot != Some(true) {
            return (String::new(), String::new());
        }
        match node.efi_vars.as_deref() {
            Some("stateless") | None => (String::new(), String::new()),
            Some(_) => (
                " firmware='efi'".to_string(),
                "    <loader readonly='yes' type='pflash'>/usr/share/OVMF/OVMF_CODE.fd</loader>\n    <nvram template='/usr/share/OVMF/OVMF_VARS.fd'/>\n".to_string(),
            ),
        }
    }

    /// Verifies a backing image's SHA256 digest, retrying once after
    /// dropping the page cache: a corrupted-looking read is sometimes a
    /// stale cached copy of a file that was rewritten out from under it.
    pub async fn verify_backing_image(&self, path: &str, expected_sha256: Option<&str>) -> Result<()> {
        let Some(expected) = expected_sha256 else {
            return Ok(());
        };
        let actual = Self::compute_file_sha256(path).await?;
        if actual == expected {
            return Ok(());
        }
        warn!(path, "backing image hash mismatch, dropping caches and retrying");
        let _ = tokio::fs::write("/proc/sys/vm/drop_caches", b"3").await;
        let actual_retry = Self::compute_file_sha256(path).await?;
        if actual_retry != expected {
            bail!("backing image integrity check failed for {path}: expected {expected}, got {actual_retry}");
        }
        Ok(())
    }

    pub async fn compute_file_sha256(path: &str) -> Result<String> {
        let data = tokio::fs::read(path).await.with_context(|| format!("reading {path}"))?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        Ok(hex::encode(hasher.finalize()))
    }

    async fn run_virsh(&self, args: &[&str]) -> Result<String> {
        if self.test_mode {
            return Ok(String::new());
        }
        let mut full_args = vec!["-n", "virsh", "-c", &self.uri];
        full_args.extend_from_slice(args);
        let output = Command::new("sudo").args(&full_args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("virsh {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Provider for VmProvider {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn create(&self, lab_id: &str, node: &DeployNode, vlan_tags: &[u16]) -> Result<NodeHandle> {
        let domain_name = Self::domain_name(lab_id, &node.name);
        let overlay_path = format!("/var/lib/archetype/images/{}.qcow2", node.name);
        let xml = self.generate_domain_xml(&domain_name, node, "archbr0", &overlay_path, None, vlan_tags)?;

        if !self.test_mode {
            let xml_path = format!("/tmp/{domain_name}.xml");
            tokio::fs::write(&xml_path, &xml).await?;
            self.run_virsh(&["define", &xml_path]).await?;
        }
        info!(lab_id, node = %node.name, "defined libvirt domain");

        Ok(NodeHandle {
            lab_id: lab_id.to_string(),
            node_name: node.name.clone(),
            runtime_id: domain_name,
            netns: String::new(),
            pid: None,
        })
    }

    async fn start(&self, handle: &NodeHandle) -> Result<()> {
        self.run_virsh(&["start", &handle.runtime_id]).await?;
        Ok(())
    }

    async fn stop(&self, handle: &NodeHandle, _timeout_secs: u64) -> Result<()> {
        self.run_virsh(&["shutdown", &handle.runtime_id]).await?;
        Ok(())
    }

    async fn destroy(&self, handle: &NodeHandle) -> Result<()> {
        let _ = self.run_virsh(&["destroy", &handle.runtime_id]).await;
        self.run_virsh(&["undefine", &handle.runtime_id, "--remove-all-storage"]).await?;
        Ok(())
    }

    async fn status(&self, handle: &NodeHandle) -> Result<NodeStatus> {
        if self.test_mode {
            return Ok(NodeStatus::Running);
        }
        let out = self.run_virsh(&["domstate", &handle.runtime_id]).await.unwrap_or_default();
        Ok(match out.trim() {
            "running" => NodeStatus::Running,
            "paused" => NodeStatus::Stopping,
            "shut off" => NodeStatus::Stopped,
            "" => NodeStatus::Unknown,
            _ => NodeStatus::Unknown,
        })
    }

    async fn boot_log_tail(&self, handle: &NodeHandle, tail_lines: usize) -> Result<String> {
        let log_path = format!("/var/log/libvirt/qemu/{}.log", handle.runtime_id);
        if !Path::new(&log_path).exists() {
            return Ok(String::new());
        }
        let content = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        Ok(content.lines().rev().take(tail_lines).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n"))
    }

    async fn exec(&self, _handle: &NodeHandle, _command: &[String]) -> Result<String> {
        bail!("exec is not supported for VM-backed nodes; use the console channel instead")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> DeployNode {
        DeployNode {
            name: "r1".to_string(),
            memory: Some(2048),
            cpu: Some(1),
            machine_type: Some("pc-i440fx-6.2".to_string()),
            disk_driver: Some("virtio".to_string()),
            nic_driver: Some("virtio".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn mac_address_is_deterministic() {
        let m1 = VmProvider::generate_mac_address("test-domain", 0);
        let m2 = VmProvider::generate_mac_address("test-domain", 0);
        assert_eq!(m1, m2);
        let m3 = VmProvider::generate_mac_address("test-domain", 1);
        assert_ne!(m1, m3);
        assert!(m1.starts_with("52:54:00:"));
    }

    #[test]
    fn invalid_machine_type_rejected() {
        let p = VmProvider::new(true);
        let mut n = node();
        n.machine_type = Some("pc-invalid-999".to_string());
        let err = p.generate_domain_xml("d", &n, "archbr0", "/tmp/o.qcow2", None, &[2000]).unwrap_err();
        assert!(err.to_string().contains("Invalid machine type"));
    }

    #[test]
    fn vmxnet3_substituted_to_virtio() {
        let p = VmProvider::new(true);
        let mut n = node();
        n.nic_driver = Some("vmxnet3".to_string());
        let xml = p.generate_domain_xml("d", &n, "archbr0", "/tmp/o.qcow2", None, &[2000]).unwrap();
        assert!(xml.contains("<model type='virtio'/>"));
    }

    #[test]
    fn disk_has_cache_none_and_discard_unmap() {
        let p = VmProvider::new(true);
        let n = node();
        let xml = p.generate_domain_xml("d", &n, "archbr0", "/tmp/o.qcow2", Some("/tmp/data.qcow2"), &[2000]).unwrap();
        assert!(xml.contains("cache='none'"));
        assert!(xml.contains("discard='unmap'"));
        assert!(!xml.contains("writeback"));
    }

    #[test]
    fn stateful_efi_sets_firmware_attribute() {
        let p = VmProvider::new(true);
        let mut n = node();
        n.efi_boot = Some(true);
        n.efi_vars = Some(String::new());
        let xml = p.generate_domain_xml("d", &n, "archbr0", "/tmp/o.qcow2", None, &[2000]).unwrap();
        assert!(xml.contains("firmware='efi'"));
        assert!(xml.contains("<nvram"));
    }

    #[tokio::test]
    async fn verify_backing_image_skips_without_expected_hash() {
        let p = VmProvider::new(true);
        p.verify_backing_image("/nonexistent/file", None).await.unwrap();
    }

    #[tokio::test]
    async fn verify_backing_image_passes_when_hash_matches() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(tmp.path(), b"test image data").await.unwrap();
        let expected = VmProvider::compute_file_sha256(tmp.path().to_str().unwrap()).await.unwrap();
        let p = VmProvider::new(true);
        p.verify_backing_image(tmp.path().to_str().unwrap(), Some(&expected)).await.unwrap();
    }
}
