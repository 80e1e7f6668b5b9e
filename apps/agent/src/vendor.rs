use std::collections::HashMap;

/// Boot readiness strategy for a vendor kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootProbe {
    /// Ready as soon as the container/VM reaches RUNNING.
    None,
    /// Ready when a regex matches a line of the node's boot log.
    LogPattern(String),
    /// Ready when a one-shot CLI probe inside the node exits zero.
    Cli(String),
}

/// Read-only per-kind defaults consumed by the providers. Loaded once at
/// startup from the static table below; unknown kinds fall back to
/// `VendorDescriptor::generic()` rather than failing the deploy.
#[derive(Debug, Clone)]
pub struct VendorDescriptor {
    pub kind: String,
    pub display_name: String,
    pub default_image: Option<String>,
    pub max_data_ports: u32,
    pub reserved_ports: u32,
    pub nic_driver: String,
    pub disk_driver: String,
    pub interface_prefix: String,
    pub boot_probe: BootProbe,
    pub boot_timeout_secs: u64,
    pub post_boot_commands: Vec<String>,
    /// Command run inside the node to dump its running configuration for
    /// the config-extraction endpoint. `None` means the kind has no
    /// meaningful notion of a running config to extract (e.g. plain Linux).
    pub config_extract_command: Option<String>,
}

impl VendorDescriptor {
    pub fn generic() -> Self {
        Self {
            kind: "linux".to_string(),
            display_name: "Linux".to_string(),
            default_image: Some("alpine:latest".to_string()),
            max_data_ports: 8,
            reserved_ports: 0,
            nic_driver: "virtio".to_string(),
            disk_driver: "virtio".to_string(),
            interface_prefix: "eth".to_string(),
            boot_probe: BootProbe::None,
            boot_timeout_secs: 60,
            post_boot_commands: Vec::new(),
            config_extract_command: None,
        }
    }

    /// Maps a vendor-facing interface name (e.g. `Ethernet1`) to the kernel
    /// name the veth is actually renamed to inside the namespace
    /// (e.g. `eth1`), honoring the vendor's configured prefix and the
    /// container's declared `INTFTYPE` environment override.
    pub fn kernel_ifname(&self, vendor_ifname: &str, intftype_override: Option<&str>) -> String {
        let prefix = intftype_override.unwrap_or(&self.interface_prefix);
        let digits: String = vendor_ifname.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            vendor_ifname.to_string()
        } else {
            format!("{prefix}{digits}")
        }
    }
}

/// Read-only registry of vendor descriptors, built once at startup.
pub struct VendorRegistry {
    by_kind: HashMap<String, VendorDescriptor>,
}

impl VendorRegistry {
    pub fn bundled() -> Self {
        let mut by_kind = HashMap::new();
        for d in default_table() {
            by_kind.insert(d.kind.clone(), d);
        }
        Self { by_kind }
    }

    pub fn get(&self, kind: &str) -> VendorDescriptor {
        self.by_kind
            .get(kind)
            .cloned()
            .unwrap_or_else(VendorDescriptor::generic)
    }
}

fn default_table() -> Vec<VendorDescriptor> {
    vec![
        VendorDescriptor::generic(),
        VendorDescriptor {
            kind: "ceos".to_string(),
            display_name: "Arista cEOS".to_string(),
            default_image: Some("ceos:latest".to_string()),
            max_data_ports: 32,
            reserved_ports: 1,
            nic_driver: "virtio".to_string(),
            disk_driver: "virtio".to_string(),
            interface_prefix: "eth".to_string(),
            boot_probe: BootProbe::LogPattern(r"(?i)login:".to_string()),
            boot_timeout_secs: 180,
            post_boot_commands: vec!["Cli".to_string()],
            config_extract_command: Some("show running-config".to_string()),
        },
        VendorDescriptor {
            kind: "srl".to_string(),
            display_name: "Nokia SR Linux".to_string(),
            default_image: Some("srlinux:latest".to_string()),
            max_data_ports: 32,
            reserved_ports: 1,
            nic_driver: "virtio".to_string(),
            disk_driver: "virtio".to_string(),
            interface_prefix: "e1-".to_string(),
            boot_probe: BootProbe::LogPattern(r"Started srlinux".to_string()),
            boot_timeout_secs: 180,
            post_boot_commands: Vec::new(),
            config_extract_command: Some("info from running".to_string()),
        },
        VendorDescriptor {
            kind: "vmx".to_string(),
            display_name: "Juniper vMX".to_string(),
            default_image: None,
            max_data_ports: 10,
            reserved_ports: 2,
            nic_driver: "e1000".to_string(),
            disk_driver: "sata".to_string(),
            interface_prefix: "ge-0/0/".to_string(),
            boot_probe: BootProbe::Cli("cli -c \"show version\"".to_string()),
            boot_timeout_secs: 600,
            post_boot_commands: Vec::new(),
            config_extract_command: Some("show configuration | display set".to_string()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_falls_back_to_generic() {
        let reg = VendorRegistry::bundled();
        let d = reg.get("totally-made-up-vendor");
        assert_eq!(d.kind, "linux");
        assert_eq!(d.boot_probe, BootProbe::None);
    }

    #[test]
    fn kernel_ifname_maps_vendor_digits() {
        let d = VendorDescriptor::generic();
        assert_eq!(d.kernel_ifname("Ethernet1", Some("eth")), "eth1");
        assert_eq!(d.kernel_ifname("eth3", None), "eth3");
    }
}
