use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SandpitError;
use crate::hypervisor::{DomainSpec, DomainTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceProfile {
    pub vcpu: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

impl ResourceProfile {
    pub fn validate(&self) -> Result<(), SandpitError> {
        if self.vcpu < 1 {
            return Err(SandpitError::Validation {
                message: "vcpu must be at least 1".into(),
            });
        }
        if self.memory_mib < 256 {
            return Err(SandpitError::Validation {
                message: "memory_mib must be at least 256".into(),
            });
        }
        if self.disk_gib < 1 {
            return Err(SandpitError::Validation {
                message: "disk_gib must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            vcpu: 2,
            memory_mib: 2048,
            disk_gib: 20,
        }
    }
}

/// How a VM reaches the outside world. The filtering itself lives in the
/// pre-provisioned network and nwfilter; this only picks which one to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Outbound DNS/HTTP/HTTPS/SSH/git only, inbound established/related.
    #[default]
    NatFiltered,
    /// No external traffic at all.
    Isolated,
}

impl FromStr for NetworkMode {
    type Err = SandpitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nat-filtered" => Ok(NetworkMode::NatFiltered),
            "isolated" => Ok(NetworkMode::Isolated),
            other => Err(SandpitError::Validation {
                message: format!("unknown network mode '{other}' (use nat-filtered or isolated)"),
            }),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::NatFiltered => f.write_str("nat-filtered"),
            NetworkMode::Isolated => f.write_str("isolated"),
        }
    }
}

/// Renders libvirt domain XML for pool VMs.
///
/// Disks are expected at `<disk_dir>/<name>.qcow2`; preparing them is the
/// job of the image tooling.
#[derive(Debug, Clone)]
pub struct LibvirtTemplate {
    pub domain_type: String,
    pub machine: String,
    pub disk_dir: PathBuf,
    pub nat_network: String,
    pub nat_filter: String,
    pub isolated_network: String,
}

impl LibvirtTemplate {
    fn interface_xml(&self, network: NetworkMode) -> String {
        match network {
            NetworkMode::NatFiltered => format!(
                r#"    <interface type='network'>
      <source network='{}'/>
      <model type='virtio'/>
      <filterref filter='{}'/>
    </interface>"#,
                self.nat_network, self.nat_filter
            ),
            NetworkMode::Isolated => format!(
                r#"    <interface type='network'>
      <source network='{}'/>
      <model type='virtio'/>
    </interface>"#,
                self.isolated_network
            ),
        }
    }
}

impl DomainTemplate for LibvirtTemplate {
    fn render(&self, name: &str, resources: &ResourceProfile, network: NetworkMode) -> DomainSpec {
        let memory_kib = resources.memory_mib * 1024;
        let vcpu = resources.vcpu;
        let disk_gib = resources.disk_gib;
        let domain_type = &self.domain_type;
        let machine = &self.machine;
        let disk = self.disk_dir.join(format!("{name}.qcow2"));
        let disk = disk.display();
        let interface = self.interface_xml(network);

        let body = format!(
            r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <metadata>
    <sandpit:vm xmlns:sandpit='urn:sandpit:vm'>
      <sandpit:network>{network}</sandpit:network>
      <sandpit:disk_gib>{disk_gib}</sandpit:disk_gib>
    </sandpit:vm>
  </metadata>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{vcpu}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
{interface}
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
        );

        DomainSpec {
            name: name.to_string(),
            body,
        }
    }
}
