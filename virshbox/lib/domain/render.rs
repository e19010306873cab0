use std::path::PathBuf;

use typed_builder::TypedBuilder;

use super::{
    descriptor::{boot_media_disk, scsi_controller},
    ArchProfile, CpuMode, DomainDescriptor, Element, MacAddress, QEMU_NAMESPACE,
};
use crate::VirshboxResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The network name that selects the socket_vmnet transport.
pub const SOCKET_VMNET_NETWORK: &str = "socket_vmnet";

/// The network name that selects user-mode networking.
pub const USER_NETWORK: &str = "user";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a generated domain's NIC is wired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    /// User-mode networking with no host-side configuration.
    User,

    /// A libvirt-managed logical network.
    Network(String),

    /// A socket_vmnet file descriptor handed to QEMU by a wrapper emulator.
    SocketVmnet {
        /// The wrapper that opens the socket and execs QEMU.
        wrapper: Option<PathBuf>,
    },
}

/// Everything needed to generate a descriptor from scratch.
#[derive(Debug, Clone, TypedBuilder)]
pub struct DomainSpec {
    /// The domain name.
    #[builder(setter(into))]
    pub name: String,

    /// Memory in MiB.
    pub memory_mb: u32,

    /// vCPU count.
    pub vcpus: u32,

    /// The primary disk image.
    #[builder(setter(into))]
    pub disk_path: String,

    /// A seed image to attach as a SCSI CDROM.
    #[builder(default, setter(strip_option, into))]
    pub boot_media_path: Option<String>,

    /// NIC wiring.
    pub network: NetworkMode,

    /// Architecture-dependent devices and firmware.
    pub profile: ArchProfile,

    /// The NIC's MAC address, generated when unset. Only used by socket_vmnet, where libvirt
    /// cannot assign one.
    #[builder(default, setter(strip_option))]
    pub mac: Option<MacAddress>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkMode {
    /// Selects the mode from a network name: empty or `user`, `socket_vmnet`, or anything else as
    /// a libvirt network.
    pub fn from_name(name: &str, socket_vmnet_wrapper: Option<PathBuf>) -> Self {
        match name {
            "" | USER_NETWORK => NetworkMode::User,
            SOCKET_VMNET_NETWORK => NetworkMode::SocketVmnet {
                wrapper: socket_vmnet_wrapper,
            },
            other => NetworkMode::Network(other.to_string()),
        }
    }

    /// The libvirt network leases are served from, if any.
    pub fn libvirt_network(&self) -> Option<&str> {
        match self {
            NetworkMode::Network(name) => Some(name),
            _ => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a descriptor for `spec`.
pub fn render_domain(spec: &DomainSpec) -> VirshboxResult<DomainDescriptor> {
    let profile = &spec.profile;
    let socket_vmnet = matches!(spec.network, NetworkMode::SocketVmnet { .. });

    let mut domain = Element::new("domain").with_attr("type", profile.backend.as_str());
    if socket_vmnet {
        domain.set_attr("xmlns:qemu", QEMU_NAMESPACE);
    }

    domain.push(Element::new("name").with_text(spec.name.as_str()));
    domain.push(
        Element::new("memory")
            .with_attr("unit", "MiB")
            .with_text(spec.memory_mb.to_string()),
    );
    domain.push(
        Element::new("vcpu")
            .with_attr("placement", "static")
            .with_text(spec.vcpus.to_string()),
    );
    domain.push(os_element(profile));
    domain.push(features_element(profile));
    domain.push(cpu_element(profile));

    let mut devices = Element::new("devices");
    if let NetworkMode::SocketVmnet {
        wrapper: Some(wrapper),
    } = &spec.network
    {
        devices.push(Element::new("emulator").with_text(wrapper.to_string_lossy()));
    }

    devices.push(
        Element::new("disk")
            .with_attr("type", "file")
            .with_attr("device", "disk")
            .with_child(
                Element::new("driver")
                    .with_attr("name", "qemu")
                    .with_attr("type", "qcow2")
                    .with_attr("cache", "none"),
            )
            .with_child(Element::new("source").with_attr("file", spec.disk_path.as_str()))
            .with_child(
                Element::new("target")
                    .with_attr("dev", "vda")
                    .with_attr("bus", "virtio"),
            ),
    );

    if let Some(path) = spec.boot_media_path.as_deref() {
        devices.push(boot_media_disk(path));
        devices.push(scsi_controller());
    }

    devices.push(
        Element::new("controller")
            .with_attr("type", "pci")
            .with_attr("model", "pcie-root"),
    );
    if let Some(model) = profile.usb_controller {
        devices.push(
            Element::new("controller")
                .with_attr("type", "usb")
                .with_attr("model", model),
        );
    }

    let virtio_model = || Element::new("model").with_attr("type", "virtio");
    let mac = spec.mac.unwrap_or_else(MacAddress::generate);
    match &spec.network {
        NetworkMode::User => {
            devices.push(
                Element::new("interface")
                    .with_attr("type", "user")
                    .with_child(virtio_model()),
            );
        }
        NetworkMode::Network(name) => {
            devices.push(
                Element::new("interface")
                    .with_attr("type", "network")
                    .with_child(Element::new("source").with_attr("network", name.as_str()))
                    .with_child(virtio_model()),
            );
        }
        NetworkMode::SocketVmnet { .. } => {}
    }

    devices.push(
        Element::new("graphics")
            .with_attr("type", "vnc")
            .with_attr("autoport", "yes")
            .with_attr("listen", "0.0.0.0"),
    );
    devices.push(Element::new("console").with_attr("type", "pty"));
    if profile.tablet_input {
        devices.push(
            Element::new("input")
                .with_attr("type", "tablet")
                .with_attr("bus", "usb"),
        );
    }
    devices.push(
        Element::new("rng").with_attr("model", "virtio").with_child(
            Element::new("backend")
                .with_attr("model", "random")
                .with_text("/dev/urandom"),
        ),
    );
    domain.push(devices);

    if socket_vmnet {
        let arg = |value: String| Element::new("qemu:arg").with_attr("value", value);
        domain.push(
            Element::new("qemu:commandline")
                .with_child(arg("-netdev".to_string()))
                .with_child(arg("socket,id=vnet,fd=3".to_string()))
                .with_child(arg("-device".to_string()))
                .with_child(arg(format!("virtio-net-pci,netdev=vnet,mac={mac}"))),
        );
    }

    DomainDescriptor::from_element(domain)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn os_element(profile: &ArchProfile) -> Element {
    let mut os = Element::new("os");
    if profile.efi_firmware {
        os.set_attr("firmware", "efi");
    }

    os.with_child(
        Element::new("type")
            .with_attr("arch", profile.arch.as_str())
            .with_attr("machine", profile.machine.as_str())
            .with_text("hvm"),
    )
    .with_child(Element::new("boot").with_attr("dev", "hd"))
    .with_child(Element::new("boot").with_attr("dev", "cdrom"))
}

fn features_element(profile: &ArchProfile) -> Element {
    let mut features = Element::new("features").with_child(Element::new("acpi"));
    if let Some(version) = profile.gic_version {
        features.push(Element::new("gic").with_attr("version", version.to_string()));
    }
    if profile.x86_features {
        features.push(Element::new("apic"));
        features.push(Element::new("pae"));
    }
    features
}

fn cpu_element(profile: &ArchProfile) -> Element {
    match profile.cpu {
        CpuMode::HostPassthrough => Element::new("cpu").with_attr("mode", "host-passthrough"),
        CpuMode::Custom(model) => Element::new("cpu")
            .with_attr("mode", "custom")
            .with_attr("match", "exact")
            .with_child(
                Element::new("model")
                    .with_attr("fallback", "allow")
                    .with_text(model),
            ),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Arch, Backend};

    fn spec(network: NetworkMode, profile: ArchProfile) -> DomainSpec {
        DomainSpec::builder()
            .name("sbx-7")
            .memory_mb(2048)
            .vcpus(2)
            .disk_path("/jobs/sbx-7/disk-overlay.qcow2")
            .boot_media_path("/jobs/sbx-7/cloud-init.iso")
            .network(network)
            .profile(profile)
            .build()
    }

    #[test]
    fn test_network_mode_selection() {
        assert_eq!(NetworkMode::from_name("", None), NetworkMode::User);
        assert_eq!(NetworkMode::from_name("user", None), NetworkMode::User);
        assert_eq!(
            NetworkMode::from_name("default", None),
            NetworkMode::Network("default".to_string())
        );
        assert!(matches!(
            NetworkMode::from_name("socket_vmnet", None),
            NetworkMode::SocketVmnet { wrapper: None }
        ));
    }

    #[test]
    fn test_render_x86_bridged() -> anyhow::Result<()> {
        let descriptor = render_domain(&spec(
            NetworkMode::Network("default".to_string()),
            ArchProfile::new(Arch::X86_64, Backend::Kvm, None),
        ))?;
        let xml = descriptor.to_xml()?;

        assert_eq!(descriptor.name().as_deref(), Some("sbx-7"));
        assert_eq!(descriptor.memory_kib(), Some(2048 * 1024));
        assert_eq!(
            descriptor.boot_media_path().as_deref(),
            Some("/jobs/sbx-7/cloud-init.iso")
        );
        assert!(xml.contains(r#"<cpu mode="host-passthrough"/>"#));
        assert!(xml.contains("<apic/>"));
        assert!(xml.contains(r#"<input type="tablet" bus="usb"/>"#));
        assert!(xml.contains(r#"<source network="default"/>"#));
        assert!(!xml.contains("firmware"));
        Ok(())
    }

    #[test]
    fn test_render_arm_socket_vmnet() -> anyhow::Result<()> {
        let mac: MacAddress = "52:54:00:01:02:03".parse()?;
        let mut spec = spec(
            NetworkMode::SocketVmnet {
                wrapper: Some(PathBuf::from("/opt/socket_vmnet/bin/qemu-wrapper")),
            },
            ArchProfile::new(Arch::Aarch64, Backend::Qemu, None),
        );
        spec.mac = Some(mac);

        let descriptor = render_domain(&spec)?;
        let xml = descriptor.to_xml()?;

        assert!(xml.contains(r#"<os firmware="efi">"#));
        assert!(xml.contains(r#"<gic version="2"/>"#));
        assert!(xml.contains("cortex-a72"));
        assert!(xml.contains(r#"model="qemu-xhci""#));
        assert!(xml.contains("<emulator>/opt/socket_vmnet/bin/qemu-wrapper</emulator>"));
        assert!(descriptor.interface().is_none());
        assert_eq!(descriptor.mac_address().as_deref(), Some("52:54:00:01:02:03"));
        Ok(())
    }
}
