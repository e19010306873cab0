use std::fmt;

use super::{Element, MacAddress};
use crate::{VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The namespace URI of libvirt's QEMU passthrough elements.
pub const QEMU_NAMESPACE: &str = "http://libvirt.org/schemas/domain/qemu/1.0";

const QEMU_COMMANDLINE: &str = "qemu:commandline";
const QEMU_ARG: &str = "qemu:arg";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A libvirt domain descriptor with typed access to the paths sandboxes touch.
///
/// The primary disk is the first `devices/disk[@device=disk]` whose target bus is `virtio` and
/// which has a `source`. Boot media is the first `devices/disk[@device=cdrom]` with a source
/// file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    root: Element,
}

/// A read-only view of a disk device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    /// `source@file`.
    pub source: Option<String>,

    /// `target@dev`.
    pub target_dev: Option<String>,

    /// `target@bus`.
    pub target_bus: Option<String>,
}

/// The architecture-related attributes of a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainPlatform {
    /// `domain@type`, such as `kvm` or `qemu`.
    pub domain_type: Option<String>,

    /// `os/type@arch`.
    pub arch: Option<String>,

    /// `os/type@machine`.
    pub machine: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DomainDescriptor {
    /// Parses a descriptor, requiring a `<domain>` root.
    pub fn parse(xml: &str) -> VirshboxResult<Self> {
        Self::from_element(Element::parse(xml)?)
    }

    /// Wraps an element tree, requiring a `<domain>` root.
    pub fn from_element(root: Element) -> VirshboxResult<Self> {
        if root.name() != "domain" {
            return Err(VirshboxError::DescriptorParse(format!(
                "expected <domain> root, found <{}>",
                root.name()
            )));
        }

        Ok(Self { root })
    }

    /// Serializes the descriptor with two-space indentation.
    pub fn to_xml(&self) -> VirshboxResult<String> {
        self.root.to_xml_string()
    }

    /// The underlying element tree.
    pub fn root(&self) -> &Element {
        &self.root
    }

    /// The domain name.
    pub fn name(&self) -> Option<String> {
        self.root.child("name").map(Element::text)
    }

    /// Renames the domain.
    pub fn set_name(&mut self, name: &str) -> VirshboxResult<()> {
        self.root
            .child_mut("name")
            .ok_or(VirshboxError::DescriptorMissing("name"))?
            .set_text(name);
        Ok(())
    }

    /// The domain UUID, if the hypervisor assigned one.
    pub fn uuid(&self) -> Option<String> {
        self.root.child("uuid").map(Element::text)
    }

    /// Removes the UUID so the hypervisor allocates a fresh one. Returns whether one was present.
    pub fn strip_uuid(&mut self) -> bool {
        self.root.remove_children(|e| e.name() == "uuid") > 0
    }

    /// The `<memory>` size converted to KiB.
    pub fn memory_kib(&self) -> Option<u64> {
        let memory = self.root.child("memory")?;
        let value: u64 = memory.text().trim().parse().ok()?;
        let factor = match memory.attr("unit").unwrap_or("KiB") {
            "b" | "bytes" => return Some(value / 1024),
            "KiB" | "k" => 1,
            "MiB" | "M" => 1024,
            "GiB" | "G" => 1024 * 1024,
            _ => return None,
        };
        Some(value * factor)
    }

    /// Sets `<memory>` and `<currentMemory>`, where present, to `mib` expressed in KiB.
    pub fn set_memory_mib(&mut self, mib: u32) {
        let kib = (u64::from(mib) * 1024).to_string();
        for name in ["memory", "currentMemory"] {
            if let Some(element) = self.root.child_mut(name) {
                element.set_text(kib.clone());
                element.set_attr("unit", "KiB");
            }
        }
    }

    /// The vCPU count.
    pub fn vcpu(&self) -> Option<u32> {
        self.root.child("vcpu")?.text().trim().parse().ok()
    }

    /// Sets the vCPU count if a `<vcpu>` element exists.
    pub fn set_vcpu(&mut self, vcpus: u32) {
        if let Some(element) = self.root.child_mut("vcpu") {
            element.set_text(vcpus.to_string());
        }
    }

    /// The `domain@type`, `os/type@arch` and `os/type@machine` attributes.
    pub fn platform(&self) -> DomainPlatform {
        let os_type = self.root.child("os").and_then(|os| os.child("type"));
        DomainPlatform {
            domain_type: self.root.attr("type").map(str::to_string),
            arch: os_type.and_then(|t| t.attr("arch")).map(str::to_string),
            machine: os_type.and_then(|t| t.attr("machine")).map(str::to_string),
        }
    }

    /// The `<devices>` element.
    pub fn devices(&self) -> Option<&Element> {
        self.root.child("devices")
    }

    fn devices_mut(&mut self) -> VirshboxResult<&mut Element> {
        self.root
            .child_mut("devices")
            .ok_or(VirshboxError::DescriptorMissing("devices"))
    }

    /// Every disk device.
    pub fn disks(&self) -> Vec<DiskInfo> {
        self.devices()
            .map(|devices| devices.children_named("disk").map(DiskInfo::from).collect())
            .unwrap_or_default()
    }

    /// The primary virtio disk.
    pub fn primary_disk(&self) -> Option<DiskInfo> {
        self.devices()?
            .children_named("disk")
            .find(|disk| is_primary_disk(disk))
            .map(DiskInfo::from)
    }

    /// Points the primary virtio disk at `path`.
    pub fn set_primary_disk_path(&mut self, path: &str) -> VirshboxResult<()> {
        let disk = self
            .devices_mut()
            .map_err(|_| VirshboxError::NoPrimaryDiskFound)?
            .children_named_mut("disk")
            .find(|disk| is_primary_disk(disk))
            .ok_or(VirshboxError::NoPrimaryDiskFound)?;

        if let Some(source) = disk.child_mut("source") {
            source.set_attr("file", path);
        }
        Ok(())
    }

    /// The backing file of the boot-media CDROM.
    pub fn boot_media_path(&self) -> Option<String> {
        self.devices()?
            .children_named("disk")
            .filter(|disk| disk.attr_is("device", "cdrom"))
            .find_map(|disk| disk.child("source")?.attr("file").map(str::to_string))
    }

    /// Points the boot-media CDROM at `path`, synthesizing the CDROM and a virtio-scsi
    /// controller if the domain has none.
    pub fn set_boot_media_path(&mut self, path: &str) -> VirshboxResult<()> {
        let devices = self.devices_mut()?;

        let existing = devices
            .children_named_mut("disk")
            .filter(|disk| disk.attr_is("device", "cdrom"))
            .filter_map(|disk| disk.child_mut("source"))
            .find(|source| source.attr("file").is_some());
        if let Some(source) = existing {
            source.set_attr("file", path);
            return Ok(());
        }

        let has_scsi = devices.children_named("controller").any(|controller| {
            controller.attr_is("type", "scsi") && controller.attr_is("model", "virtio-scsi")
        });
        if !has_scsi {
            devices.push(scsi_controller());
        }

        devices.push(boot_media_disk(path));
        Ok(())
    }

    /// The first network interface element.
    pub fn interface(&self) -> Option<&Element> {
        self.devices()?.child("interface")
    }

    /// The guest MAC address, from the interface element or the raw QEMU device argument.
    pub fn mac_address(&self) -> Option<String> {
        if let Some(interface) = self.interface() {
            return interface
                .child("mac")
                .and_then(|mac| mac.attr("address"))
                .map(str::to_string);
        }

        self.qemu_commandline_args()
            .into_iter()
            .find(|arg| arg.starts_with("virtio-net-pci"))
            .and_then(|arg| {
                arg.split(',')
                    .find_map(|part| part.strip_prefix("mac=").map(str::to_string))
            })
    }

    /// Assigns `mac` to the guest NIC and drops its pinned bus address.
    ///
    /// When the domain has no interface element, the `mac=` field of a raw `virtio-net-pci`
    /// QEMU argument is rewritten instead. Returns whether a NIC was found.
    pub fn set_mac_address(&mut self, mac: &MacAddress) -> bool {
        let mac = mac.to_string();

        if let Some(interface) = self
            .root
            .child_mut("devices")
            .and_then(|devices| devices.child_mut("interface"))
        {
            interface.child_or_insert("mac").set_attr("address", mac);
            interface.remove_children(|e| e.name() == "address");
            return true;
        }

        let Some(cmdline) = self.root.child_mut(QEMU_COMMANDLINE) else {
            return false;
        };

        for arg in cmdline.children_named_mut(QEMU_ARG) {
            let Some(value) = arg.attr("value") else {
                continue;
            };
            if !value.starts_with("virtio-net-pci") || !value.contains("mac=") {
                continue;
            }

            let rewritten = value
                .split(',')
                .map(|part| {
                    if part.starts_with("mac=") {
                        format!("mac={mac}")
                    } else {
                        part.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(",");
            arg.set_attr("value", rewritten);
            return true;
        }

        false
    }

    /// Sets the logical network of a network-attached interface.
    pub fn set_network(&mut self, network: &str) {
        let Some(interface) = self
            .root
            .child_mut("devices")
            .and_then(|devices| devices.child_mut("interface"))
        else {
            return;
        };

        if interface.attr_is("type", "network") {
            interface
                .child_or_insert("source")
                .set_attr("network", network);
        }
    }

    /// The values of every raw QEMU command-line argument.
    pub fn qemu_commandline_args(&self) -> Vec<String> {
        self.root
            .child(QEMU_COMMANDLINE)
            .map(|cmdline| {
                cmdline
                    .children_named(QEMU_ARG)
                    .filter_map(|arg| arg.attr("value").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes the password of the first graphics device.
    pub fn strip_graphics_password(&mut self) {
        if let Some(graphics) = self
            .root
            .child_mut("devices")
            .and_then(|devices| devices.child_mut("graphics"))
        {
            graphics.remove_attr("passwd");
        }
    }

    /// Removes every sound device, returning how many there were.
    pub fn remove_sound_devices(&mut self) -> usize {
        self.root
            .child_mut("devices")
            .map(|devices| devices.remove_children(|e| e.name() == "sound"))
            .unwrap_or(0)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn is_primary_disk(disk: &Element) -> bool {
    disk.attr_is("device", "disk")
        && disk
            .child("target")
            .is_some_and(|target| target.attr_is("bus", "virtio"))
        && disk.child("source").is_some()
}

/// The virtio-scsi controller boot media hangs off.
pub(crate) fn scsi_controller() -> Element {
    Element::new("controller")
        .with_attr("type", "scsi")
        .with_attr("model", "virtio-scsi")
}

/// A read-only SCSI CDROM backed by `path`.
pub(crate) fn boot_media_disk(path: &str) -> Element {
    Element::new("disk")
        .with_attr("type", "file")
        .with_attr("device", "cdrom")
        .with_child(
            Element::new("driver")
                .with_attr("name", "qemu")
                .with_attr("type", "raw"),
        )
        .with_child(Element::new("source").with_attr("file", path))
        .with_child(
            Element::new("target")
                .with_attr("dev", "sda")
                .with_attr("bus", "scsi"),
        )
        .with_child(Element::new("readonly"))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<&Element> for DiskInfo {
    fn from(disk: &Element) -> Self {
        let target = disk.child("target");
        Self {
            source: disk
                .child("source")
                .and_then(|s| s.attr("file"))
                .map(str::to_string),
            target_dev: target.and_then(|t| t.attr("dev")).map(str::to_string),
            target_bus: target.and_then(|t| t.attr("bus")).map(str::to_string),
        }
    }
}

impl fmt::Display for DomainDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_xml() {
            Ok(xml) => f.write_str(&xml),
            Err(_) => Err(fmt::Error),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
