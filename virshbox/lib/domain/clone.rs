use typed_builder::TypedBuilder;

use super::{DomainDescriptor, MacAddress};
use crate::VirshboxResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What changes when a source descriptor is turned into a clone.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct CloneOptions {
    /// The clone's domain name.
    #[builder(setter(into))]
    pub new_name: String,

    /// The clone's overlay disk.
    #[builder(setter(into))]
    pub disk_path: String,

    /// A seed image to attach as boot media. `None` leaves existing boot media untouched.
    #[builder(default, setter(strip_option, into))]
    pub boot_media_path: Option<String>,

    /// vCPUs; zero keeps the source's count.
    #[builder(default)]
    pub vcpus: u32,

    /// Memory in MiB; zero keeps the source's size.
    #[builder(default)]
    pub memory_mb: u32,

    /// Logical network for network-attached interfaces; empty keeps the source's.
    #[builder(default, setter(into))]
    pub network: String,

    /// The clone's MAC address; generated when unset.
    #[builder(default, setter(strip_option))]
    pub mac: Option<MacAddress>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DomainDescriptor {
    /// Rewrites this descriptor in place into a clone described by `options`.
    ///
    /// Fails with [`NoPrimaryDiskFound`](crate::VirshboxError::NoPrimaryDiskFound) if there
    /// is no virtio disk to attach the overlay to. Returns the MAC address the clone got.
    pub fn apply_clone(&mut self, options: &CloneOptions) -> VirshboxResult<MacAddress> {
        self.set_name(&options.new_name)?;
        self.strip_uuid();

        if options.vcpus > 0 {
            self.set_vcpu(options.vcpus);
        }

        if options.memory_mb > 0 {
            self.set_memory_mib(options.memory_mb);
        }

        self.set_primary_disk_path(&options.disk_path)?;

        if let Some(path) = options.boot_media_path.as_deref().filter(|p| !p.is_empty()) {
            self.set_boot_media_path(path)?;
        }

        let mac = options.mac.unwrap_or_else(MacAddress::generate);
        if !self.set_mac_address(&mac) {
            tracing::debug!(domain = %options.new_name, "source has no nic to assign a mac to");
        }

        if !options.network.is_empty() {
            self.set_network(&options.network);
        }

        self.strip_graphics_password();
        self.remove_sound_devices();

        Ok(mac)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses `source_xml`, applies [`CloneOptions`] and returns the clone's descriptor text.
pub fn clone_descriptor(source_xml: &str, options: &CloneOptions) -> VirshboxResult<String> {
    let mut descriptor = DomainDescriptor::parse(source_xml)?;
    descriptor.apply_clone(options)?;
    descriptor.to_xml()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VirshboxError;

    const SOURCE: &str = r#"<domain type='kvm' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>
  <name>base-ubuntu</name>
  <uuid>6d1c3a52-0000-4000-8000-000000000001</uuid>
  <memory unit='KiB'>1048576</memory>
  <currentMemory unit='KiB'>1048576</currentMemory>
  <vcpu placement='static'>1</vcpu>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/base/ubuntu.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:11:22:33'/>
      <source network='default'/>
      <model type='virtio'/>
      <address type='pci' domain='0x0000' bus='0x01' slot='0x00' function='0x0'/>
    </interface>
    <graphics type='vnc' port='-1' autoport='yes' passwd='hunter2'/>
    <sound model='ich9'/>
  </devices>
</domain>"#;

    fn options(boot_media: Option<&str>) -> CloneOptions {
        let mut options = CloneOptions::builder()
            .new_name("sbx-1")
            .disk_path("/jobs/sbx-1/disk-overlay.qcow2")
            .vcpus(2)
            .memory_mb(2048)
            .network("sandbox-net")
            .build();
        options.boot_media_path = boot_media.map(str::to_string);
        options
    }

    #[test]
    fn test_clone_rewrites_identity_disk_and_devices() -> anyhow::Result<()> {
        let mut descriptor = DomainDescriptor::parse(SOURCE)?;
        let mac = descriptor.apply_clone(&options(Some("/jobs/sbx-1/cloud-init.iso")))?;

        assert_eq!(descriptor.name().as_deref(), Some("sbx-1"));
        assert!(descriptor.uuid().is_none());
        assert_eq!(descriptor.vcpu(), Some(2));
        assert_eq!(descriptor.memory_kib(), Some(2048 * 1024));
        assert_eq!(
            descriptor.primary_disk().and_then(|d| d.source).as_deref(),
            Some("/jobs/sbx-1/disk-overlay.qcow2")
        );
        assert_eq!(
            descriptor.boot_media_path().as_deref(),
            Some("/jobs/sbx-1/cloud-init.iso")
        );
        assert_eq!(descriptor.mac_address(), Some(mac.to_string()));
        assert_ne!(mac.to_string(), "52:54:00:11:22:33");

        let interface = descriptor.interface().unwrap();
        assert!(interface.child("address").is_none());
        assert_eq!(
            interface.child("source").and_then(|s| s.attr("network")),
            Some("sandbox-net")
        );

        let devices = descriptor.devices().unwrap();
        assert!(devices.child("graphics").unwrap().attr("passwd").is_none());
        assert_eq!(devices.children_named("sound").count(), 0);
        assert_eq!(
            devices
                .children_named("controller")
                .filter(|c| c.attr_is("model", "virtio-scsi"))
                .count(),
            1
        );
        Ok(())
    }

    #[test]
    fn test_repeated_clone_keeps_only_latest_boot_media() -> anyhow::Result<()> {
        let first = clone_descriptor(SOURCE, &options(Some("/jobs/a/cloud-init.iso")))?;
        let second = clone_descriptor(&first, &options(Some("/jobs/b/cloud-init.iso")))?;

        assert!(second.contains("/jobs/b/cloud-init.iso"));
        assert!(!second.contains("/jobs/a/cloud-init.iso"));

        let descriptor = DomainDescriptor::parse(&second)?;
        let cdroms = descriptor
            .devices()
            .unwrap()
            .children_named("disk")
            .filter(|d| d.attr_is("device", "cdrom"))
            .count();
        assert_eq!(cdroms, 1);
        Ok(())
    }

    #[test]
    fn test_clone_without_boot_media_preserves_existing() -> anyhow::Result<()> {
        let with_seed = clone_descriptor(SOURCE, &options(Some("/srv/seed dir/it's.iso")))?;
        let cloned = clone_descriptor(&with_seed, &options(None))?;

        let descriptor = DomainDescriptor::parse(&cloned)?;
        assert_eq!(
            descriptor.boot_media_path().as_deref(),
            Some("/srv/seed dir/it's.iso")
        );
        Ok(())
    }

    #[test]
    fn test_clone_without_virtio_disk_fails() {
        let source = SOURCE.replace("bus='virtio'", "bus='sata'");
        assert!(matches!(
            clone_descriptor(&source, &options(None)),
            Err(VirshboxError::NoPrimaryDiskFound)
        ));
    }

    #[test]
    fn test_clone_rewrites_qemu_commandline_mac() -> anyhow::Result<()> {
        let source = r#"<domain type='qemu' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>
  <name>vmnet-base</name>
  <devices>
    <disk type='file' device='disk'>
      <source file='/base.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
  </devices>
  <qemu:commandline>
    <qemu:arg value='-netdev'/>
    <qemu:arg value='socket,id=vnet,fd=3'/>
    <qemu:arg value='-device'/>
    <qemu:arg value='virtio-net-pci,netdev=vnet,mac=52:54:00:00:00:01'/>
  </qemu:commandline>
</domain>"#;
        let mac: MacAddress = "52:54:00:de:ad:01".parse()?;
        let mut descriptor = DomainDescriptor::parse(source)?;
        let mut opts = options(None);
        opts.mac = Some(mac);
        descriptor.apply_clone(&opts)?;

        assert!(descriptor
            .qemu_commandline_args()
            .contains(&"virtio-net-pci,netdev=vnet,mac=52:54:00:de:ad:01".to_string()));
        Ok(())
    }
}
