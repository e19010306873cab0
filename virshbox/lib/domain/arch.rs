use std::{fmt, str::FromStr};

use crate::VirshboxError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A guest instruction-set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 64-bit x86.
    X86_64,

    /// 64-bit ARM.
    Aarch64,
}

/// How the hypervisor runs guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Hardware-assisted virtualization.
    Kvm,

    /// Pure emulation.
    Qemu,
}

/// The guest CPU definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuMode {
    /// Expose the host CPU unchanged.
    HostPassthrough,

    /// Emulate a named CPU model.
    Custom(&'static str),
}

/// The device and firmware choices derived from an {architecture, backend} pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchProfile {
    /// The guest architecture.
    pub arch: Arch,

    /// The virtualization backend.
    pub backend: Backend,

    /// The machine type.
    pub machine: String,

    /// The CPU definition.
    pub cpu: CpuMode,

    /// Whether the guest boots with EFI firmware.
    pub efi_firmware: bool,

    /// The GIC version for ARM guests.
    pub gic_version: Option<u8>,

    /// Whether APIC and PAE features are enabled.
    pub x86_features: bool,

    /// The USB controller model, if one must be declared.
    pub usb_controller: Option<&'static str>,

    /// Whether a USB tablet is attached for absolute pointer input.
    pub tablet_input: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Arch {
    /// The name libvirt uses in `os/type@arch`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// The machine type used when none is configured.
    pub fn default_machine(&self) -> &'static str {
        match self {
            Arch::X86_64 => "pc-q35-6.2",
            Arch::Aarch64 => "virt",
        }
    }
}

impl Backend {
    /// The name libvirt uses in `domain@type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Kvm => "kvm",
            Backend::Qemu => "qemu",
        }
    }
}

impl ArchProfile {
    /// Derives the profile for `arch` running under `backend`.
    pub fn new(arch: Arch, backend: Backend, machine: Option<&str>) -> Self {
        let machine = machine
            .filter(|m| !m.is_empty())
            .unwrap_or(arch.default_machine())
            .to_string();

        match arch {
            Arch::X86_64 => Self {
                arch,
                backend,
                machine,
                cpu: CpuMode::HostPassthrough,
                efi_firmware: false,
                gic_version: None,
                x86_features: true,
                usb_controller: None,
                tablet_input: true,
            },
            Arch::Aarch64 => Self {
                arch,
                backend,
                machine,
                // Emulated ARM guests cannot pass the host CPU through.
                cpu: match backend {
                    Backend::Qemu => CpuMode::Custom("cortex-a72"),
                    Backend::Kvm => CpuMode::HostPassthrough,
                },
                efi_firmware: true,
                gic_version: Some(2),
                x86_features: false,
                usb_controller: Some("qemu-xhci"),
                tablet_input: false,
            },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Arch {
    type Err = VirshboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "x86_64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => Err(VirshboxError::InvalidArgument(format!(
                "unsupported architecture: {other}"
            ))),
        }
    }
}

impl FromStr for Backend {
    type Err = VirshboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "kvm" => Ok(Backend::Kvm),
            "qemu" | "tcg" => Ok(Backend::Qemu),
            other => Err(VirshboxError::InvalidArgument(format!(
                "unsupported domain type: {other}"
            ))),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
