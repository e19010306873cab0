use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::VirshboxError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Identifies a hypervisor-managed domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    /// The domain name.
    pub name: String,

    /// The hypervisor-assigned UUID, if it could be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// The lifecycle state of a domain as reported by `virsh domstate` or `virsh dominfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    /// The domain is running.
    Running,

    /// The domain is paused.
    Paused,

    /// The domain is defined but not running.
    ShutOff,

    /// The domain is in the process of shutting down.
    Shutdown,

    /// The domain crashed.
    Crashed,

    /// The guest suspended itself to memory.
    Suspended,

    /// The state string was not recognised.
    Unknown,
}

/// How a snapshot is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotKind {
    /// Kept inside the domain's qcow2 image and tracked by libvirt.
    Internal,

    /// A disk-only overlay file in the job directory.
    External,
}

/// A snapshot created by the Domain Manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// The snapshot name.
    pub name: String,

    /// How the snapshot is stored.
    pub kind: SnapshotKind,

    /// The snapshot name for internal snapshots, the overlay path for external ones.
    pub reference: String,
}

/// Advisory steps for comparing the filesystems of two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsComparePlan {
    /// The domain the snapshots belong to.
    pub vm_name: String,

    /// The older snapshot.
    pub from_snapshot: String,

    /// The newer snapshot.
    pub to_snapshot: String,

    /// Where the older snapshot should be mounted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_mount: Option<PathBuf>,

    /// Where the newer snapshot should be mounted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_mount: Option<PathBuf>,

    /// The older snapshot's overlay file, when external snapshots were found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_ref: Option<PathBuf>,

    /// The newer snapshot's overlay file, when external snapshots were found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_ref: Option<PathBuf>,

    /// Human-readable instructions.
    pub notes: Vec<String>,
}

/// The outcome of pre-flight checks on a clone source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// The domain that was checked.
    pub vm_name: String,

    /// Whether cloning may proceed.
    pub valid: bool,

    /// The domain's state when it could be determined.
    pub state: DomainState,

    /// The MAC address of the first interface, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    /// The leased IPv4 address, if the domain is running and has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Whether the domain has a network interface.
    pub has_network: bool,

    /// Problems that do not prevent cloning.
    pub warnings: Vec<String>,

    /// Problems that do.
    pub errors: Vec<String>,
}

/// The outcome of checking whether a host can fit a new sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCheckResult {
    /// Whether the sandbox fits.
    pub valid: bool,

    /// Memory the host reports in total, in MiB.
    pub total_memory_mb: u64,

    /// Memory the host reports free, in MiB.
    pub available_memory_mb: u64,

    /// Host CPU count.
    pub available_cpus: u32,

    /// Free space in the work directory, in MiB.
    pub available_disk_mb: u64,

    /// Memory the sandbox asks for, in MiB.
    pub required_memory_mb: u32,

    /// vCPUs the sandbox asks for.
    pub required_cpus: u32,

    /// Problems that do not prevent creation.
    pub warnings: Vec<String>,

    /// Problems that do.
    pub errors: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DomainState {
    /// The state string virsh prints.
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::Running => "running",
            DomainState::Paused => "paused",
            DomainState::ShutOff => "shut off",
            DomainState::Shutdown => "shutdown",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "pmsuspended",
            DomainState::Unknown => "unknown",
        }
    }

    /// Parses a virsh state string. Unrecognised strings map to [`DomainState::Unknown`].
    pub fn from_virsh(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "running" => DomainState::Running,
            "paused" => DomainState::Paused,
            "shut off" => DomainState::ShutOff,
            "shutdown" | "in shutdown" => DomainState::Shutdown,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }
}

impl SnapshotKind {
    /// The kind's canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Internal => "INTERNAL",
            SnapshotKind::External => "EXTERNAL",
        }
    }
}

impl ValidationResult {
    pub(crate) fn new(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            valid: true,
            state: DomainState::Unknown,
            mac_address: None,
            ip_address: None,
            has_network: false,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SnapshotKind {
    type Err = VirshboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INTERNAL" => Ok(SnapshotKind::Internal),
            "EXTERNAL" => Ok(SnapshotKind::External),
            other => Err(VirshboxError::InvalidArgument(format!(
                "unknown snapshot kind: {other}"
            ))),
        }
    }
}
