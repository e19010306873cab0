use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{virsh::SnapshotKind, VirshboxError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a sandbox is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    /// The clone is being prepared.
    Creating,

    /// The domain is defined but has not been started.
    Created,

    /// The domain was started and is waiting for an address.
    Starting,

    /// The domain is running.
    Running,

    /// The domain was shut down.
    Stopped,

    /// The domain was destroyed and its record soft-deleted.
    Destroyed,

    /// An operation left the sandbox in an unknown condition.
    Error,
}

/// A sandbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    /// The `SBX-` id.
    pub id: String,

    /// The `JOB-` id of the job that created the sandbox.
    pub job_id: String,

    /// The agent the sandbox was created for.
    pub agent_id: String,

    /// The libvirt domain name.
    pub sandbox_name: String,

    /// The domain or image the sandbox was cloned from.
    pub base_image: String,

    /// The libvirt network the sandbox is attached to.
    pub network: String,

    /// The last discovered IPv4 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// The lifecycle state.
    pub state: SandboxState,

    /// Seconds after creation at which the janitor destroys the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,

    /// The fleet host the sandbox lives on, if not the local host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    /// The address of that host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,

    /// When the record was soft-deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A snapshot record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The `SNP-` id.
    pub id: String,

    /// The sandbox the snapshot belongs to.
    pub sandbox_id: String,

    /// The snapshot name, unique per sandbox.
    pub name: String,

    /// How the snapshot is stored.
    pub kind: SnapshotKind,

    /// The libvirt snapshot name or the overlay path.
    pub reference: String,

    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_json: Option<String>,
}

/// A command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// The `CMD-` id.
    pub id: String,

    /// The sandbox the command ran in.
    pub sandbox_id: String,

    /// The command line as given.
    pub command: String,

    /// The environment passed with the command, as a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_json: Option<String>,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// The exit code, 255 when ssh itself failed.
    pub exit_code: i32,

    /// When the command was started.
    pub started_at: DateTime<Utc>,

    /// When the command finished.
    pub ended_at: DateTime<Utc>,
}

/// A change set computed between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// The `DIF-` id.
    pub id: String,

    /// The sandbox the snapshots belong to.
    pub sandbox_id: String,

    /// The older snapshot.
    pub from_snapshot: String,

    /// The newer snapshot.
    pub to_snapshot: String,

    /// The changes.
    pub diff: ChangeDiff,

    /// When the diff was computed.
    pub created_at: DateTime<Utc>,
}

/// What changed inside a sandbox between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDiff {
    /// Files whose contents changed.
    #[serde(default)]
    pub files_modified: Vec<String>,

    /// Files that appeared.
    #[serde(default)]
    pub files_added: Vec<String>,

    /// Files that disappeared.
    #[serde(default)]
    pub files_removed: Vec<String>,

    /// Packages that were installed.
    #[serde(default)]
    pub packages_added: Vec<PackageInfo>,

    /// Packages that were removed.
    #[serde(default)]
    pub packages_removed: Vec<PackageInfo>,

    /// Services whose state or enablement changed.
    #[serde(default)]
    pub services_changed: Vec<ServiceChange>,

    /// The commands run between the snapshots.
    #[serde(default)]
    pub commands_run: Vec<CommandSummary>,
}

/// A package name and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// The package name.
    pub name: String,

    /// The package version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A change to a system service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceChange {
    /// The unit name.
    pub name: String,

    /// Whether the unit is now enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// `started`, `stopped`, `restarted` or `reloaded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// A command that contributed to a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSummary {
    /// The command line.
    pub cmd: String,

    /// Its exit code.
    pub exit_code: i32,

    /// When it finished.
    pub at: DateTime<Utc>,
}

/// Narrows a sandbox listing. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxFilter {
    /// Only sandboxes of this agent.
    pub agent_id: Option<String>,

    /// Only sandboxes of this job.
    pub job_id: Option<String>,

    /// Only sandboxes cloned from this source.
    pub base_image: Option<String>,

    /// Only sandboxes in this state.
    pub state: Option<SandboxState>,

    /// Only the sandbox with this domain name.
    pub vm_name: Option<String>,
}

/// Pagination for list operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// The most records to return.
    pub limit: Option<u32>,

    /// Records to skip, only applied with a limit.
    pub offset: Option<u32>,

    /// Oldest first instead of newest first.
    pub ascending: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxState {
    /// The state's stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Creating => "CREATING",
            SandboxState::Created => "CREATED",
            SandboxState::Starting => "STARTING",
            SandboxState::Running => "RUNNING",
            SandboxState::Stopped => "STOPPED",
            SandboxState::Destroyed => "DESTROYED",
            SandboxState::Error => "ERROR",
        }
    }
}

impl Sandbox {
    /// When the sandbox's TTL runs out, using `default_ttl` if it has none of its own.
    pub fn expires_at(&self, default_ttl: Option<std::time::Duration>) -> Option<DateTime<Utc>> {
        let ttl = self
            .ttl_seconds
            .map(std::time::Duration::from_secs)
            .or(default_ttl)?;
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        self.created_at.checked_add_signed(ttl)
    }
}

impl ListOptions {
    /// The first `limit` records.
    pub fn limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Oldest first.
    pub fn ascending() -> Self {
        Self {
            ascending: true,
            ..Self::default()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SandboxState {
    type Err = VirshboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATING" => Ok(SandboxState::Creating),
            "CREATED" => Ok(SandboxState::Created),
            "STARTING" => Ok(SandboxState::Starting),
            "RUNNING" => Ok(SandboxState::Running),
            "STOPPED" => Ok(SandboxState::Stopped),
            "DESTROYED" => Ok(SandboxState::Destroyed),
            "ERROR" => Ok(SandboxState::Error),
            other => Err(VirshboxError::InvalidArgument(format!(
                "unknown sandbox state: {other}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn sandbox(ttl_seconds: Option<u64>) -> anyhow::Result<Sandbox> {
        let created_at = Utc
            .with_ymd_and_hms(2024, 1, 8, 12, 0, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("invalid fixture time"))?;
        Ok(Sandbox {
            id: "SBX-1".to_string(),
            job_id: "JOB-1".to_string(),
            agent_id: "agent".to_string(),
            sandbox_name: "sbx-1".to_string(),
            base_image: "base-ubuntu".to_string(),
            network: "default".to_string(),
            ip_address: None,
            state: SandboxState::Running,
            ttl_seconds,
            host_name: None,
            host_address: None,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        })
    }

    #[test]
    fn test_expiry_prefers_own_ttl() -> anyhow::Result<()> {
        let own = sandbox(Some(60))?;
        assert_eq!(
            own.expires_at(Some(Duration::from_secs(3600))),
            Some(own.created_at + chrono::Duration::seconds(60))
        );

        let inherited = sandbox(None)?;
        assert_eq!(
            inherited.expires_at(Some(Duration::from_secs(3600))),
            Some(inherited.created_at + chrono::Duration::hours(1))
        );
        assert_eq!(inherited.expires_at(None), None);
        Ok(())
    }

    #[test]
    fn test_state_names() -> anyhow::Result<()> {
        assert_eq!(SandboxState::Running.to_string(), "RUNNING");
        assert_eq!("stopped".parse::<SandboxState>()?, SandboxState::Stopped);
        assert!("paused".parse::<SandboxState>().is_err());
        assert_eq!(
            serde_json::to_string(&SandboxState::Destroyed)?,
            "\"DESTROYED\""
        );
        Ok(())
    }
}
