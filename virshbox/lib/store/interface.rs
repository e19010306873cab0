use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Command, Diff, ListOptions, Sandbox, SandboxFilter, SandboxState, Snapshot};
use crate::VirshboxResult;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Persists sandboxes and their history.
///
/// Lookups of missing records fail with [`VirshboxError::NotFound`][crate::VirshboxError::NotFound]
/// and inserts that collide with an existing identity fail with
/// [`VirshboxError::AlreadyExists`][crate::VirshboxError::AlreadyExists]. Destroyed sandboxes are
/// soft-deleted and disappear from sandbox lookups and listings.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a new sandbox.
    async fn create_sandbox(&self, sandbox: &Sandbox) -> VirshboxResult<()>;

    /// Fetches a live sandbox by id.
    async fn get_sandbox(&self, id: &str) -> VirshboxResult<Sandbox>;

    /// Fetches a live sandbox by domain name.
    async fn get_sandbox_by_name(&self, name: &str) -> VirshboxResult<Sandbox>;

    /// Lists live sandboxes matching `filter`, newest first unless `options` say otherwise.
    async fn list_sandboxes(
        &self,
        filter: &SandboxFilter,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Sandbox>>;

    /// Overwrites the mutable fields of a live sandbox and bumps `updated_at`.
    async fn update_sandbox(&self, sandbox: &Sandbox) -> VirshboxResult<()>;

    /// Sets the state of a live sandbox, and its address when `ip_address` is given.
    async fn update_sandbox_state(
        &self,
        id: &str,
        state: SandboxState,
        ip_address: Option<&str>,
    ) -> VirshboxResult<()>;

    /// Marks a sandbox destroyed and soft-deletes it.
    async fn delete_sandbox(&self, id: &str) -> VirshboxResult<()>;

    /// Live sandboxes whose TTL, or `default_ttl` when they have none, has run out at `now`.
    async fn list_expired_sandboxes(
        &self,
        default_ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> VirshboxResult<Vec<Sandbox>>;

    /// Inserts a snapshot record. Names are unique per sandbox.
    async fn create_snapshot(&self, snapshot: &Snapshot) -> VirshboxResult<()>;

    /// Fetches a snapshot by id.
    async fn get_snapshot(&self, id: &str) -> VirshboxResult<Snapshot>;

    /// Fetches a snapshot by sandbox and name.
    async fn get_snapshot_by_name(&self, sandbox_id: &str, name: &str)
        -> VirshboxResult<Snapshot>;

    /// Lists the snapshots of a sandbox.
    async fn list_snapshots(
        &self,
        sandbox_id: &str,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Snapshot>>;

    /// Records a command run.
    async fn save_command(&self, command: &Command) -> VirshboxResult<()>;

    /// Fetches a command by id.
    async fn get_command(&self, id: &str) -> VirshboxResult<Command>;

    /// Lists the commands run in a sandbox, by start time.
    async fn list_commands(
        &self,
        sandbox_id: &str,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Command>>;

    /// Records a diff. One diff is kept per sandbox and snapshot pair.
    async fn save_diff(&self, diff: &Diff) -> VirshboxResult<()>;

    /// Fetches a diff by id.
    async fn get_diff(&self, id: &str) -> VirshboxResult<Diff>;

    /// Fetches the diff between two snapshots of a sandbox.
    async fn get_diff_by_snapshots(
        &self,
        sandbox_id: &str,
        from_snapshot: &str,
        to_snapshot: &str,
    ) -> VirshboxResult<Diff>;
}
