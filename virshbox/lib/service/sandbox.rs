use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use super::{
    command_with_env, GuestTarget, ServiceConfig, SshRunner, SystemSshRunner,
    SSH_TRANSPORT_EXIT_CODE,
};
use crate::{
    config::HostConfig,
    credentials::CredentialManager,
    fleet::MultiHostDiscovery,
    store::{
        ChangeDiff, Command, CommandSummary, Diff, ListOptions, Sandbox, SandboxFilter,
        SandboxState, Snapshot, Store,
    },
    utils::{
        prefixed_id, short_id, Clock, SystemClock, COMMAND_ID_PREFIX, DIFF_ID_PREFIX,
        JOB_ID_PREFIX, SANDBOX_ID_PREFIX, SNAPSHOT_ID_PREFIX,
    },
    virsh::DomainManager,
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of generated domain names.
pub const SANDBOX_NAME_PREFIX: &str = "sbx-";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates, runs and retires sandboxes, keeping the store in step with the hypervisors.
///
/// Sandboxes are cloned on the local host unless a fleet is configured and the source domain
/// lives on one of its hosts, in which case the sandbox is created on that host and every later
/// operation is routed there.
#[derive(TypedBuilder)]
pub struct SandboxService {
    /// The Domain Manager of the local host. Its settings are reused for fleet hosts.
    manager: DomainManager,

    store: Arc<dyn Store>,

    #[builder(default)]
    config: ServiceConfig,

    #[builder(default)]
    credentials: Option<Arc<CredentialManager>>,

    #[builder(default = Arc::new(SystemSshRunner::new()))]
    ssh: Arc<dyn SshRunner>,

    #[builder(default)]
    fleet: Option<MultiHostDiscovery>,

    #[builder(default = Arc::new(SystemClock))]
    clock: Arc<dyn Clock>,

    /// Cancels address discovery and fleet lookups in flight.
    #[builder(default)]
    shutdown: CancellationToken,
}

/// Parameters of [`SandboxService::create_sandbox`].
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct CreateSandboxRequest {
    /// The domain to clone.
    #[builder(setter(into))]
    pub source: String,

    /// The agent the sandbox is created for.
    #[builder(setter(into))]
    pub agent_id: String,

    /// The new domain's name. Generated when absent.
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,

    /// vCPUs, zero for the default.
    #[builder(default)]
    pub vcpus: u32,

    /// Memory in MiB, zero for the default.
    #[builder(default)]
    pub memory_mb: u32,

    /// Seconds after which the janitor destroys the sandbox.
    #[builder(default, setter(strip_option))]
    pub ttl_seconds: Option<u64>,

    /// Boot the sandbox once it is defined.
    #[builder(default)]
    pub auto_start: bool,

    /// Wait for the booted sandbox to obtain an address.
    #[builder(default)]
    pub wait_for_ip: bool,
}

/// Parameters of [`SandboxService::run_command`].
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct RunCommandRequest {
    /// The sandbox to run in.
    #[builder(setter(into))]
    pub sandbox_id: String,

    /// The shell command.
    #[builder(setter(into))]
    pub command: String,

    /// The login user. Defaults to the managed credential user when no key is given.
    #[builder(default, setter(strip_option, into))]
    pub username: Option<String>,

    /// A caller-provided private key. Managed credentials are used when absent.
    #[builder(default, setter(strip_option, into))]
    pub private_key_path: Option<PathBuf>,

    /// The deadline. Defaults to the configured command timeout.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    /// Variables exported before the command runs.
    #[builder(default)]
    pub env: BTreeMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxService {
    /// The service's settings.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The store sandboxes are recorded in.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Cancels address discovery and fleet lookups in flight and refuses new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Clones `request.source` into a new sandbox and records it, optionally booting it and
    /// waiting for its address.
    ///
    /// If the boot fails the record is left in [`SandboxState::Error`]; if address discovery
    /// fails or finds an address held by another running sandbox, the record is left running
    /// without an address. The error is returned in both cases.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> VirshboxResult<Sandbox> {
        require("source domain name", &request.source)?;
        require("agent id", &request.agent_id)?;

        let name = request
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{SANDBOX_NAME_PREFIX}{}", short_id()));
        let vcpus = if request.vcpus == 0 {
            self.config.default_vcpus
        } else {
            request.vcpus
        };
        let memory_mb = if request.memory_mb == 0 {
            self.config.default_memory_mb
        } else {
            request.memory_mb
        };

        match self.store.get_sandbox_by_name(&name).await {
            Ok(existing) => {
                return Err(VirshboxError::AlreadyExists(format!(
                    "sandbox {name} ({})",
                    existing.id
                )))
            }
            Err(VirshboxError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(
            source = %request.source,
            agent_id = %request.agent_id,
            sandbox_name = %name,
            vcpus,
            memory_mb,
            auto_start = request.auto_start,
            wait_for_ip = request.wait_for_ip,
            "creating sandbox"
        );

        let (manager, host) = self.resolve_source(&request.source).await?;
        let network = manager.config().network.clone();

        manager
            .clone_from(&request.source, &name, vcpus, memory_mb, Some(&network))
            .await
            .inspect_err(|e| {
                tracing::error!(source = %request.source, sandbox_name = %name, error = %e, "failed to clone domain")
            })?;

        let now = self.clock.now();
        let mut sandbox = Sandbox {
            id: prefixed_id(SANDBOX_ID_PREFIX),
            job_id: prefixed_id(JOB_ID_PREFIX),
            agent_id: request.agent_id.clone(),
            sandbox_name: name.clone(),
            base_image: request.source.clone(),
            network,
            ip_address: None,
            state: SandboxState::Created,
            ttl_seconds: request.ttl_seconds,
            host_name: host.as_ref().map(|h| h.get_name().clone()),
            host_address: host.as_ref().map(|h| h.get_address().clone()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        if let Err(e) = self.store.create_sandbox(&sandbox).await {
            tracing::error!(sandbox_name = %name, error = %e, "failed to record sandbox, removing the clone");
            match manager.destroy(&name).await {
                Ok(report) if !report.is_clean() => {
                    tracing::warn!(sandbox_name = %name, report = %report, "clone teardown incomplete")
                }
                Ok(_) => {}
                Err(de) => tracing::warn!(sandbox_name = %name, error = %de, "clone teardown failed"),
            }
            return Err(e);
        }

        tracing::debug!(sandbox_id = %sandbox.id, sandbox_name = %name, "sandbox cloned");

        if request.auto_start {
            self.boot(&manager, &mut sandbox, request.wait_for_ip).await?;
        }

        tracing::info!(
            sandbox_id = %sandbox.id,
            state = %sandbox.state,
            ip_address = ?sandbox.ip_address,
            "sandbox created"
        );
        Ok(sandbox)
    }

    /// Boots a sandbox, optionally waiting for its address. Returns the sandbox as recorded.
    pub async fn start_sandbox(&self, id: &str, wait_for_ip: bool) -> VirshboxResult<Sandbox> {
        require("sandbox id", id)?;
        let mut sandbox = self.store.get_sandbox(id).await?;
        tracing::info!(sandbox_id = %id, sandbox_name = %sandbox.sandbox_name, current_state = %sandbox.state, wait_for_ip, "starting sandbox");

        let manager = self.manager_for(&sandbox)?;
        self.boot(&manager, &mut sandbox, wait_for_ip).await?;

        tracing::info!(sandbox_id = %id, ip_address = ?sandbox.ip_address, "sandbox started");
        Ok(sandbox)
    }

    /// Shuts a sandbox down, or powers it off when `force` is set. Its last address is kept.
    pub async fn stop_sandbox(&self, id: &str, force: bool) -> VirshboxResult<Sandbox> {
        require("sandbox id", id)?;
        let mut sandbox = self.store.get_sandbox(id).await?;

        let manager = self.manager_for(&sandbox)?;
        manager.stop(&sandbox.sandbox_name, force).await?;

        self.store
            .update_sandbox_state(id, SandboxState::Stopped, None)
            .await?;
        sandbox.state = SandboxState::Stopped;

        tracing::info!(sandbox_id = %id, force, "sandbox stopped");
        Ok(sandbox)
    }

    /// Tears a sandbox's domain down, retires its credentials and soft-deletes its record.
    ///
    /// Teardown is best-effort; the record is deleted even when some steps failed.
    pub async fn destroy_sandbox(&self, id: &str) -> VirshboxResult<Sandbox> {
        require("sandbox id", id)?;
        let mut sandbox = self.store.get_sandbox(id).await?;

        if let Some(credentials) = &self.credentials {
            if let Err(e) = credentials.cleanup(id).await {
                tracing::warn!(sandbox_id = %id, error = %e, "failed to clean up ssh credentials");
            }
        }

        let manager = self.manager_for(&sandbox)?;
        let report = manager.destroy(&sandbox.sandbox_name).await?;
        if !report.is_clean() {
            tracing::warn!(sandbox_id = %id, report = %report, "domain teardown incomplete");
        }

        self.store.delete_sandbox(id).await?;
        sandbox.state = SandboxState::Destroyed;

        tracing::info!(sandbox_id = %id, sandbox_name = %sandbox.sandbox_name, "sandbox destroyed");
        Ok(sandbox)
    }

    /// Snapshots a sandbox and records the snapshot.
    pub async fn create_snapshot(
        &self,
        id: &str,
        name: &str,
        external: bool,
    ) -> VirshboxResult<Snapshot> {
        require("sandbox id", id)?;
        require("snapshot name", name)?;
        let sandbox = self.store.get_sandbox(id).await?;

        let manager = self.manager_for(&sandbox)?;
        let reference = manager
            .create_snapshot(&sandbox.sandbox_name, name, external)
            .await?;

        let snapshot = Snapshot {
            id: prefixed_id(SNAPSHOT_ID_PREFIX),
            sandbox_id: sandbox.id.clone(),
            name: reference.name,
            kind: reference.kind,
            reference: reference.reference,
            created_at: self.clock.now(),
            meta_json: None,
        };
        self.store.create_snapshot(&snapshot).await?;

        tracing::info!(sandbox_id = %id, snapshot = %snapshot.name, kind = snapshot.kind.as_str(), "snapshot recorded");
        Ok(snapshot)
    }

    /// Records the change set between two snapshots.
    ///
    /// File, package and service changes are left empty; the commands run in the sandbox are
    /// listed in the order they started.
    pub async fn diff_snapshots(&self, id: &str, from: &str, to: &str) -> VirshboxResult<Diff> {
        require("sandbox id", id)?;
        require("from snapshot", from)?;
        require("to snapshot", to)?;
        let sandbox = self.store.get_sandbox(id).await?;

        let manager = self.manager_for(&sandbox)?;
        match manager
            .diff_snapshot(&sandbox.sandbox_name, from, to)
            .await
        {
            Ok(plan) => tracing::debug!(sandbox_id = %id, notes = ?plan.notes, "snapshot comparison plan"),
            Err(e) => tracing::debug!(sandbox_id = %id, error = %e, "no snapshot comparison plan"),
        }

        let commands = self
            .store
            .list_commands(id, ListOptions::ascending())
            .await?;

        let diff = Diff {
            id: prefixed_id(DIFF_ID_PREFIX),
            sandbox_id: id.to_string(),
            from_snapshot: from.to_string(),
            to_snapshot: to.to_string(),
            diff: ChangeDiff {
                commands_run: commands
                    .into_iter()
                    .map(|c| CommandSummary {
                        cmd: c.command,
                        exit_code: c.exit_code,
                        at: c.ended_at,
                    })
                    .collect(),
                ..Default::default()
            },
            created_at: self.clock.now(),
        };
        self.store.save_diff(&diff).await?;

        Ok(diff)
    }

    /// Runs a shell command inside a sandbox over SSH and records it.
    ///
    /// The sandbox's address is rediscovered on every call and persisted if it changed. A
    /// non-zero exit status is recorded and returned as a normal result; a command that never
    /// ran or never finished is recorded with exit status 255 and returned as an error.
    pub async fn run_command(&self, request: RunCommandRequest) -> VirshboxResult<Command> {
        require("sandbox id", &request.sandbox_id)?;
        require("command", &request.command)?;
        let timeout = request
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.command_timeout);

        let private_key_path = request
            .private_key_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty());
        let username = request
            .username
            .clone()
            .filter(|u| !u.trim().is_empty());

        let credentials = match (&private_key_path, &self.credentials) {
            (Some(_), _) => None,
            (None, Some(credentials)) => Some(credentials),
            (None, None) => {
                return Err(VirshboxError::InvalidArgument(
                    "a private key path is required when no credential manager is configured"
                        .to_string(),
                ))
            }
        };
        if credentials.is_none() && username.is_none() {
            return Err(VirshboxError::InvalidArgument(
                "username is required".to_string(),
            ));
        }

        let sandbox = self.store.get_sandbox(&request.sandbox_id).await?;
        let manager = self.manager_for(&sandbox)?;

        let (ip, mac) = manager
            .get_ip_address(
                &sandbox.sandbox_name,
                self.config.ip_discovery_timeout,
                &self.shutdown,
            )
            .await?;

        if let Err(e) = self.ensure_ip_unique(&sandbox.id, &ip).await {
            tracing::warn!(sandbox_id = %sandbox.id, sandbox_name = %sandbox.sandbox_name, ip_address = %ip, mac_address = %mac, error = %e, "ip conflict detected");
            return Err(e);
        }

        if sandbox.ip_address.as_deref() != Some(ip.as_str()) {
            self.store
                .update_sandbox_state(&sandbox.id, sandbox.state, Some(&ip))
                .await?;
        }

        let target = match credentials {
            Some(credentials) => {
                let username = username.unwrap_or_else(|| self.config.default_user.clone());
                let credential = credentials
                    .get_credentials(&sandbox.id, &username)
                    .await?;
                GuestTarget {
                    address: ip,
                    user: credential.get_username().clone(),
                    private_key_path: credential.get_private_key_path().clone(),
                    certificate_path: Some(credential.get_certificate_path().clone()),
                }
            }
            None => GuestTarget {
                address: ip,
                user: username.unwrap_or_default(),
                private_key_path: private_key_path.unwrap_or_default(),
                certificate_path: None,
            },
        };

        let env_json = if request.env.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&request.env)?)
        };

        let started_at = self.clock.now();
        let outcome = self
            .ssh
            .run(
                &target,
                &command_with_env(&request.command, &request.env),
                timeout,
            )
            .await;
        let ended_at = self.clock.now();

        let (stdout, stderr, exit_code) = match &outcome {
            Ok(output) => (
                output.stdout.clone(),
                output.stderr.clone(),
                output.status.unwrap_or(-1),
            ),
            Err(e) => (String::new(), e.to_string(), SSH_TRANSPORT_EXIT_CODE),
        };

        let command = Command {
            id: prefixed_id(COMMAND_ID_PREFIX),
            sandbox_id: sandbox.id.clone(),
            command: request.command.clone(),
            env_json,
            stdout,
            stderr,
            exit_code,
            started_at,
            ended_at,
        };
        self.store.save_command(&command).await?;

        tracing::info!(
            sandbox_id = %sandbox.id,
            command_id = %command.id,
            exit_code,
            elapsed_ms = (ended_at - started_at).num_milliseconds(),
            "command finished"
        );

        outcome?;
        Ok(command)
    }

    /// Fetches a sandbox.
    pub async fn get_sandbox(&self, id: &str) -> VirshboxResult<Sandbox> {
        require("sandbox id", id)?;
        self.store.get_sandbox(id).await
    }

    /// Lists sandboxes.
    pub async fn list_sandboxes(
        &self,
        filter: &SandboxFilter,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Sandbox>> {
        self.store.list_sandboxes(filter, options).await
    }

    /// Lists the commands run in a sandbox, most recent first.
    pub async fn list_commands(
        &self,
        id: &str,
        options: ListOptions,
    ) -> VirshboxResult<Vec<Command>> {
        require("sandbox id", id)?;
        self.store.get_sandbox(id).await?;
        self.store.list_commands(id, options).await
    }

    /// Places `public_key` in a sandbox's disk for `username` before it boots.
    pub async fn inject_ssh_key(
        &self,
        id: &str,
        username: &str,
        public_key: &str,
    ) -> VirshboxResult<()> {
        require("sandbox id", id)?;
        require("username", username)?;
        require("public key", public_key)?;
        let sandbox = self.store.get_sandbox(id).await?;

        let manager = self.manager_for(&sandbox)?;
        manager
            .inject_ssh_key(&sandbox.sandbox_name, username, public_key)
            .await
    }

    /// Destroys every sandbox whose TTL has run out and returns the ids destroyed.
    ///
    /// A sandbox that fails to destroy is logged and skipped.
    pub async fn reap_expired(&self) -> VirshboxResult<Vec<String>> {
        let expired = self
            .store
            .list_expired_sandboxes(self.config.default_ttl, self.clock.now())
            .await?;

        let mut destroyed = Vec::with_capacity(expired.len());
        for sandbox in expired {
            if self.shutdown.is_cancelled() {
                break;
            }

            tracing::info!(
                sandbox_id = %sandbox.id,
                sandbox_name = %sandbox.sandbox_name,
                created_at = %sandbox.created_at,
                ttl_seconds = ?sandbox.ttl_seconds,
                "destroying expired sandbox"
            );
            match self.destroy_sandbox(&sandbox.id).await {
                Ok(_) => destroyed.push(sandbox.id),
                Err(e) => {
                    tracing::warn!(sandbox_id = %sandbox.id, error = %e, "failed to destroy expired sandbox")
                }
            }
        }

        Ok(destroyed)
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: Helpers
//--------------------------------------------------------------------------------------------------

impl SandboxService {
    /// Picks the host that holds `source`: the local host when it has the domain or no fleet is
    /// configured, otherwise the first fleet host that reports it.
    async fn resolve_source(
        &self,
        source: &str,
    ) -> VirshboxResult<(DomainManager, Option<HostConfig>)> {
        let Some(fleet) = &self.fleet else {
            return Ok((self.manager.clone(), None));
        };

        match self.manager.domain_exists(source).await {
            Ok(true) => return Ok((self.manager.clone(), None)),
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(source = source, error = %e, "local lookup failed, searching the fleet")
            }
        }

        let host = fleet.find_host_for_vm(source, &self.shutdown).await?;
        let manager = fleet.manager_for(&host, self.manager.config().clone())?;
        tracing::info!(source = source, host = %host.get_name(), "source domain is on a fleet host");
        Ok((manager, Some(host)))
    }

    /// The Domain Manager of the host that holds `sandbox`.
    fn manager_for(&self, sandbox: &Sandbox) -> VirshboxResult<DomainManager> {
        let Some(host_name) = &sandbox.host_name else {
            return Ok(self.manager.clone());
        };

        let host = self
            .fleet
            .as_ref()
            .and_then(|fleet| {
                fleet
                    .hosts()
                    .iter()
                    .find(|h| h.get_name() == host_name)
                    .map(|h| (fleet, h))
            });

        match host {
            Some((fleet, host)) => fleet.manager_for(host, self.manager.config().clone()),
            None => Err(VirshboxError::NotFound(format!(
                "fleet host {host_name} of sandbox {}",
                sandbox.id
            ))),
        }
    }

    /// Starts the domain and moves the record through starting to running.
    async fn boot(
        &self,
        manager: &DomainManager,
        sandbox: &mut Sandbox,
        wait_for_ip: bool,
    ) -> VirshboxResult<()> {
        if let Err(e) = manager.start(&sandbox.sandbox_name).await {
            tracing::error!(sandbox_id = %sandbox.id, sandbox_name = %sandbox.sandbox_name, error = %e, "failed to start domain");
            self.set_state_best_effort(sandbox, SandboxState::Error).await;
            return Err(e);
        }

        self.store
            .update_sandbox_state(&sandbox.id, SandboxState::Starting, None)
            .await?;
        sandbox.state = SandboxState::Starting;

        if !wait_for_ip {
            self.store
                .update_sandbox_state(&sandbox.id, SandboxState::Running, None)
                .await?;
            sandbox.state = SandboxState::Running;
            return Ok(());
        }

        tracing::info!(
            sandbox_id = %sandbox.id,
            timeout_secs = self.config.ip_discovery_timeout.as_secs(),
            "waiting for ip address"
        );

        let (ip, mac) = match manager
            .get_ip_address(
                &sandbox.sandbox_name,
                self.config.ip_discovery_timeout,
                &self.shutdown,
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox.id, sandbox_name = %sandbox.sandbox_name, error = %e, "ip discovery failed");
                self.set_state_best_effort(sandbox, SandboxState::Running).await;
                return Err(e);
            }
        };

        if let Err(e) = self.ensure_ip_unique(&sandbox.id, &ip).await {
            tracing::error!(sandbox_id = %sandbox.id, sandbox_name = %sandbox.sandbox_name, ip_address = %ip, mac_address = %mac, error = %e, "ip conflict");
            self.set_state_best_effort(sandbox, SandboxState::Running).await;
            return Err(e);
        }

        self.store
            .update_sandbox_state(&sandbox.id, SandboxState::Running, Some(&ip))
            .await?;
        sandbox.state = SandboxState::Running;
        sandbox.ip_address = Some(ip);
        Ok(())
    }

    async fn set_state_best_effort(&self, sandbox: &mut Sandbox, state: SandboxState) {
        if let Err(e) = self
            .store
            .update_sandbox_state(&sandbox.id, state, None)
            .await
        {
            tracing::warn!(sandbox_id = %sandbox.id, state = %state, error = %e, "failed to record sandbox state");
        }
        sandbox.state = state;
    }

    /// Fails with [`VirshboxError::Conflict`] if another running sandbox holds `ip`.
    async fn ensure_ip_unique(&self, sandbox_id: &str, ip: &str) -> VirshboxResult<()> {
        let running = self
            .store
            .list_sandboxes(
                &SandboxFilter {
                    state: Some(SandboxState::Running),
                    ..Default::default()
                },
                ListOptions::default(),
            )
            .await?;

        match running
            .iter()
            .find(|s| s.id != sandbox_id && s.ip_address.as_deref() == Some(ip))
        {
            Some(holder) => Err(VirshboxError::Conflict(format!(
                "IP {ip} is already assigned to sandbox {} (vm: {})",
                holder.id, holder.sandbox_name
            ))),
            None => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn require(label: &str, value: &str) -> VirshboxResult<()> {
    if value.trim().is_empty() {
        return Err(VirshboxError::InvalidArgument(format!("{label} is required")));
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, os::unix::fs::PermissionsExt};

    use super::*;
    use crate::{
        config::HostConfig,
        credentials::{CredentialManagerConfig, Ed25519Authority},
        exec::{CommandExecutor, CommandOutput},
        fleet::HostConnector,
        service::fake::{fail, manager, ok, FakeHost, FakeSsh, LEASED_IP},
        store::SqliteStore,
        virsh::SnapshotKind,
    };

    struct Fleet(HashMap<String, Arc<FakeHost>>);

    impl HostConnector for Fleet {
        fn connect(&self, host: &HostConfig) -> VirshboxResult<Arc<dyn CommandExecutor>> {
            self.0
                .get(host.get_name())
                .map(|h| h.clone() as Arc<dyn CommandExecutor>)
                .ok_or_else(|| VirshboxError::NotFound(host.get_name().clone()))
        }
    }

    async fn service(host: Arc<FakeHost>, ssh: Arc<FakeSsh>) -> anyhow::Result<SandboxService> {
        Ok(SandboxService::builder()
            .manager(manager(host))
            .store(Arc::new(SqliteStore::in_memory().await?))
            .config(
                ServiceConfig::builder()
                    .ip_discovery_timeout(Duration::from_millis(200))
                    .build(),
            )
            .ssh(ssh)
            .build())
    }

    fn create(name: &str) -> CreateSandboxRequest {
        CreateSandboxRequest::builder()
            .source("base-ubuntu")
            .agent_id("agent-1")
            .name(name)
            .auto_start(true)
            .wait_for_ip(true)
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_create_sandbox_boots_and_records_address() -> anyhow::Result<()> {
        let host = FakeHost::with_base_domain();
        let svc = service(host.clone(), FakeSsh::replying(ok(""))).await?;

        let sandbox = svc.create_sandbox(create("sbx-1")).await?;
        assert!(sandbox.id.starts_with(SANDBOX_ID_PREFIX));
        assert!(sandbox.job_id.starts_with(JOB_ID_PREFIX));
        assert_eq!(sandbox.sandbox_name, "sbx-1");
        assert_eq!(sandbox.base_image, "base-ubuntu");
        assert_eq!(sandbox.network, "default");
        assert_eq!(sandbox.state, SandboxState::Running);
        assert_eq!(sandbox.ip_address.as_deref(), Some(LEASED_IP));
        assert!(sandbox.host_name.is_none());

        let stored = svc.get_sandbox(&sandbox.id).await?;
        assert_eq!(stored.state, SandboxState::Running);
        assert_eq!(stored.ip_address.as_deref(), Some(LEASED_IP));

        assert!(host.called("qemu-img create"));
        assert!(host.called("define /jobs/sbx-1/"));
        assert!(host.called("start sbx-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_sandbox_defaults() -> anyhow::Result<()> {
        let svc = service(FakeHost::with_base_domain(), FakeSsh::replying(ok(""))).await?;

        let sandbox = svc
            .create_sandbox(
                CreateSandboxRequest::builder()
                    .source("base-ubuntu")
                    .agent_id("agent-1")
                    .build(),
            )
            .await?;
        assert!(sandbox.sandbox_name.starts_with(SANDBOX_NAME_PREFIX));
        assert_eq!(sandbox.state, SandboxState::Created);
        assert!(sandbox.ip_address.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_sandbox_requires_source_and_agent() -> anyhow::Result<()> {
        let svc = service(FakeHost::with_base_domain(), FakeSsh::replying(ok(""))).await?;

        let result = svc
            .create_sandbox(CreateSandboxRequest::builder().source("").agent_id("a").build())
            .await;
        assert!(matches!(result, Err(VirshboxError::InvalidArgument(_))));

        let result = svc
            .create_sandbox(
                CreateSandboxRequest::builder()
                    .source("base-ubuntu")
                    .agent_id(" ")
                    .build(),
            )
            .await;
        assert!(matches!(result, Err(VirshboxError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_sandbox_rejects_taken_name() -> anyhow::Result<()> {
        let svc = service(FakeHost::with_base_domain(), FakeSsh::replying(ok(""))).await?;
        svc.create_sandbox(create("sbx-1")).await?;

        let result = svc.create_sandbox(create("sbx-1")).await;
        assert!(matches!(result, Err(VirshboxError::AlreadyExists(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_start_marks_sandbox_errored() -> anyhow::Result<()> {
        let host = FakeHost::with_base_domain();
        host.answer(" start ", fail("error: failed to start domain"));
        let svc = service(host, FakeSsh::replying(ok(""))).await?;

        let result = svc.create_sandbox(create("sbx-1")).await;
        assert!(matches!(result, Err(VirshboxError::CommandFailed { .. })));

        let sandboxes = svc
            .list_sandboxes(&SandboxFilter::default(), ListOptions::default())
            .await?;
        assert_eq!(sandboxes.len(), 1);
        assert_eq!(sandboxes[0].state, SandboxState::Error);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_address_leaves_sandbox_running() -> anyhow::Result<()> {
        let host = FakeHost::with_base_domain();
        host.answer("domifaddr", ok(" Name MAC address Protocol Address\n---\n"));
        let svc = service(host, FakeSsh::replying(ok(""))).await?;

        let result = svc.create_sandbox(create("sbx-1")).await;
        assert!(matches!(
            result,
            Err(VirshboxError::IpNotFoundWithinTimeout { .. })
        ));

        let sandbox = svc
            .store()
            .get_sandbox_by_name("sbx-1")
            .await?;
        assert_eq!(sandbox.state, SandboxState::Running);
        assert!(sandbox.ip_address.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_address_is_a_conflict() -> anyhow::Result<()> {
        let svc = service(FakeHost::with_base_domain(), FakeSsh::replying(ok(""))).await?;
        let first = svc.create_sandbox(create("sbx-1")).await?;

        let result = svc.create_sandbox(create("sbx-2")).await;
        let Err(VirshboxError::Conflict(message)) = result else {
            panic!("expected an ip conflict, got {result:?}");
        };
        assert_eq!(
            message,
            format!(
                "IP {LEASED_IP} is already assigned to sandbox {} (vm: sbx-1)",
                first.id
            )
        );

        let second = svc.store().get_sandbox_by_name("sbx-2").await?;
        assert_eq!(second.state, SandboxState::Running);
        assert!(second.ip_address.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_start_and_destroy() -> anyhow::Result<()> {
        let host = FakeHost::with_base_domain();
        let svc = service(host.clone(), FakeSsh::replying(ok(""))).await?;
        let sandbox = svc.create_sandbox(create("sbx-1")).await?;

        let stopped = svc.stop_sandbox(&sandbox.id, false).await?;
        assert_eq!(stopped.state, SandboxState::Stopped);
        assert!(host.called("shutdown sbx-1"));
        let stored = svc.get_sandbox(&sandbox.id).await?;
        assert_eq!(stored.state, SandboxState::Stopped);
        assert_eq!(stored.ip_address.as_deref(), Some(LEASED_IP));

        let started = svc.start_sandbox(&sandbox.id, false).await?;
        assert_eq!(started.state, SandboxState::Running);

        let destroyed = svc.destroy_sandbox(&sandbox.id).await?;
        assert_eq!(destroyed.state, SandboxState::Destroyed);
        assert!(host.called("undefine sbx-1"));
        assert!(host.called("rm -rf /jobs/sbx-1"));
        assert!(matches!(
            svc.get_sandbox(&sandbox.id).await,
            Err(VirshboxError::NotFound(_))
        ));

        assert!(matches!(
            svc.stop_sandbox("SBX-missing", true).await,
            Err(VirshboxError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_with_caller_key() -> anyhow::Result<()> {
        let ssh = FakeSsh::replying(CommandOutput {
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            status: Some(3),
        });
        let svc = service(FakeHost::with_base_domain(), ssh.clone()).await?;
        let sandbox = svc.create_sandbox(create("sbx-1")).await?;

        let command = svc
            .run_command(
                RunCommandRequest::builder()
                    .sandbox_id(sandbox.id.clone())
                    .command("echo $GREETING")
                    .username("ubuntu")
                    .private_key_path("/keys/id_ed25519")
                    .env(BTreeMap::from([("GREETING".to_string(), "hello".to_string())]))
                    .build(),
            )
            .await?;
        assert!(command.id.starts_with(COMMAND_ID_PREFIX));
        assert_eq!(command.exit_code, 3);
        assert_eq!(command.stdout, "hello\n");
        assert_eq!(command.env_json.as_deref(), Some(r#"{"GREETING":"hello"}"#));

        let calls = ssh.calls();
        assert_eq!(calls.len(), 1);
        let (target, line) = &calls[0];
        assert_eq!(target.address, LEASED_IP);
        assert_eq!(target.user, "ubuntu");
        assert_eq!(target.private_key_path, PathBuf::from("/keys/id_ed25519"));
        assert!(target.certificate_path.is_none());
        assert!(line.starts_with("bash -lc "));
        assert!(line.contains("export GREETING="));

        let history = svc.list_commands(&sandbox.id, ListOptions::default()).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, command.id);
        assert_eq!(history[0].exit_code, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_requires_key_or_credentials() -> anyhow::Result<()> {
        let svc = service(FakeHost::with_base_domain(), FakeSsh::replying(ok(""))).await?;
        let sandbox = svc.create_sandbox(create("sbx-1")).await?;

        let result = svc
            .run_command(
                RunCommandRequest::builder()
                    .sandbox_id(sandbox.id.clone())
                    .command("id")
                    .build(),
            )
            .await;
        assert!(matches!(result, Err(VirshboxError::InvalidArgument(_))));

        let result = svc
            .run_command(
                RunCommandRequest::builder()
                    .sandbox_id(sandbox.id)
                    .command("id")
                    .private_key_path("/keys/id_ed25519")
                    .build(),
            )
            .await;
        assert!(matches!(result, Err(VirshboxError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_records_transport_failures() -> anyhow::Result<()> {
        let svc = service(FakeHost::with_base_domain(), FakeSsh::unreachable()).await?;
        let sandbox = svc.create_sandbox(create("sbx-1")).await?;

        let result = svc
            .run_command(
                RunCommandRequest::builder()
                    .sandbox_id(sandbox.id.clone())
                    .command("id")
                    .username("ubuntu")
                    .private_key_path("/keys/id_ed25519")
                    .build(),
            )
            .await;
        assert!(matches!(result, Err(VirshboxError::SshTransport { .. })));

        let history = svc.list_commands(&sandbox.id, ListOptions::default()).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].exit_code, SSH_TRANSPORT_EXIT_CODE);
        assert!(history[0].stderr.contains("Connection refused"));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_with_managed_credentials() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(Ed25519Authority::generate(Duration::from_secs(600))),
            CredentialManagerConfig::builder()
                .key_dir(dir.path().join("keys"))
                .build(),
        ));
        let ssh = FakeSsh::replying(ok("uid=1000(sandbox)\n"));
        let svc = SandboxService::builder()
            .manager(manager(FakeHost::with_base_domain()))
            .store(Arc::new(SqliteStore::in_memory().await?))
            .credentials(Some(credentials.clone()))
            .ssh(ssh.clone())
            .build();
        let sandbox = svc.create_sandbox(create("sbx-1")).await?;

        let command = svc
            .run_command(
                RunCommandRequest::builder()
                    .sandbox_id(sandbox.id.clone())
                    .command("id")
                    .build(),
            )
            .await?;
        assert_eq!(command.exit_code, 0);

        let (target, _) = &ssh.calls()[0];
        assert_eq!(target.user, "sandbox");
        let cert = target.certificate_path.clone().unwrap();
        assert!(cert.exists());
        let mode = std::fs::metadata(&target.private_key_path)?.permissions().mode();
        assert_eq!(mode & 0o077, 0);

        let sandbox_dir = credentials.sandbox_dir(&sandbox.id);
        assert!(sandbox_dir.exists());
        svc.destroy_sandbox(&sandbox.id).await?;
        assert!(!sandbox_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshots_and_diff() -> anyhow::Result<()> {
        let svc = service(FakeHost::with_base_domain(), FakeSsh::replying(ok(""))).await?;
        let sandbox = svc.create_sandbox(create("sbx-1")).await?;

        let before = svc.create_snapshot(&sandbox.id, "before", false).await?;
        assert!(before.id.starts_with(SNAPSHOT_ID_PREFIX));
        assert_eq!(before.kind, SnapshotKind::Internal);
        assert_eq!(before.reference, "before");

        let after = svc.create_snapshot(&sandbox.id, "after", true).await?;
        assert_eq!(after.kind, SnapshotKind::External);
        assert!(after.reference.ends_with(".qcow2"));

        for cmd in ["apt-get update", "touch /tmp/x"] {
            svc.run_command(
                RunCommandRequest::builder()
                    .sandbox_id(sandbox.id.clone())
                    .command(cmd)
                    .username("ubuntu")
                    .private_key_path("/keys/id_ed25519")
                    .build(),
            )
            .await?;
        }

        let diff = svc.diff_snapshots(&sandbox.id, "before", "after").await?;
        assert!(diff.id.starts_with(DIFF_ID_PREFIX));
        assert!(diff.diff.files_added.is_empty());
        assert!(diff.diff.packages_added.is_empty());
        let cmds: Vec<_> = diff.diff.commands_run.iter().map(|c| c.cmd.as_str()).collect();
        assert_eq!(cmds, ["apt-get update", "touch /tmp/x"]);

        let stored = svc
            .store()
            .get_diff_by_snapshots(&sandbox.id, "before", "after")
            .await?;
        assert_eq!(stored.id, diff.id);

        assert!(matches!(
            svc.diff_snapshots(&sandbox.id, "", "after").await,
            Err(VirshboxError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_sandbox_follows_its_fleet_host() -> anyhow::Result<()> {
        let local = FakeHost::empty();
        let remote = FakeHost::with_base_domain();
        let fleet = MultiHostDiscovery::new(
            vec![
                HostConfig::builder().name("h1").address("10.0.0.1").build(),
                HostConfig::builder().name("h2").address("10.0.0.2").build(),
            ],
            Arc::new(Fleet(HashMap::from([
                ("h1".to_string(), FakeHost::empty()),
                ("h2".to_string(), remote.clone()),
            ]))),
        );
        let svc = SandboxService::builder()
            .manager(manager(local.clone()))
            .store(Arc::new(SqliteStore::in_memory().await?))
            .ssh(FakeSsh::replying(ok("")) as Arc<dyn SshRunner>)
            .fleet(Some(fleet))
            .build();

        let sandbox = svc.create_sandbox(create("sbx-1")).await?;
        assert_eq!(sandbox.host_name.as_deref(), Some("h2"));
        assert_eq!(sandbox.host_address.as_deref(), Some("10.0.0.2"));
        assert!(remote.called("start sbx-1"));
        assert!(!local.called("start sbx-1"));

        svc.stop_sandbox(&sandbox.id, true).await?;
        assert!(remote.called("destroy sbx-1"));
        assert!(!local.called("destroy sbx-1"));
        Ok(())
    }
}
