use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use super::{
    parse_arp_ip, parse_df_available_mb, parse_dhcp_lease_ip, parse_domain_names,
    parse_domifaddr_ipv4, parse_domiflist_mac, parse_dominfo, parse_net_bridge,
    parse_nodeinfo_cpus, parse_nodememstats, parse_primary_disk_path, CloudInitSeed, DomainInfo,
    DomainRef, DomainState, FsComparePlan, ResourceCheckResult, SnapshotKind, SnapshotRef,
    ValidationResult,
};
use crate::{
    config::{
        SshKeyInjectMethod, VirshboxConfig, DEFAULT_BASE_IMAGE_DIR, DEFAULT_LIBVIRT_URI,
        DEFAULT_MEMORY_MB, DEFAULT_NETWORK, DEFAULT_SANDBOX_USER, DEFAULT_VCPUS, DEFAULT_WORK_DIR,
    },
    domain::{
        clone_descriptor, render_domain, Arch, ArchProfile, Backend, CloneOptions,
        DomainDescriptor, DomainSpec, MacAddress, NetworkMode, SOCKET_VMNET_NETWORK,
    },
    exec::{shell_escape, validate_shell_input, CommandExecutor, CommandLine},
    utils::{
        short_id, TeardownReport, DOMAIN_XML_FILENAME, OVERLAY_DISK_FILENAME, SEED_ISO_FILENAME,
        SEED_SOURCE_SUBDIR, SNAPSHOT_FILE_PREFIX,
    },
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often lease and ARP tables are polled while waiting for an address.
pub const IP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Free space in the work directory below which a sandbox cannot be created, in MiB.
pub const MIN_DISK_MB: u64 = 1024;

/// Free space in the work directory below which a warning is raised, in MiB.
pub const LOW_DISK_MB: u64 = 10 * 1024;

/// The seed image attached by the cloud-init key injection path.
const KEY_SEED_ISO_FILENAME: &str = "seed.iso";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings a [`DomainManager`] needs from the wider configuration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct DomainManagerConfig {
    /// The URI passed to `virsh --connect`. Empty leaves virsh to its default.
    #[builder(default = DEFAULT_LIBVIRT_URI.to_string(), setter(into))]
    pub uri: String,

    /// The network clones attach to when the caller names none.
    #[builder(default = DEFAULT_NETWORK.to_string(), setter(into))]
    pub network: String,

    /// Where base images for [`DomainManager::create_from_image`] live.
    #[builder(default = PathBuf::from(DEFAULT_BASE_IMAGE_DIR), setter(into))]
    pub base_image_dir: PathBuf,

    /// The parent of every clone's job directory.
    #[builder(default = PathBuf::from(DEFAULT_WORK_DIR), setter(into))]
    pub work_dir: PathBuf,

    /// How [`DomainManager::inject_ssh_key`] gets keys into a guest.
    #[builder(default)]
    pub ssh_key_inject_method: SshKeyInjectMethod,

    /// The emulator wrapper for socket_vmnet networking.
    #[builder(default, setter(strip_option, into))]
    pub socket_vmnet_wrapper: Option<PathBuf>,

    /// The architecture of generated descriptors.
    #[builder(default = Arch::X86_64)]
    pub arch: Arch,

    /// The backend of generated descriptors.
    #[builder(default = Backend::Kvm)]
    pub backend: Backend,

    /// The machine type of generated descriptors.
    #[builder(default, setter(strip_option, into))]
    pub machine: Option<String>,

    /// vCPUs used when the caller passes zero.
    #[builder(default = DEFAULT_VCPUS)]
    pub default_vcpus: u32,

    /// Memory in MiB used when the caller passes zero.
    #[builder(default = DEFAULT_MEMORY_MB)]
    pub default_memory_mb: u32,

    /// The user certificate CA written into clone seeds.
    #[builder(default, setter(strip_option, into))]
    pub ca_public_key: Option<String>,

    /// The account CA-signed certificates log in as.
    #[builder(default = DEFAULT_SANDBOX_USER.to_string(), setter(into))]
    pub sandbox_user: String,

    /// How often address discovery polls.
    #[builder(default = IP_POLL_INTERVAL)]
    pub ip_poll_interval: Duration,
}

/// Drives one hypervisor host through `virsh`, `qemu-img` and the seed tools.
///
/// Every command goes through the manager's [`CommandExecutor`], so the same code manages the
/// local host and a remote one reached over SSH.
#[derive(Clone)]
pub struct DomainManager {
    executor: Arc<dyn CommandExecutor>,
    config: DomainManagerConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DomainManagerConfig {
    /// Takes the libvirt, vm and ssh settings from `config`.
    pub fn from_config(
        config: &VirshboxConfig,
        ca_public_key: Option<String>,
    ) -> VirshboxResult<Self> {
        let libvirt = config.get_libvirt();
        let vm = config.get_vm();

        Ok(Self {
            uri: libvirt.get_uri().clone(),
            network: libvirt.get_network().clone(),
            base_image_dir: libvirt.get_base_image_dir().clone(),
            work_dir: libvirt.get_work_dir().clone(),
            ssh_key_inject_method: *libvirt.get_ssh_key_inject_method(),
            socket_vmnet_wrapper: libvirt.get_socket_vmnet_wrapper().clone(),
            arch: libvirt.get_arch().parse()?,
            backend: libvirt.get_domain_type().parse()?,
            machine: libvirt.get_machine().clone(),
            default_vcpus: *vm.get_default_vcpus(),
            default_memory_mb: *vm.get_default_memory_mb(),
            ca_public_key: ca_public_key.filter(|k| !k.trim().is_empty()),
            sandbox_user: config.get_ssh().get_default_user().clone(),
            ip_poll_interval: IP_POLL_INTERVAL,
        })
    }
}

impl DomainManager {
    /// Creates a manager that runs its commands through `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>, config: DomainManagerConfig) -> Self {
        Self { executor, config }
    }

    /// The executor commands run through.
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// The manager's settings.
    pub fn config(&self) -> &DomainManagerConfig {
        &self.config
    }

    /// Whether the managed host is reached over SSH.
    pub fn is_remote(&self) -> bool {
        self.executor.is_remote()
    }

    /// The job directory of `name`.
    pub fn job_dir(&self, name: &str) -> PathBuf {
        self.config.work_dir.join(name)
    }

    /// Clones `source` into a new domain `new_name` backed by an overlay on the source's disk.
    ///
    /// Zero `vcpus` or `memory_mb` and a missing `network` fall back to the configured defaults.
    pub async fn clone_from(
        &self,
        source: &str,
        new_name: &str,
        vcpus: u32,
        memory_mb: u32,
        network: Option<&str>,
    ) -> VirshboxResult<DomainRef> {
        require("source domain name", source)?;
        require_path_component("new domain name", new_name)?;
        let network = self.network_or_default(network)?;
        let (vcpus, memory_mb) = self.sizing_or_default(vcpus, memory_mb);

        tracing::info!(
            host = %self.executor.target(),
            source = source,
            domain = new_name,
            vcpus,
            memory_mb,
            network = %network,
            "cloning domain"
        );

        self.ensure_absent(new_name).await?;

        let blocks = self.virsh_stdout(&["domblklist", source, "--details"]).await?;
        let base_disk = parse_primary_disk_path(&blocks).ok_or_else(|| {
            VirshboxError::NotFound(format!("disk path for source domain {source:?}"))
        })?;
        let source_xml = self.virsh_stdout(&["dumpxml", source]).await?;

        let job_dir = self.job_dir(new_name);
        self.executor.create_dir_all(&job_dir).await?;

        let provisioned = async {
            let overlay = self.create_overlay(Path::new(&base_disk), &job_dir).await?;
            let seed = self.build_clone_seed(new_name, &job_dir).await;

            let options = CloneOptions::builder()
                .new_name(new_name)
                .disk_path(overlay.to_string_lossy())
                .vcpus(vcpus)
                .memory_mb(memory_mb)
                .network(network.clone())
                .build();
            let options = CloneOptions {
                boot_media_path: seed.map(|p| p.to_string_lossy().into_owned()),
                ..options
            };

            let xml = clone_descriptor(&source_xml, &options)?;
            self.define(&job_dir, &xml).await
        }
        .await;

        if let Err(e) = provisioned {
            self.discard_job_dir(&job_dir).await;
            return Err(e);
        }

        let uuid = self.domain_uuid(new_name).await;
        tracing::info!(domain = new_name, uuid = ?uuid, "domain cloned");

        Ok(DomainRef {
            name: new_name.to_string(),
            uuid,
        })
    }

    /// Creates a new domain from a base image in the base image directory, generating its
    /// descriptor from scratch.
    pub async fn create_from_image(
        &self,
        image: &str,
        new_name: &str,
        vcpus: u32,
        memory_mb: u32,
        network: Option<&str>,
    ) -> VirshboxResult<DomainRef> {
        require_path_component("base image", image)?;
        require_path_component("new domain name", new_name)?;
        let network = self.network_or_default(network)?;
        let (vcpus, memory_mb) = self.sizing_or_default(vcpus, memory_mb);

        let base_disk = self.config.base_image_dir.join(image);
        if !self.executor.path_exists(&base_disk).await? {
            return Err(VirshboxError::NotFound(format!(
                "base image {}",
                base_disk.display()
            )));
        }

        tracing::info!(
            host = %self.executor.target(),
            image = image,
            domain = new_name,
            vcpus,
            memory_mb,
            network = %network,
            "creating domain from image"
        );

        self.ensure_absent(new_name).await?;

        let job_dir = self.job_dir(new_name);
        self.executor.create_dir_all(&job_dir).await?;

        let provisioned = async {
            let overlay = self.create_overlay(&base_disk, &job_dir).await?;
            let seed = self.build_clone_seed(new_name, &job_dir).await;

            let profile = ArchProfile::new(
                self.config.arch,
                self.config.backend,
                self.config.machine.as_deref(),
            );
            let spec = DomainSpec {
                boot_media_path: seed.map(|p| p.to_string_lossy().into_owned()),
                ..DomainSpec::builder()
                    .name(new_name)
                    .memory_mb(memory_mb)
                    .vcpus(vcpus)
                    .disk_path(overlay.to_string_lossy())
                    .network(NetworkMode::from_name(
                        &network,
                        self.config.socket_vmnet_wrapper.clone(),
                    ))
                    .profile(profile)
                    .build()
            };

            let xml = render_domain(&spec)?.to_xml()?;
            self.define(&job_dir, &xml).await
        }
        .await;

        if let Err(e) = provisioned {
            self.discard_job_dir(&job_dir).await;
            return Err(e);
        }

        let uuid = self.domain_uuid(new_name).await;
        Ok(DomainRef {
            name: new_name.to_string(),
            uuid,
        })
    }

    /// Authorizes `public_key` for `username` inside the not yet booted domain `name`.
    pub async fn inject_ssh_key(
        &self,
        name: &str,
        username: &str,
        public_key: &str,
    ) -> VirshboxResult<()> {
        require_path_component("domain name", name)?;
        require("username", username)?;
        require("public key", public_key)?;
        let public_key = public_key.trim();

        let job_dir = self.job_dir(name);
        let overlay = job_dir.join(OVERLAY_DISK_FILENAME);
        if !self.executor.path_exists(&overlay).await? {
            return Err(VirshboxError::NotFound(format!(
                "overlay for domain {name:?} at {}",
                overlay.display()
            )));
        }

        match self.config.ssh_key_inject_method {
            SshKeyInjectMethod::VirtCustomize => {
                let user = shell_escape(username)?;
                self.executor
                    .run_checked(
                        CommandLine::new("virt-customize")
                            .arg("-a")
                            .arg(overlay.to_string_lossy())
                            .arg("--run-command")
                            .arg(format!(
                                "id -u {user} >/dev/null 2>&1 || useradd -m -s /bin/bash {user}"
                            ))
                            .arg("--ssh-inject")
                            .arg(format!("{username}:string:{public_key}")),
                    )
                    .await?;
            }
            SshKeyInjectMethod::CloudInit => {
                let mut seed = CloudInitSeed::builder()
                    .instance_id(fresh_instance_id(name))
                    .hostname(name)
                    .sandbox_user(self.config.sandbox_user.clone())
                    .authorized_key((username.to_string(), public_key.to_string()))
                    .build();
                seed.ca_public_key = self.config.ca_public_key.clone();

                let iso = job_dir.join(KEY_SEED_ISO_FILENAME);
                seed.build(
                    self.executor.as_ref(),
                    &job_dir.join(SEED_SOURCE_SUBDIR),
                    &iso,
                )
                .await?;

                let mut descriptor =
                    DomainDescriptor::parse(&self.virsh_stdout(&["dumpxml", name]).await?)?;
                descriptor.set_boot_media_path(&iso.to_string_lossy())?;
                self.define(&job_dir, &descriptor.to_xml()?).await?;
            }
        }

        tracing::info!(domain = name, user = username, method = %self.config.ssh_key_inject_method, "ssh key injected");
        Ok(())
    }

    /// Boots the domain.
    pub async fn start(&self, name: &str) -> VirshboxResult<()> {
        require("domain name", name)?;
        tracing::info!(host = %self.executor.target(), domain = name, "starting domain");
        self.virsh_stdout(&["start", name]).await?;

        match self.get_state(name).await {
            Ok(DomainState::Running) => {}
            Ok(state) => tracing::warn!(
                domain = name,
                state = %state,
                "domain is not running after start"
            ),
            Err(e) => tracing::warn!(domain = name, error = %e, "could not verify domain state"),
        }

        Ok(())
    }

    /// Asks the guest to shut down, or powers it off when `force` is set.
    pub async fn stop(&self, name: &str, force: bool) -> VirshboxResult<()> {
        require("domain name", name)?;
        let verb = if force { "destroy" } else { "shutdown" };
        tracing::info!(domain = name, force, "stopping domain");
        self.virsh_stdout(&[verb, name]).await?;
        Ok(())
    }

    /// Tears the domain down as far as possible: power off, undefine, release its DHCP lease
    /// and remove its job directory.
    ///
    /// Each step runs even if earlier ones failed; the returned report lists what went wrong.
    pub async fn destroy(&self, name: &str) -> VirshboxResult<TeardownReport> {
        require_path_component("domain name", name)?;
        tracing::info!(host = %self.executor.target(), domain = name, "destroying domain");

        let mut report = TeardownReport::new();
        let mac = report.step("lookup mac", self.get_mac_address(name)).await;

        // Fails whenever the domain is already off.
        if let Err(e) = self.virsh_stdout(&["destroy", name]).await {
            tracing::debug!(domain = name, error = %e, "destroy before undefine failed");
        }

        report.step("undefine", self.virsh_stdout(&["undefine", name])).await;

        if let Some(mac) = mac {
            report
                .step(
                    "release dhcp lease",
                    self.release_dhcp_lease(&self.config.network, &mac),
                )
                .await;
        }

        report
            .step(
                "remove job directory",
                self.executor.remove_dir_all(&self.job_dir(name)),
            )
            .await;

        Ok(report)
    }

    /// Removes any static DHCP entry for `mac` and releases its dynamic lease on `network`.
    pub async fn release_dhcp_lease(&self, network: &str, mac: &str) -> VirshboxResult<()> {
        require("network", network)?;
        require("mac address", mac)?;
        if NetworkMode::from_name(network, None).libvirt_network().is_none() {
            return Ok(());
        }

        let host_entry = format!("<host mac='{mac}'/>");
        if let Err(e) = self
            .virsh_stdout(&[
                "net-update",
                network,
                "delete",
                "ip-dhcp-host",
                host_entry.as_str(),
                "--live",
                "--config",
            ])
            .await
        {
            tracing::debug!(network = network, mac = mac, error = %e, "no static dhcp entry removed");
        }

        let bridge = self
            .virsh_stdout(&["net-info", network])
            .await
            .ok()
            .and_then(|out| parse_net_bridge(&out));
        let ip = self
            .virsh_stdout(&["net-dhcp-leases", network])
            .await
            .ok()
            .and_then(|out| parse_dhcp_lease_ip(&out, mac));

        let (Some(bridge), Some(ip)) = (bridge, ip) else {
            tracing::debug!(network = network, mac = mac, "no active lease to release");
            return Ok(());
        };

        self.executor
            .run_checked(CommandLine::new("dhcp_release").args([bridge.as_str(), ip.as_str(), mac]))
            .await?;

        tracing::info!(network = network, bridge = %bridge, ip = %ip, mac = mac, "released dhcp lease");
        Ok(())
    }

    /// Snapshots the domain, either inside its image or as a disk-only overlay in the job
    /// directory.
    pub async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        external: bool,
    ) -> VirshboxResult<SnapshotRef> {
        require_path_component("domain name", name)?;
        require_path_component("snapshot name", snapshot)?;

        if external {
            let path = self.snapshot_path(name, snapshot);
            let diskspec = format!("vda,file={}", path.display());
            self.virsh_stdout(&[
                "snapshot-create-as",
                name,
                snapshot,
                "--disk-only",
                "--atomic",
                "--no-metadata",
                "--diskspec",
                diskspec.as_str(),
            ])
            .await?;

            tracing::info!(domain = name, snapshot = snapshot, path = %path.display(), "external snapshot created");
            return Ok(SnapshotRef {
                name: snapshot.to_string(),
                kind: SnapshotKind::External,
                reference: path.to_string_lossy().into_owned(),
            });
        }

        self.virsh_stdout(&["snapshot-create-as", name, snapshot])
            .await?;

        tracing::info!(domain = name, snapshot = snapshot, "internal snapshot created");
        Ok(SnapshotRef {
            name: snapshot.to_string(),
            kind: SnapshotKind::Internal,
            reference: snapshot.to_string(),
        })
    }

    /// Describes how to compare the filesystems of two snapshots.
    ///
    /// Nothing is mounted; the plan is guidance for an operator.
    pub async fn diff_snapshot(
        &self,
        name: &str,
        from: &str,
        to: &str,
    ) -> VirshboxResult<FsComparePlan> {
        require_path_component("domain name", name)?;
        require_path_component("from snapshot", from)?;
        require_path_component("to snapshot", to)?;

        let mut plan = FsComparePlan {
            vm_name: name.to_string(),
            from_snapshot: from.to_string(),
            to_snapshot: to.to_string(),
            ..Default::default()
        };

        if self.is_remote() {
            plan.notes.push(format!(
                "Remote host snapshot diffing on {} - manual intervention required",
                self.executor.target()
            ));
            return Ok(plan);
        }

        let from_path = self.snapshot_path(name, from);
        let to_path = self.snapshot_path(name, to);
        if self.executor.path_exists(&from_path).await?
            && self.executor.path_exists(&to_path).await?
        {
            let from_arg = shell_escape(&from_path.to_string_lossy())?;
            let to_arg = shell_escape(&to_path.to_string_lossy())?;
            plan.notes = vec![
                "External snapshots detected. You can mount them with qemu-nbd and diff the trees.".to_string(),
                format!("sudo modprobe nbd max_part=16 && sudo qemu-nbd --connect=/dev/nbd0 {from_arg}"),
                format!("sudo qemu-nbd --connect=/dev/nbd1 {to_arg}"),
                "sudo mount /dev/nbd0p1 /mnt/from && sudo mount /dev/nbd1p1 /mnt/to".to_string(),
                "Then run: sudo diff -ruN /mnt/from /mnt/to or use rsync --dry-run to list changes.".to_string(),
                "Be sure to umount and disconnect nbd after.".to_string(),
            ];
            plan.from_mount = Some(PathBuf::from("/mnt/from"));
            plan.to_mount = Some(PathBuf::from("/mnt/to"));
            plan.from_ref = Some(from_path);
            plan.to_ref = Some(to_path);
            return Ok(plan);
        }

        plan.notes = vec![
            "Internal snapshots assumed. Use qemu-nbd with -s to select snapshot, then mount and diff.".to_string(),
            "For example: qemu-nbd may support --snapshot=<name> (varies by version) or use qemu-img to create temporary exports.".to_string(),
            "Alternatively, boot the VM into each snapshot separately and export filesystem states.".to_string(),
        ];
        Ok(plan)
    }

    /// Polls for the domain's IPv4 address until one appears, `timeout` elapses or `cancel`
    /// fires. Returns the address and the MAC it was leased to.
    ///
    /// Libvirt networks are polled through their lease table. socket_vmnet guests get their
    /// address from a DHCP server libvirt does not see, so the host's ARP table is used.
    pub async fn get_ip_address(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> VirshboxResult<(String, String)> {
        require("domain name", name)?;

        let started = Instant::now();
        let deadline = started + timeout;
        let timed_out = || VirshboxError::IpNotFoundWithinTimeout {
            name: name.to_string(),
            timeout,
        };

        match within(deadline, cancel, self.get_state(name)).await? {
            Some(Ok(DomainState::Running)) | Some(Err(_)) | None => {}
            Some(Ok(state)) => tracing::warn!(
                domain = name,
                state = %state,
                "looking for the address of a domain that is not running"
            ),
        }

        let via_arp = self.config.network == SOCKET_VMNET_NETWORK;
        let mac = if via_arp {
            let mac = within(deadline, cancel, self.get_mac_address(name))
                .await?
                .ok_or_else(timed_out)??;
            Some(mac.parse::<MacAddress>()?)
        } else {
            None
        };

        tracing::info!(domain = name, timeout_secs = timeout.as_secs(), via_arp, "discovering ip address");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let lookup = async {
                match &mac {
                    Some(mac) => self.lookup_arp(mac).await,
                    None => self.lookup_lease(name).await,
                }
            };

            if let Some((ip, lease_mac)) = within(deadline, cancel, lookup).await?.flatten() {
                tracing::info!(
                    domain = name,
                    ip = %ip,
                    mac = %lease_mac,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ip address discovered"
                );
                return Ok((ip, lease_mac));
            }

            if attempts % 10 == 0 {
                tracing::debug!(domain = name, attempts, "still waiting for an ip address");
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let pause = self.config.ip_poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(VirshboxError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }

        let state = within(
            Instant::now() + self.config.ip_poll_interval,
            cancel,
            self.get_state(name),
        )
        .await
        .ok()
        .flatten()
        .and_then(Result::ok)
        .unwrap_or(DomainState::Unknown);
        tracing::error!(domain = name, attempts, state = %state, "ip address discovery timed out");

        Err(timed_out())
    }

    /// The domain's lifecycle state.
    pub async fn get_state(&self, name: &str) -> VirshboxResult<DomainState> {
        require("domain name", name)?;
        let out = self.virsh_stdout(&["domstate", name]).await?;
        Ok(DomainState::from_virsh(&out))
    }

    /// The MAC of the domain's first interface. Works whether or not the domain is running.
    pub async fn get_mac_address(&self, name: &str) -> VirshboxResult<String> {
        require("domain name", name)?;
        let out = self.virsh_stdout(&["domiflist", name]).await?;
        if let Some(mac) = parse_domiflist_mac(&out) {
            return Ok(mac);
        }

        // socket_vmnet NICs live in the qemu command line and do not show up in domiflist.
        let descriptor = DomainDescriptor::parse(&self.virsh_stdout(&["dumpxml", name]).await?)?;
        descriptor
            .mac_address()
            .ok_or_else(|| VirshboxError::NotFound(format!("mac address of domain {name:?}")))
    }

    /// The domain's `dominfo` fields.
    pub async fn domain_info(&self, name: &str) -> VirshboxResult<DomainInfo> {
        require("domain name", name)?;
        let out = self.virsh_stdout(&["dominfo", name]).await?;
        Ok(parse_dominfo(&out))
    }

    /// The backing file of the domain's primary disk.
    pub async fn primary_disk_path(&self, name: &str) -> VirshboxResult<Option<String>> {
        require("domain name", name)?;
        let out = self.virsh_stdout(&["domblklist", name, "--details"]).await?;
        Ok(parse_primary_disk_path(&out))
    }

    /// Whether a domain called `name` is defined. Only a failing transport is an error.
    pub async fn domain_exists(&self, name: &str) -> VirshboxResult<bool> {
        require("domain name", name)?;
        let output = self.executor.run(self.virsh(&["dominfo", name])).await?;
        Ok(output.success())
    }

    /// Names of every domain on the host, running or not.
    pub async fn list_domains(&self) -> VirshboxResult<Vec<String>> {
        let out = self.virsh_stdout(&["list", "--all", "--name"]).await?;
        Ok(parse_domain_names(&out))
    }

    /// Checks that `name` is in a state worth cloning from.
    ///
    /// Only a failed state lookup makes the result invalid; other failed checks become warnings.
    pub async fn validate_source(&self, name: &str) -> VirshboxResult<ValidationResult> {
        require("domain name", name)?;
        let mut result = ValidationResult::new(name);

        match self.get_state(name).await {
            Ok(state) => result.state = state,
            Err(e) => {
                result.valid = false;
                result.errors.push(format!("Failed to get VM state: {e}"));
                return Ok(result);
            }
        }

        match self.virsh_stdout(&["domiflist", name]).await {
            Ok(out) => {
                if let Some(mac) = parse_domiflist_mac(&out) {
                    result.mac_address = Some(mac);
                    result.has_network = true;
                }
            }
            Err(e) => result
                .warnings
                .push(format!("Could not get network interfaces: {e}")),
        }

        if result.mac_address.is_none() {
            result.warnings.push(
                "Could not find MAC address - source VM may not have a network interface"
                    .to_string(),
            );
        }

        match result.state {
            DomainState::Running => {
                if let Some((ip, mac)) = self.lookup_lease(name).await {
                    result.ip_address = Some(ip);
                    if result.mac_address.is_none() {
                        result.mac_address = Some(mac);
                    }
                } else {
                    result
                        .warnings
                        .push("Source VM is running but has no IP address assigned".to_string());
                    result.warnings.push(
                        "This may indicate cloud-init or DHCP issues - cloned sandboxes may also fail to get IPs"
                            .to_string(),
                    );
                }
            }
            DomainState::ShutOff => result.warnings.push(
                "Source VM is shut off - cannot verify network configuration (IP/DHCP)"
                    .to_string(),
            ),
            _ => {}
        }

        Ok(result)
    }

    /// Checks whether the host has room for a sandbox with `vcpus` and `memory_mb`.
    pub async fn check_host_resources(
        &self,
        vcpus: u32,
        memory_mb: u32,
    ) -> VirshboxResult<ResourceCheckResult> {
        let (vcpus, memory_mb) = self.sizing_or_default(vcpus, memory_mb);
        let host = self.executor.target();
        let mut result = ResourceCheckResult {
            valid: true,
            required_cpus: vcpus,
            required_memory_mb: memory_mb,
            ..Default::default()
        };

        match self.virsh_stdout(&["nodeinfo"]).await {
            Ok(out) => {
                result.available_cpus = parse_nodeinfo_cpus(&out).unwrap_or(0);
                if vcpus > result.available_cpus {
                    result.valid = false;
                    result.errors.push(format!(
                        "Insufficient CPUs on {host}: need {vcpus} but only {} available",
                        result.available_cpus
                    ));
                }
            }
            Err(e) => result
                .warnings
                .push(format!("Could not check CPUs on {host}: {e}")),
        }

        match self.virsh_stdout(&["nodememstats"]).await {
            Ok(out) => {
                let (total, free) = parse_nodememstats(&out);
                result.total_memory_mb = total;
                result.available_memory_mb = free;

                let required = u64::from(memory_mb);
                if total > 0 {
                    if required > free {
                        result.valid = false;
                        result.errors.push(format!(
                            "Insufficient memory on {host}: need {memory_mb} MB but only {free} MB available"
                        ));
                    } else if required as f64 > free as f64 * 0.8 {
                        result.warnings.push(format!(
                            "Low memory warning on {host}: requesting {memory_mb} MB of {free} MB available"
                        ));
                    }
                }
            }
            Err(e) => result
                .warnings
                .push(format!("Could not check memory on {host}: {e}")),
        }

        let work_dir = self.config.work_dir.to_string_lossy().into_owned();
        let df = shell_escape(&work_dir).map(|dir| {
            CommandLine::new("sh")
                .arg("-c")
                .arg(format!("df -m {dir} | tail -1 | awk '{{print $4}}'"))
        });
        let available = match df {
            Ok(command) => self
                .executor
                .run_checked(command)
                .await
                .map(|out| parse_df_available_mb(&out.stdout).unwrap_or(0)),
            Err(e) => Err(e),
        };

        match available {
            Ok(available) => {
                result.available_disk_mb = available;
                if available < MIN_DISK_MB {
                    result.valid = false;
                    result.errors.push(format!(
                        "Insufficient disk space on {host}: only {available} MB available in {work_dir}"
                    ));
                } else if available < LOW_DISK_MB {
                    result.warnings.push(format!(
                        "Low disk space warning on {host}: only {available} MB available in {work_dir}"
                    ));
                }
            }
            Err(e) => result
                .warnings
                .push(format!("Could not check disk space on {host}: {e}")),
        }

        Ok(result)
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: Helpers
//--------------------------------------------------------------------------------------------------

impl DomainManager {
    fn virsh(&self, args: &[&str]) -> CommandLine {
        let command = CommandLine::new("virsh");
        let command = if self.config.uri.is_empty() {
            command
        } else {
            command.arg("--connect").arg(self.config.uri.as_str())
        };

        command.args(args.iter().copied())
    }

    async fn virsh_stdout(&self, args: &[&str]) -> VirshboxResult<String> {
        let output = self.executor.run_checked(self.virsh(args)).await?;
        Ok(output.stdout)
    }

    fn network_or_default(&self, network: Option<&str>) -> VirshboxResult<String> {
        let network = network
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.config.network);
        validate_shell_input(network)?;
        Ok(network.to_string())
    }

    fn sizing_or_default(&self, vcpus: u32, memory_mb: u32) -> (u32, u32) {
        let vcpus = if vcpus == 0 {
            self.config.default_vcpus
        } else {
            vcpus
        };
        let memory_mb = if memory_mb == 0 {
            self.config.default_memory_mb
        } else {
            memory_mb
        };
        (vcpus, memory_mb)
    }

    fn snapshot_path(&self, name: &str, snapshot: &str) -> PathBuf {
        self.job_dir(name)
            .join(format!("{SNAPSHOT_FILE_PREFIX}{snapshot}.qcow2"))
    }

    async fn ensure_absent(&self, name: &str) -> VirshboxResult<()> {
        if self.domain_exists(name).await? {
            return Err(VirshboxError::AlreadyExists(format!("domain {name:?}")));
        }
        Ok(())
    }

    async fn create_overlay(&self, base: &Path, job_dir: &Path) -> VirshboxResult<PathBuf> {
        let overlay = job_dir.join(OVERLAY_DISK_FILENAME);
        self.executor
            .run_checked(
                CommandLine::new("qemu-img")
                    .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
                    .arg(base.to_string_lossy())
                    .arg(overlay.to_string_lossy()),
            )
            .await?;

        tracing::debug!(base = %base.display(), overlay = %overlay.display(), "overlay created");
        Ok(overlay)
    }

    /// Builds the seed that gives a clone a fresh cloud-init identity. A clone without one still
    /// boots, so failures only warn.
    async fn build_clone_seed(&self, name: &str, job_dir: &Path) -> Option<PathBuf> {
        let mut seed = CloudInitSeed::builder()
            .instance_id(fresh_instance_id(name))
            .hostname(name)
            .sandbox_user(self.config.sandbox_user.clone())
            .build();
        seed.ca_public_key = self.config.ca_public_key.clone();

        let iso = job_dir.join(SEED_ISO_FILENAME);
        match seed
            .build(
                self.executor.as_ref(),
                &job_dir.join(SEED_SOURCE_SUBDIR),
                &iso,
            )
            .await
        {
            Ok(()) => Some(iso),
            Err(e) => {
                tracing::warn!(
                    domain = name,
                    error = %e,
                    "could not build cloud-init seed, clone may keep the source's network identity"
                );
                None
            }
        }
    }

    async fn define(&self, job_dir: &Path, xml: &str) -> VirshboxResult<()> {
        let path = job_dir.join(DOMAIN_XML_FILENAME);
        self.executor.write_file(&path, xml.as_bytes()).await?;

        let path = path.to_string_lossy();
        self.virsh_stdout(&["define", path.as_ref()]).await?;
        Ok(())
    }

    async fn domain_uuid(&self, name: &str) -> Option<String> {
        match self.virsh_stdout(&["domuuid", name]).await {
            Ok(out) => Some(out.trim().to_string()).filter(|u| !u.is_empty()),
            Err(e) => {
                tracing::debug!(domain = name, error = %e, "could not resolve domain uuid");
                None
            }
        }
    }

    async fn discard_job_dir(&self, job_dir: &Path) {
        if let Err(e) = self.executor.remove_dir_all(job_dir).await {
            tracing::warn!(path = %job_dir.display(), error = %e, "could not remove job directory");
        }
    }

    async fn lookup_lease(&self, name: &str) -> Option<(String, String)> {
        self.virsh_stdout(&["domifaddr", name, "--source", "lease"])
            .await
            .ok()
            .and_then(|out| parse_domifaddr_ipv4(&out))
    }

    async fn lookup_arp(&self, mac: &MacAddress) -> Option<(String, String)> {
        let output = self
            .executor
            .run_checked(CommandLine::new("arp").arg("-an"))
            .await
            .ok()?;
        parse_arp_ip(&output.stdout, mac).map(|ip| (ip, mac.to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn require(label: &str, value: &str) -> VirshboxResult<()> {
    if value.trim().is_empty() {
        return Err(VirshboxError::InvalidArgument(format!("{label} is required")));
    }

    validate_shell_input(value)?;
    Ok(())
}

/// Also rejects values that would escape the directory they are joined onto.
fn require_path_component(label: &str, value: &str) -> VirshboxResult<()> {
    require(label, value)?;
    if value.contains('/') || value == "." || value == ".." {
        return Err(VirshboxError::InvalidArgument(format!(
            "{label} must be a single path component: {value:?}"
        )));
    }
    Ok(())
}

/// Runs `fut` until it finishes, `deadline` passes (`None`) or `cancel` fires.
async fn within<T>(
    deadline: Instant,
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> VirshboxResult<Option<T>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(VirshboxError::Cancelled),
        result = tokio::time::timeout_at(deadline, fut) => Ok(result.ok()),
    }
}

fn fresh_instance_id(name: &str) -> String {
    format!("{name}-{}", short_id())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
