//! The top-level virshbox configuration.

use std::{
    env, fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use super::{
    HostConfig, DEFAULT_ARCH, DEFAULT_BASE_IMAGE_DIR, DEFAULT_CERT_TTL, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_DOMAIN_TYPE, DEFAULT_IP_DISCOVERY_TIMEOUT, DEFAULT_KEY_DIR, DEFAULT_LIBVIRT_URI,
    DEFAULT_MAX_CERT_TTL, DEFAULT_MEMORY_MB, DEFAULT_NETWORK, DEFAULT_REFRESH_MARGIN,
    DEFAULT_SANDBOX_USER, DEFAULT_VCPUS, DEFAULT_VIRSHBOX_HOME, DEFAULT_WORK_DIR,
};
use crate::{
    utils::{SANDBOX_DB_FILENAME, VIRSHBOX_CONFIG_FILENAME},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The virshbox configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VirshboxConfig {
    /// How to reach and lay out the local hypervisor.
    #[serde(default)]
    #[builder(default)]
    pub(super) libvirt: LibvirtConfig,

    /// Sandbox sizing and timeouts.
    #[serde(default)]
    #[builder(default)]
    pub(super) vm: VmConfig,

    /// Credential issuance settings.
    #[serde(default)]
    #[builder(default)]
    pub(super) ssh: SshConfig,

    /// Remote hosts in the fleet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(super) hosts: Vec<HostConfig>,

    /// Where sandbox records are stored.
    #[serde(default)]
    #[builder(default)]
    pub(super) database: DatabaseConfig,
}

/// Settings for the local libvirt connection.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct LibvirtConfig {
    /// The connection URI passed to `virsh --connect`.
    #[builder(default = DEFAULT_LIBVIRT_URI.to_string(), setter(into))]
    pub(super) uri: String,

    /// The libvirt network clones attach to.
    #[builder(default = DEFAULT_NETWORK.to_string(), setter(into))]
    pub(super) network: String,

    /// The directory holding base images.
    #[builder(default = PathBuf::from(DEFAULT_BASE_IMAGE_DIR), setter(into))]
    pub(super) base_image_dir: PathBuf,

    /// The directory under which one job directory per clone is created.
    #[builder(default = PathBuf::from(DEFAULT_WORK_DIR), setter(into))]
    pub(super) work_dir: PathBuf,

    /// How public keys get into a guest.
    #[builder(default)]
    pub(super) ssh_key_inject_method: SshKeyInjectMethod,

    /// Wrapper binary used as the emulator when networking goes through socket_vmnet.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(super) socket_vmnet_wrapper: Option<PathBuf>,

    /// The guest architecture of descriptors generated from scratch.
    #[builder(default = DEFAULT_ARCH.to_string(), setter(into))]
    pub(super) arch: String,

    /// The machine type of generated descriptors; derived from the architecture if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(super) machine: Option<String>,

    /// The libvirt domain type of generated descriptors, `kvm` or `qemu`.
    #[builder(default = DEFAULT_DOMAIN_TYPE.to_string(), setter(into))]
    pub(super) domain_type: String,
}

/// Sandbox sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct VmConfig {
    /// vCPUs given to a sandbox when the caller passes zero.
    #[builder(default = DEFAULT_VCPUS)]
    pub(super) default_vcpus: u32,

    /// Memory in MiB given to a sandbox when the caller passes zero.
    #[builder(default = DEFAULT_MEMORY_MB)]
    pub(super) default_memory_mb: u32,

    /// Seconds a single host command may take.
    #[builder(default = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    pub(super) command_timeout_secs: u64,

    /// Seconds to wait for a started sandbox to obtain an address.
    #[builder(default = DEFAULT_IP_DISCOVERY_TIMEOUT.as_secs())]
    pub(super) ip_discovery_timeout_secs: u64,

    /// Seconds a sandbox without its own TTL lives before the janitor destroys it.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub(super) default_ttl_secs: Option<u64>,
}

/// Credential issuance settings.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct SshConfig {
    /// The certificate authority's OpenSSH private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(super) ca_key_path: Option<PathBuf>,

    /// The certificate authority's public key, written into guests as a trusted CA.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(super) ca_pub_path: Option<PathBuf>,

    /// Where per-sandbox keys and certificates are written.
    #[builder(default = PathBuf::from(DEFAULT_KEY_DIR), setter(into))]
    pub(super) key_dir: PathBuf,

    /// Seconds requested for each certificate.
    #[builder(default = DEFAULT_CERT_TTL.as_secs())]
    pub(super) cert_ttl_secs: u64,

    /// The longest certificate lifetime the authority grants.
    #[builder(default = DEFAULT_MAX_CERT_TTL.as_secs())]
    pub(super) max_ttl_secs: u64,

    /// Seconds before expiry at which a cached credential is replaced.
    #[builder(default = DEFAULT_REFRESH_MARGIN.as_secs())]
    pub(super) refresh_margin_secs: u64,

    /// The guest user credentials are issued for.
    #[builder(default = DEFAULT_SANDBOX_USER.to_string(), setter(into))]
    pub(super) default_user: String,

    /// A jump host for reaching sandboxes.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(super) proxy_jump: Option<String>,
}

/// Where sandbox records are stored.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct DatabaseConfig {
    /// The SQLite database file.
    #[builder(default = DEFAULT_VIRSHBOX_HOME.join(SANDBOX_DB_FILENAME), setter(into))]
    pub(super) path: PathBuf,
}

/// How a public key is placed inside a guest.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SshKeyInjectMethod {
    /// Edit the guest disk offline with `virt-customize --ssh-inject`.
    #[default]
    VirtCustomize,

    /// Deliver the key through the cloud-init seed.
    CloudInit,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VirshboxConfig {
    /// The default location of the configuration file.
    pub fn default_path() -> PathBuf {
        DEFAULT_VIRSHBOX_HOME.join(VIRSHBOX_CONFIG_FILENAME)
    }

    /// Loads the configuration from `path`, falling back to defaults if the file is absent,
    /// then applies environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> VirshboxResult<Self> {
        let path = path.as_ref();
        let mut config = if fs::try_exists(path).await? {
            let contents = fs::read_to_string(path).await?;
            Self::from_yaml(&contents)?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document and fills in host defaults.
    pub fn from_yaml(contents: &str) -> VirshboxResult<Self> {
        let mut config: Self = serde_yaml::from_str(contents)?;
        for host in &mut config.hosts {
            host.normalize();
        }

        Ok(config)
    }

    /// Overrides settings from well-known environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Some(uri) = env_string("LIBVIRT_URI") {
            self.libvirt.uri = uri;
        }
        if let Some(network) = env_string("LIBVIRT_NETWORK") {
            self.libvirt.network = network;
        }
        if let Some(dir) = env_string("BASE_IMAGE_DIR") {
            self.libvirt.base_image_dir = dir.into();
        }
        if let Some(dir) = env_string("SANDBOX_WORKDIR") {
            self.libvirt.work_dir = dir.into();
        }
        if let Some(method) = env_string("SSH_KEY_INJECT_METHOD") {
            match method.parse() {
                Ok(method) => self.libvirt.ssh_key_inject_method = method,
                Err(e) => tracing::warn!(error = %e, "ignoring SSH_KEY_INJECT_METHOD"),
            }
        }
        if let Some(path) = env_string("SSH_CA_PUB_KEY_PATH") {
            self.ssh.ca_pub_path = Some(path.into());
        }
        if let Some(path) = env_string("SSH_CA_KEY_PATH") {
            self.ssh.ca_key_path = Some(path.into());
        }
        if let Some(vcpus) = env_number("DEFAULT_VCPUS") {
            self.vm.default_vcpus = vcpus;
        }
        if let Some(memory) = env_number("DEFAULT_MEMORY_MB") {
            self.vm.default_memory_mb = memory;
        }
    }

    /// Rejects host lists with missing addresses or duplicate names.
    pub fn validate(&self) -> VirshboxResult<()> {
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.get_name().is_empty() || host.get_address().is_empty() {
                return Err(VirshboxError::InvalidArgument(
                    "every host needs a name and an address".to_string(),
                ));
            }

            if !seen.insert(host.get_name()) {
                return Err(VirshboxError::InvalidArgument(format!(
                    "duplicate host name: {}",
                    host.get_name()
                )));
            }
        }

        Ok(())
    }
}

impl VmConfig {
    /// The per-command deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The IP discovery deadline.
    pub fn ip_discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_discovery_timeout_secs)
    }
}

impl SshConfig {
    /// The lifetime requested for each certificate.
    pub fn cert_ttl(&self) -> Duration {
        Duration::from_secs(self.cert_ttl_secs)
    }

    /// The longest certificate lifetime granted.
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    /// The refresh-before-expiry margin.
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_number<T: FromStr>(key: &str) -> Option<T> {
    let value = env_string(key)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key = key, value = %value, "ignoring non-numeric override");
            None
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FromStr for SshKeyInjectMethod {
    type Err = VirshboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virt-customize" => Ok(Self::VirtCustomize),
            "cloud-init" => Ok(Self::CloudInit),
            other => Err(VirshboxError::InvalidArgument(format!(
                "unknown ssh key inject method: {other}"
            ))),
        }
    }
}

impl fmt::Display for SshKeyInjectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VirtCustomize => write!(f, "virt-customize"),
            Self::CloudInit => write!(f, "cloud-init"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const SAMPLE: &str = r#"
libvirt:
  uri: qemu+ssh://kvm-0/system
  network: sandbox-net
  work_dir: /srv/jobs
  ssh_key_inject_method: cloud-init
vm:
  default_vcpus: 4
ssh:
  ca_pub_path: /etc/virshbox/ca.pub
hosts:
  - name: kvm-1
    address: 10.0.0.11
  - name: kvm-2
    address: 10.0.0.12
    ssh_user: ops
    ssh_port: 2222
    query_timeout_secs: 5
"#;

    #[test]
    fn test_from_yaml_fills_defaults() -> anyhow::Result<()> {
        let config = VirshboxConfig::from_yaml(SAMPLE)?;

        assert_eq!(config.get_libvirt().get_uri(), "qemu+ssh://kvm-0/system");
        assert_eq!(config.get_libvirt().get_network(), "sandbox-net");
        assert_eq!(
            config.get_libvirt().get_base_image_dir(),
            &PathBuf::from(DEFAULT_BASE_IMAGE_DIR)
        );
        assert_eq!(
            *config.get_libvirt().get_ssh_key_inject_method(),
            SshKeyInjectMethod::CloudInit
        );
        assert_eq!(*config.get_vm().get_default_vcpus(), 4);
        assert_eq!(*config.get_vm().get_default_memory_mb(), DEFAULT_MEMORY_MB);
        assert_eq!(config.get_ssh().cert_ttl(), DEFAULT_CERT_TTL);
        assert_eq!(config.get_hosts().len(), 2);
        assert_eq!(config.get_hosts()[0].get_ssh_user(), "root");
        assert_eq!(*config.get_hosts()[1].get_ssh_port(), 2222);
        assert_eq!(config.get_hosts()[1].query_timeout(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_validate_rejects_duplicate_hosts() {
        let host = HostConfig::builder().name("kvm-1").address("a").build();
        let config = VirshboxConfig::builder()
            .hosts(vec![host.clone(), host])
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("SANDBOX_WORKDIR", "/data/jobs");
        env::set_var("DEFAULT_MEMORY_MB", "4096");
        env::set_var("DEFAULT_VCPUS", "many");

        let mut config = VirshboxConfig::default();
        config.apply_env_overrides();

        env::remove_var("SANDBOX_WORKDIR");
        env::remove_var("DEFAULT_MEMORY_MB");
        env::remove_var("DEFAULT_VCPUS");

        assert_eq!(config.get_libvirt().get_work_dir(), &PathBuf::from("/data/jobs"));
        assert_eq!(*config.get_vm().get_default_memory_mb(), 4096);
        assert_eq!(*config.get_vm().get_default_vcpus(), DEFAULT_VCPUS);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_missing_file_uses_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = VirshboxConfig::load(dir.path().join("absent.yaml")).await?;
        assert_eq!(config.get_libvirt().get_uri(), DEFAULT_LIBVIRT_URI);
        assert!(config.get_hosts().is_empty());
        Ok(())
    }
}
