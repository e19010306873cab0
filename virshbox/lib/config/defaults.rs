use std::{path::PathBuf, sync::LazyLock, time::Duration};

use crate::utils::VIRSHBOX_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The libvirt connection URI used when none is configured.
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// The libvirt network clones attach to.
pub const DEFAULT_NETWORK: &str = "default";

/// Where base images live.
pub const DEFAULT_BASE_IMAGE_DIR: &str = "/var/lib/libvirt/images/base";

/// Where per-clone job directories are created.
pub const DEFAULT_WORK_DIR: &str = "/var/lib/libvirt/images/jobs";

/// The guest architecture of generated descriptors.
pub const DEFAULT_ARCH: &str = "x86_64";

/// The libvirt domain type of generated descriptors.
pub const DEFAULT_DOMAIN_TYPE: &str = "kvm";

/// The number of vCPUs a sandbox gets when the caller does not say.
pub const DEFAULT_VCPUS: u32 = 2;

/// The memory in MiB a sandbox gets when the caller does not say.
pub const DEFAULT_MEMORY_MB: u32 = 2048;

/// The deadline of a single host command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// How long to wait for a fresh clone to obtain a DHCP lease.
pub const DEFAULT_IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);

/// The SSH user of fleet hosts.
pub const DEFAULT_SSH_USER: &str = "root";

/// The SSH port of fleet hosts.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// The deadline of one host's discovery query.
pub const DEFAULT_HOST_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Where ephemeral sandbox keys are written.
pub const DEFAULT_KEY_DIR: &str = "/tmp/sandbox-keys";

/// The lifetime requested for sandbox certificates.
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(300);

/// The longest lifetime the certificate authority grants.
pub const DEFAULT_MAX_CERT_TTL: Duration = Duration::from_secs(600);

/// How long before expiry a cached credential is regenerated.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// The guest user sandbox credentials are issued for.
pub const DEFAULT_SANDBOX_USER: &str = "sandbox";

/// How often the janitor looks for expired sandboxes.
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// The path where virshbox keeps its configuration and database.
pub static DEFAULT_VIRSHBOX_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(VIRSHBOX_HOME_DIR)
});
