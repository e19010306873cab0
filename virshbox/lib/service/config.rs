use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::config::{
    VirshboxConfig, DEFAULT_COMMAND_TIMEOUT, DEFAULT_IP_DISCOVERY_TIMEOUT, DEFAULT_JANITOR_INTERVAL,
    DEFAULT_MEMORY_MB, DEFAULT_SANDBOX_USER, DEFAULT_VCPUS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings of a [`SandboxService`][super::SandboxService].
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct ServiceConfig {
    /// vCPUs given to a sandbox when the caller passes zero.
    #[builder(default = DEFAULT_VCPUS)]
    pub default_vcpus: u32,

    /// Memory in MiB given to a sandbox when the caller passes zero.
    #[builder(default = DEFAULT_MEMORY_MB)]
    pub default_memory_mb: u32,

    /// How long a command run inside a sandbox may take when the caller gives no timeout.
    #[builder(default = DEFAULT_COMMAND_TIMEOUT)]
    pub command_timeout: Duration,

    /// How long to wait for a started sandbox to obtain an address.
    #[builder(default = DEFAULT_IP_DISCOVERY_TIMEOUT)]
    pub ip_discovery_timeout: Duration,

    /// The lifetime of sandboxes created without a TTL. `None` keeps them until destroyed.
    #[builder(default, setter(strip_option))]
    pub default_ttl: Option<Duration>,

    /// The guest user managed credentials log in as.
    #[builder(default = DEFAULT_SANDBOX_USER.to_string(), setter(into))]
    pub default_user: String,

    /// A jump host for reaching sandboxes.
    #[builder(default, setter(strip_option, into))]
    pub proxy_jump: Option<String>,

    /// How often the janitor looks for expired sandboxes.
    #[builder(default = DEFAULT_JANITOR_INTERVAL)]
    pub janitor_interval: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServiceConfig {
    /// Takes the vm and ssh settings from `config`.
    pub fn from_config(config: &VirshboxConfig) -> Self {
        let vm = config.get_vm();
        let ssh = config.get_ssh();

        Self {
            default_vcpus: *vm.get_default_vcpus(),
            default_memory_mb: *vm.get_default_memory_mb(),
            command_timeout: vm.command_timeout(),
            ip_discovery_timeout: vm.ip_discovery_timeout(),
            default_ttl: vm.get_default_ttl_secs().map(Duration::from_secs),
            default_user: ssh.get_default_user().clone(),
            proxy_jump: ssh.get_proxy_jump().clone(),
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
