use std::time::Duration;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{DEFAULT_HOST_QUERY_TIMEOUT, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A virtualization host in the fleet, reached over SSH.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HostConfig {
    /// A unique, human-readable name for the host.
    #[builder(setter(transform = |name: impl AsRef<str>| name.as_ref().to_string()))]
    pub(super) name: String,

    /// The hostname or IP address to connect to.
    #[builder(setter(transform = |address: impl AsRef<str>| address.as_ref().to_string()))]
    pub(super) address: String,

    /// The SSH user.
    #[serde(default = "HostConfig::default_ssh_user")]
    #[builder(
        default = HostConfig::default_ssh_user(),
        setter(transform = |user: impl AsRef<str>| user.as_ref().to_string())
    )]
    pub(super) ssh_user: String,

    /// The SSH port.
    #[serde(default = "HostConfig::default_ssh_port")]
    #[builder(default = DEFAULT_SSH_PORT)]
    pub(super) ssh_port: u16,

    /// Seconds a single query against this host may take.
    #[serde(default = "HostConfig::default_query_timeout_secs")]
    #[builder(default = HostConfig::default_query_timeout_secs())]
    pub(super) query_timeout_secs: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostConfig {
    /// The per-query deadline for this host.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Replaces zero or empty settings with the fleet defaults.
    pub fn normalize(&mut self) {
        if self.ssh_user.is_empty() {
            self.ssh_user = Self::default_ssh_user();
        }

        if self.ssh_port == 0 {
            self.ssh_port = DEFAULT_SSH_PORT;
        }

        if self.query_timeout_secs == 0 {
            self.query_timeout_secs = Self::default_query_timeout_secs();
        }
    }

    fn default_ssh_user() -> String {
        DEFAULT_SSH_USER.to_string()
    }

    fn default_ssh_port() -> u16 {
        DEFAULT_SSH_PORT
    }

    fn default_query_timeout_secs() -> u64 {
        DEFAULT_HOST_QUERY_TIMEOUT.as_secs()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
