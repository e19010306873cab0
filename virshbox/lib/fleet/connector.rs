use std::{sync::Arc, time::Duration};

use crate::{
    config::HostConfig,
    exec::{CommandExecutor, SshExecutor},
    VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Creates the executor used to reach a fleet host.
pub trait HostConnector: Send + Sync {
    /// Returns an executor whose commands run on `host`.
    fn connect(&self, host: &HostConfig) -> VirshboxResult<Arc<dyn CommandExecutor>>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reaches hosts with the system `ssh` client.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    command_timeout: Option<Duration>,
    proxy_jump: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SshConnector {
    /// Creates a connector whose executors time out with each host's query timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `timeout` for every command instead of the host's query timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Routes every connection through a jump host.
    pub fn with_proxy_jump(mut self, proxy_jump: Option<String>) -> Self {
        self.proxy_jump = proxy_jump.filter(|j| !j.is_empty());
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl HostConnector for SshConnector {
    fn connect(&self, host: &HostConfig) -> VirshboxResult<Arc<dyn CommandExecutor>> {
        let mut executor = SshExecutor::new(
            host.get_address(),
            host.get_ssh_user(),
            *host.get_ssh_port(),
            self.command_timeout.unwrap_or_else(|| host.query_timeout()),
        );

        if let Some(jump) = &self.proxy_jump {
            executor = executor.with_proxy_jump(jump);
        }

        Ok(Arc::new(executor))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_connector_targets_host() -> anyhow::Result<()> {
        let host = HostConfig::builder()
            .name("kvm-1")
            .address("10.0.0.5")
            .ssh_port(2222)
            .build();

        let executor = SshConnector::new().connect(&host)?;
        assert!(executor.is_remote());
        assert_eq!(executor.target(), "root@10.0.0.5:2222");
        Ok(())
    }
}
