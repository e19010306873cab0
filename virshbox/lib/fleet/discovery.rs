use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{DiscoveredDomain, HostConnector, HostError, HostQueryOutcome, MultiHostResult};
use crate::{
    config::{HostConfig, DEFAULT_LIBVIRT_URI},
    exec::validate_shell_input,
    virsh::{DomainManager, DomainManagerConfig},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Queries a fixed set of hosts concurrently.
///
/// Each host gets its own worker bounded by the host's query timeout. A failing or slow host
/// only produces a [`HostError`] for itself.
#[derive(Clone)]
pub struct MultiHostDiscovery {
    hosts: Vec<HostConfig>,
    connector: Arc<dyn HostConnector>,
    uri: String,
}

enum Presence {
    Present(HostConfig),
    Absent,
    Unreachable(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MultiHostDiscovery {
    /// Creates a discovery layer over `hosts`, reaching each through `connector`.
    pub fn new(hosts: Vec<HostConfig>, connector: Arc<dyn HostConnector>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|mut host| {
                host.normalize();
                host
            })
            .collect();

        Self {
            hosts,
            connector,
            uri: DEFAULT_LIBVIRT_URI.to_string(),
        }
    }

    /// Uses `uri` for `virsh --connect` on every host.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// The configured hosts.
    pub fn hosts(&self) -> &[HostConfig] {
        &self.hosts
    }

    /// A Domain Manager for `host`, sharing this layer's connector.
    pub fn manager_for(
        &self,
        host: &HostConfig,
        config: DomainManagerConfig,
    ) -> VirshboxResult<DomainManager> {
        Ok(DomainManager::new(self.connector.connect(host)?, config))
    }

    /// Lists the domains of every host.
    ///
    /// Per-host failures and timeouts end up in [`MultiHostResult::host_errors`]. The only
    /// error returned is [`VirshboxError::Cancelled`] when `cancel` fires first.
    pub async fn list_domains(&self, cancel: &CancellationToken) -> VirshboxResult<MultiHostResult> {
        if self.hosts.is_empty() {
            return Ok(MultiHostResult::default());
        }

        let mut workers: FuturesUnordered<_> = self
            .hosts
            .iter()
            .map(|host| self.query_host_bounded(host))
            .collect();

        let mut result = MultiHostResult::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("domain discovery cancelled");
                    return Err(VirshboxError::Cancelled);
                }
                outcome = workers.next() => match outcome {
                    Some(outcome) => result.push(outcome),
                    None => break,
                },
            }
        }

        tracing::info!(
            domains = result.domains.len(),
            failed_hosts = result.host_errors.len(),
            "domain discovery finished"
        );
        Ok(result)
    }

    /// Returns the first host that reports a domain called `name`.
    ///
    /// Hosts that answer "absent" and hosts that cannot be reached are both skipped. If no host
    /// has the domain, the error carries the last transport failure seen, if any.
    pub async fn find_host_for_vm(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> VirshboxResult<HostConfig> {
        if self.hosts.is_empty() {
            return Err(VirshboxError::NoHostsConfigured);
        }

        if name.trim().is_empty() {
            return Err(VirshboxError::InvalidArgument(
                "domain name is required".to_string(),
            ));
        }
        validate_shell_input(name)?;

        let mut workers: FuturesUnordered<_> = self
            .hosts
            .iter()
            .map(|host| self.probe_host(host, name))
            .collect();

        let mut last_error = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(VirshboxError::Cancelled),
                presence = workers.next() => match presence {
                    Some(Presence::Present(host)) => {
                        tracing::info!(domain = name, host = %host.get_name(), "domain located");
                        return Ok(host);
                    }
                    Some(Presence::Absent) => {}
                    Some(Presence::Unreachable(error)) => last_error = Some(error),
                    None => break,
                },
            }
        }

        Err(VirshboxError::DomainNotFoundOnAnyHost {
            name: name.to_string(),
            last_error,
        })
    }

    fn manager(&self, host: &HostConfig) -> VirshboxResult<DomainManager> {
        self.manager_for(
            host,
            DomainManagerConfig::builder().uri(self.uri.clone()).build(),
        )
    }

    async fn query_host_bounded(&self, host: &HostConfig) -> HostQueryOutcome {
        let timeout = host.query_timeout();
        match tokio::time::timeout(timeout, self.query_host(host)).await {
            Ok(Ok(domains)) => HostQueryOutcome::Succeeded {
                host_name: host.get_name().clone(),
                domains,
            },
            Ok(Err(e)) => {
                tracing::warn!(host = %host.get_name(), address = %host.get_address(), error = %e, "failed to query host");
                HostQueryOutcome::Failed(HostError::new(host, e))
            }
            Err(_) => {
                tracing::warn!(host = %host.get_name(), timeout_secs = timeout.as_secs(), "host query timed out");
                HostQueryOutcome::Failed(HostError::new(
                    host,
                    format!("query timed out after {}s", timeout.as_secs()),
                ))
            }
        }
    }

    async fn query_host(&self, host: &HostConfig) -> VirshboxResult<Vec<DiscoveredDomain>> {
        let manager = self.manager(host)?;
        let names = manager.list_domains().await?;

        let mut domains = Vec::with_capacity(names.len());
        for name in names {
            let info = match manager.domain_info(&name).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::debug!(host = %host.get_name(), domain = %name, error = %e, "skipping domain");
                    continue;
                }
            };

            let disk_path = manager.primary_disk_path(&name).await.ok().flatten();
            domains.push(DiscoveredDomain {
                name,
                uuid: info.uuid,
                state: info.state,
                persistent: info.persistent,
                disk_path,
                host_name: host.get_name().clone(),
                host_address: host.get_address().clone(),
            });
        }

        Ok(domains)
    }

    async fn probe_host(&self, host: &HostConfig, name: &str) -> Presence {
        let manager = match self.manager(host) {
            Ok(manager) => manager,
            Err(e) => return Presence::Unreachable(e.to_string()),
        };

        let timeout = host.query_timeout();
        match tokio::time::timeout(timeout, manager.domain_exists(name)).await {
            Ok(Ok(true)) => Presence::Present(host.clone()),
            Ok(Ok(false)) => Presence::Absent,
            Ok(Err(e)) => {
                tracing::debug!(host = %host.get_name(), domain = name, error = %e, "host probe failed");
                Presence::Unreachable(e.to_string())
            }
            Err(_) => Presence::Unreachable(format!(
                "{} timed out after {}s",
                host.get_name(),
                timeout.as_secs()
            )),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::exec::{CommandExecutor, CommandLine, CommandOutput};

    #[derive(Clone)]
    enum Behaviour {
        Domains(Vec<&'static str>),
        Unreachable,
        Hang,
    }

    struct FakeFleetHost(Behaviour);

    #[async_trait]
    impl CommandExecutor for FakeFleetHost {
        fn target(&self) -> String {
            "fake".to_string()
        }

        fn is_remote(&self) -> bool {
            true
        }

        async fn run(&self, command: CommandLine) -> VirshboxResult<CommandOutput> {
            let domains = match &self.0 {
                Behaviour::Domains(domains) => domains,
                Behaviour::Unreachable => {
                    return Err(VirshboxError::SshTransport {
                        host: "fake".to_string(),
                        message: "connection refused".to_string(),
                    })
                }
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            };

            let args = command.get_args();
            let verb = args.get(2).map(String::as_str).unwrap_or_default();
            let target = args.get(3).map(String::as_str).unwrap_or_default();
            let (stdout, status) = match verb {
                "list" => (domains.join("\n"), 0),
                "dominfo" if domains.iter().any(|d| *d == target) => {
                    (format!("Name: {target}\nUUID: uuid-{target}\nState: running\nPersistent: yes\n"), 0)
                }
                "domblklist" => (format!("file disk vda /images/{target}.qcow2\n"), 0),
                _ => (String::new(), 1),
            };

            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                status: Some(status),
            })
        }
    }

    struct FakeConnector(HashMap<String, Behaviour>);

    impl HostConnector for FakeConnector {
        fn connect(&self, host: &HostConfig) -> VirshboxResult<Arc<dyn CommandExecutor>> {
            let behaviour = self
                .0
                .get(host.get_name())
                .cloned()
                .unwrap_or(Behaviour::Unreachable);
            Ok(Arc::new(FakeFleetHost(behaviour)))
        }
    }

    fn fleet(hosts: Vec<(&str, Behaviour)>) -> MultiHostDiscovery {
        let configs = hosts
            .iter()
            .map(|(name, _)| {
                HostConfig::builder()
                    .name(name)
                    .address(format!("{name}.local"))
                    .query_timeout_secs(1)
                    .build()
            })
            .collect();
        let behaviours = hosts
            .into_iter()
            .map(|(name, behaviour)| (name.to_string(), behaviour))
            .collect();

        MultiHostDiscovery::new(configs, Arc::new(FakeConnector(behaviours)))
    }

    #[tokio::test]
    async fn test_list_domains_isolates_failed_hosts() -> anyhow::Result<()> {
        let discovery = fleet(vec![
            ("a", Behaviour::Domains(vec!["vm-1", "vm-2"])),
            ("b", Behaviour::Unreachable),
            ("c", Behaviour::Domains(vec!["vm-3"])),
            ("d", Behaviour::Hang),
        ]);

        let result = discovery.list_domains(&CancellationToken::new()).await?;
        assert_eq!(result.domains.len(), 3);
        assert_eq!(result.host_errors.len(), 2);
        assert_eq!(result.domains_on("a").count(), 2);

        let vm3 = result.find("vm-3").ok_or_else(|| anyhow::anyhow!("vm-3 missing"))?;
        assert_eq!(vm3.host_address, "c.local");
        assert_eq!(vm3.uuid.as_deref(), Some("uuid-vm-3"));
        assert_eq!(vm3.disk_path.as_deref(), Some("/images/vm-3.qcow2"));

        let timed_out = result
            .host_errors
            .iter()
            .find(|e| e.host_name == "d")
            .ok_or_else(|| anyhow::anyhow!("d missing"))?;
        assert!(timed_out.error.contains("timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn test_find_host_for_vm_ignores_failing_hosts() -> anyhow::Result<()> {
        let discovery = fleet(vec![
            ("a", Behaviour::Unreachable),
            ("b", Behaviour::Hang),
            ("c", Behaviour::Domains(vec!["vm-9"])),
        ]);

        let host = discovery
            .find_host_for_vm("vm-9", &CancellationToken::new())
            .await?;
        assert_eq!(host.get_name(), "c");
        Ok(())
    }

    #[tokio::test]
    async fn test_find_host_for_vm_reports_last_transport_error() {
        let discovery = fleet(vec![
            ("a", Behaviour::Domains(vec![])),
            ("b", Behaviour::Unreachable),
        ]);

        let err = discovery
            .find_host_for_vm("vm-9", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            VirshboxError::DomainNotFoundOnAnyHost { name, last_error } => {
                assert_eq!(name, "vm-9");
                assert!(last_error.unwrap_or_default().contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let absent = fleet(vec![("a", Behaviour::Domains(vec![]))])
            .find_host_for_vm("vm-9", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            absent,
            VirshboxError::DomainNotFoundOnAnyHost { last_error: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_fleet_and_cancellation() {
        let empty = fleet(vec![]);
        assert!(matches!(
            empty
                .find_host_for_vm("vm-1", &CancellationToken::new())
                .await
                .unwrap_err(),
            VirshboxError::NoHostsConfigured
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fleet(vec![("a", Behaviour::Hang)])
            .list_domains(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VirshboxError::Cancelled));
    }
}
