use serde::{Deserialize, Serialize};

use crate::{config::HostConfig, virsh::DomainState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A domain seen on one host during a discovery query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDomain {
    /// The domain name.
    pub name: String,

    /// The domain UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// The lifecycle state.
    pub state: DomainState,

    /// Whether the domain is persistently defined.
    pub persistent: bool,

    /// The backing file of the primary disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,

    /// The configured name of the owning host.
    pub host_name: String,

    /// The address of the owning host.
    pub host_address: String,
}

/// A host that could not be queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostError {
    /// The configured name of the host.
    pub host_name: String,

    /// The address of the host.
    pub host_address: String,

    /// What went wrong.
    pub error: String,
}

/// The result of querying one host: its domains or why it could not be queried, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostQueryOutcome {
    /// The host answered.
    Succeeded {
        /// The configured name of the host.
        host_name: String,

        /// The domains it reported.
        domains: Vec<DiscoveredDomain>,
    },

    /// The host failed or did not answer in time.
    Failed(HostError),
}

/// Domains from every host that answered plus one error per host that did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiHostResult {
    /// Domains from every host that answered.
    pub domains: Vec<DiscoveredDomain>,

    /// One entry per host that failed.
    pub host_errors: Vec<HostError>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostError {
    pub(crate) fn new(host: &HostConfig, error: impl ToString) -> Self {
        Self {
            host_name: host.get_name().clone(),
            host_address: host.get_address().clone(),
            error: error.to_string(),
        }
    }
}

impl MultiHostResult {
    /// Folds per-host outcomes into one result. Order of arrival does not matter.
    pub fn from_outcomes(outcomes: impl IntoIterator<Item = HostQueryOutcome>) -> Self {
        let mut result = Self::default();
        for outcome in outcomes {
            result.push(outcome);
        }
        result
    }

    /// Adds one host's outcome.
    pub fn push(&mut self, outcome: HostQueryOutcome) {
        match outcome {
            HostQueryOutcome::Succeeded { domains, .. } => self.domains.extend(domains),
            HostQueryOutcome::Failed(error) => self.host_errors.push(error),
        }
    }

    /// Whether every host answered.
    pub fn is_complete(&self) -> bool {
        self.host_errors.is_empty()
    }

    /// The domains reported by the host called `host_name`.
    pub fn domains_on<'a>(
        &'a self,
        host_name: &'a str,
    ) -> impl Iterator<Item = &'a DiscoveredDomain> + 'a {
        self.domains.iter().filter(move |d| d.host_name == host_name)
    }

    /// The first domain called `name` on any host.
    pub fn find(&self, name: &str) -> Option<&DiscoveredDomain> {
        self.domains.iter().find(|d| d.name == name)
    }
}
