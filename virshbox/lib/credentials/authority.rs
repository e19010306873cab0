use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::VirshboxResult;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Issues short-lived SSH user certificates bound to a sandbox.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Signs `request.public_key` for `request.principals`.
    async fn issue_certificate(
        &self,
        request: CertificateRequest,
    ) -> VirshboxResult<IssuedCertificate>;

    /// The CA public key line guests are told to trust.
    fn public_key_line(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A request for a user certificate.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
pub struct CertificateRequest {
    /// Who is asking, recorded as the certificate's key id.
    #[builder(setter(into))]
    pub user_id: String,

    /// The sandbox the certificate grants access to.
    #[builder(setter(into))]
    pub sandbox_id: String,

    /// The `ssh-ed25519 ...` line of the key to certify.
    #[builder(setter(into))]
    pub public_key: String,

    /// The requested lifetime.
    pub ttl: Duration,

    /// The usernames the certificate may log in as.
    pub principals: Vec<String>,

    /// The address or CIDR the certificate may be used from. Values that are not addresses are
    /// recorded but not enforced.
    #[builder(default, setter(into))]
    pub source_ip: String,

    /// When the request was made; validity is computed from this.
    pub request_time: DateTime<Utc>,
}

/// A signed certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// The `ssh-ed25519-cert-v01@openssh.com ...` line to write next to the private key.
    pub certificate: String,

    /// The certificate serial.
    pub serial: u64,

    /// The certificate key id.
    pub key_id: String,

    /// The principals the certificate was issued for.
    pub principals: Vec<String>,

    /// The start of validity.
    pub valid_after: DateTime<Utc>,

    /// The end of validity.
    pub valid_before: DateTime<Utc>,
}
