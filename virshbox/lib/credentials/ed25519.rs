//! An in-process certificate authority backed by an ed25519 key.

use std::{net::IpAddr, path::Path, time::Duration};

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use tokio::fs;

use super::{
    manager::write_with_mode, parse_public_key, CertificateAuthority, CertificateRequest, IssuedCertificate, KeyPair,
    SshCertificate, DEFAULT_EXTENSIONS,
};
use crate::{VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How far `valid_after` is moved into the past to absorb clock skew between host and guest.
pub const CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(60);

/// Permissions of a generated CA private key.
const CA_KEY_MODE: u32 = 0o600;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Signs `ssh-ed25519-cert-v01@openssh.com` user certificates with a local CA key.
#[derive(Debug)]
pub struct Ed25519Authority {
    key: KeyPair,
    max_ttl: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Ed25519Authority {
    /// Creates an authority that signs with `key` and never grants more than `max_ttl`.
    pub fn new(key: KeyPair, max_ttl: Duration) -> Self {
        Self { key, max_ttl }
    }

    /// Creates an authority with a fresh key.
    pub fn generate(max_ttl: Duration) -> Self {
        Self::new(KeyPair::generate("virshbox-ca"), max_ttl)
    }

    /// Loads an unencrypted OpenSSH private key from `path`.
    pub async fn load(path: impl AsRef<Path>, max_ttl: Duration) -> VirshboxResult<Self> {
        let path = path.as_ref();
        let pem = fs::read_to_string(path).await?;
        let key = KeyPair::from_openssh(&pem)?;
        tracing::info!(path = %path.display(), fingerprint = %key.fingerprint(), "loaded ssh ca key");
        Ok(Self::new(key, max_ttl))
    }

    /// Loads the CA key from `key_path`, generating and saving one there if it does not exist.
    /// The public key is written next to it, or to `pub_path` when given.
    pub async fn load_or_generate(
        key_path: impl AsRef<Path>,
        pub_path: Option<&Path>,
        max_ttl: Duration,
    ) -> VirshboxResult<Self> {
        let key_path = key_path.as_ref();
        if fs::try_exists(key_path).await? {
            return Self::load(key_path, max_ttl).await;
        }

        let authority = Self::generate(max_ttl);
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_with_mode(key_path, authority.key.to_openssh().as_bytes(), CA_KEY_MODE).await?;

        let pub_path = match pub_path {
            Some(path) => path.to_path_buf(),
            None => key_path.with_extension("pub"),
        };
        fs::write(&pub_path, format!("{}\n", authority.key.public_key_line())).await?;

        tracing::info!(
            path = %key_path.display(),
            fingerprint = %authority.key.fingerprint(),
            "generated ssh ca key"
        );
        Ok(authority)
    }

    /// The longest lifetime this authority grants.
    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// The CA key's fingerprint.
    pub fn fingerprint(&self) -> String {
        self.key.fingerprint()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CertificateAuthority for Ed25519Authority {
    async fn issue_certificate(
        &self,
        request: CertificateRequest,
    ) -> VirshboxResult<IssuedCertificate> {
        if request.sandbox_id.is_empty() {
            return Err(VirshboxError::CertificateIssuance(
                "sandbox id is required".to_string(),
            ));
        }
        if request.principals.is_empty() || request.principals.iter().any(|p| p.is_empty()) {
            return Err(VirshboxError::CertificateIssuance(
                "at least one non-empty principal is required".to_string(),
            ));
        }
        if request.ttl.is_zero() {
            return Err(VirshboxError::CertificateIssuance(
                "ttl must be positive".to_string(),
            ));
        }

        let public_key = parse_public_key(&request.public_key)
            .map_err(|e| VirshboxError::CertificateIssuance(e.to_string()))?;

        let ttl = request.ttl.min(self.max_ttl);
        let issued_at = request.request_time.timestamp().max(0) as u64;
        let valid_after = issued_at.saturating_sub(CLOCK_SKEW_ALLOWANCE.as_secs());
        let valid_before = issued_at + ttl.as_secs();

        let mut nonce = vec![0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        let critical_options = source_address(&request.source_ip)
            .map(|cidr| vec![("source-address".to_string(), cidr)])
            .unwrap_or_default();

        let mut cert = SshCertificate {
            nonce,
            public_key,
            serial: OsRng.next_u64(),
            key_id: request.user_id.clone(),
            principals: request.principals.clone(),
            valid_after,
            valid_before,
            critical_options,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            signature_key: None,
            signature: None,
        };
        cert.sign(&self.key);

        tracing::info!(
            sandbox_id = %request.sandbox_id,
            key_id = %cert.key_id,
            serial = cert.serial,
            principals = ?cert.principals,
            ttl_secs = ttl.as_secs(),
            "issued ssh user certificate"
        );

        Ok(IssuedCertificate {
            certificate: cert.to_line(&request.user_id)?,
            serial: cert.serial,
            key_id: cert.key_id.clone(),
            principals: cert.principals.clone(),
            valid_after: cert.valid_after_time(),
            valid_before: cert.valid_before_time(),
        })
    }

    fn public_key_line(&self) -> String {
        self.key.public_key_line()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// The `source-address` value for `source_ip`, if it is an address or CIDR.
fn source_address(source_ip: &str) -> Option<String> {
    let source_ip = source_ip.trim();
    let (addr, prefix) = match source_ip.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (source_ip, None),
    };

    let addr: IpAddr = addr.parse().ok()?;
    let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
    match prefix {
        Some(prefix) => {
            let prefix: u8 = prefix.parse().ok()?;
            (prefix <= max_prefix).then(|| format!("{addr}/{prefix}"))
        }
        None => Some(addr.to_string()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
