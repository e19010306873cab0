use std::{
    collections::HashMap,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::{
    fs,
    sync::{Mutex, RwLock},
};
use typed_builder::TypedBuilder;

use super::{CertificateAuthority, CertificateRequest, KeyPair};
use crate::{
    config::{
        SshConfig, DEFAULT_CERT_TTL, DEFAULT_KEY_DIR, DEFAULT_REFRESH_MARGIN, DEFAULT_SANDBOX_USER,
    },
    utils::{short_id, Clock, SystemClock},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The private key's filename inside a credential directory.
pub const PRIVATE_KEY_FILENAME: &str = "key";

/// The certificate's filename inside a credential directory.
pub const CERTIFICATE_FILENAME: &str = "key-cert.pub";

/// The `source_ip` recorded on certificates issued for the orchestrator itself.
pub const INTERNAL_SOURCE_IP: &str = "internal";

const DIR_MODE: u32 = 0o700;
const PRIVATE_KEY_MODE: u32 = 0o600;
const CERTIFICATE_MODE: u32 = 0o644;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings for the credential manager.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CredentialManagerConfig {
    /// The root under which one directory per sandbox is created.
    #[builder(default = PathBuf::from(DEFAULT_KEY_DIR), setter(into))]
    pub key_dir: PathBuf,

    /// The certificate lifetime requested from the authority.
    #[builder(default = DEFAULT_CERT_TTL)]
    pub cert_ttl: Duration,

    /// How long before expiry a cached credential is replaced.
    #[builder(default = DEFAULT_REFRESH_MARGIN)]
    pub refresh_margin: Duration,

    /// The username used when a caller passes an empty one.
    #[builder(default = DEFAULT_SANDBOX_USER.to_string(), setter(into))]
    pub default_username: String,
}

/// A private key and the certificate that lets it log into one sandbox as one user.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub with_prefix")]
pub struct Credential {
    /// The OpenSSH private key file.
    private_key_path: PathBuf,

    /// The certificate file, next to the private key as `ssh` expects.
    certificate_path: PathBuf,

    /// The `ssh-ed25519 ...` line of the public key.
    public_key: String,

    /// The principal the certificate was issued for.
    username: String,

    /// When the certificate stops being valid.
    valid_until: DateTime<Utc>,

    /// The sandbox the credential belongs to.
    sandbox_id: String,
}

/// Issues, caches and retires per-sandbox SSH credentials.
///
/// Generation for a sandbox is serialized by a per-sandbox lock, so concurrent callers for the
/// same sandbox wait for one issuance instead of racing several. Each generation lives in its own
/// directory under `<key_dir>/<sandbox_id>/`, which is replaced rather than rewritten on refresh.
pub struct CredentialManager {
    authority: Arc<dyn CertificateAuthority>,
    clock: Arc<dyn Clock>,
    config: CredentialManagerConfig,
    cache: RwLock<HashMap<String, Credential>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CredentialManagerConfig {
    /// Builds the settings from the `ssh` configuration section.
    pub fn from_config(config: &SshConfig) -> Self {
        Self {
            key_dir: config.get_key_dir().clone(),
            cert_ttl: config.cert_ttl(),
            refresh_margin: config.refresh_margin(),
            default_username: config.get_default_user().clone(),
        }
    }
}

impl Credential {
    /// Whether the credential is still usable at `now` with `margin` to spare.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => now + margin < self.valid_until,
            Err(_) => false,
        }
    }

    fn generation_dir(&self) -> Option<&Path> {
        self.private_key_path.parent()
    }
}

impl CredentialManager {
    /// Creates a manager that issues through `authority` and reads time from the system clock.
    pub fn new(authority: Arc<dyn CertificateAuthority>, config: CredentialManagerConfig) -> Self {
        Self::with_clock(authority, config, Arc::new(SystemClock))
    }

    /// Creates a manager with an explicit clock.
    pub fn with_clock(
        authority: Arc<dyn CertificateAuthority>,
        config: CredentialManagerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authority,
            clock,
            config,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The manager's settings.
    pub fn config(&self) -> &CredentialManagerConfig {
        &self.config
    }

    /// The authority certificates are requested from.
    pub fn authority(&self) -> &Arc<dyn CertificateAuthority> {
        &self.authority
    }

    /// Returns a credential for `username` on `sandbox_id`, issuing a new one if nothing is
    /// cached or the cached one is within the refresh margin of expiry.
    pub async fn get_credentials(
        &self,
        sandbox_id: &str,
        username: &str,
    ) -> VirshboxResult<Credential> {
        validate_component("sandbox id", sandbox_id)?;
        let username = if username.is_empty() {
            self.config.default_username.as_str()
        } else {
            username
        };
        validate_component("username", username)?;

        let lock = self.lock_for(sandbox_id).await;
        let _guard = lock.lock().await;

        let key = cache_key(sandbox_id, username);
        let previous = self.cache.read().await.get(&key).cloned();
        if let Some(cached) = &previous {
            if cached.is_fresh(self.clock.now(), self.config.refresh_margin) {
                tracing::debug!(
                    sandbox_id = sandbox_id,
                    username = username,
                    "using cached credential"
                );
                return Ok(cached.clone());
            }
        }

        let credential = self.generate(sandbox_id, username).await?;
        self.cache.write().await.insert(key, credential.clone());

        if let Some(dir) = previous.as_ref().and_then(Credential::generation_dir) {
            if let Err(e) = fs::remove_dir_all(dir).await {
                tracing::warn!(path = %dir.display(), error = %e, "failed to remove replaced credential");
            }
        }

        Ok(credential)
    }

    /// Drops every cached credential of `sandbox_id`, deletes its key directory and retires its
    /// lock once no other caller is using it. Calling it again is a no-op.
    pub async fn cleanup(&self, sandbox_id: &str) -> VirshboxResult<()> {
        validate_component("sandbox id", sandbox_id)?;

        let lock = self.lock_for(sandbox_id).await;
        {
            let _guard = lock.lock().await;

            let prefix = format!("{sandbox_id}:");
            self.cache
                .write()
                .await
                .retain(|key, _| !key.starts_with(&prefix));

            let dir = self.sandbox_dir(sandbox_id);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.retire_lock(sandbox_id, &lock).await;
        tracing::info!(sandbox_id = sandbox_id, "cleaned up sandbox credentials");
        Ok(())
    }

    /// Removes the files of every cached credential and forgets all state not held by a caller
    /// still in flight.
    pub async fn close(&self) {
        let cached: Vec<Credential> = self.cache.write().await.drain().map(|(_, c)| c).collect();
        for credential in cached {
            if let Some(dir) = credential.generation_dir() {
                if let Err(e) = fs::remove_dir_all(dir).await {
                    tracing::warn!(path = %dir.display(), error = %e, "failed to remove credential");
                }
            }
        }

        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// The directory holding every credential generation of `sandbox_id`.
    pub fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.config.key_dir.join(sandbox_id)
    }

    async fn lock_for(&self, sandbox_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(sandbox_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the lock of `sandbox_id` unless another task still holds or waits on it.
    async fn retire_lock(&self, sandbox_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(sandbox_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(sandbox_id);
        }
    }

    async fn generate(&self, sandbox_id: &str, username: &str) -> VirshboxResult<Credential> {
        let sandbox_dir = self.sandbox_dir(sandbox_id);
        let dir = sandbox_dir.join(format!("{username}-{}", short_id()));
        create_private_dir(&self.config.key_dir).await?;
        create_private_dir(&sandbox_dir).await?;
        create_private_dir(&dir).await?;

        let result = self.issue_into(&dir, sandbox_id, username).await;
        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                tracing::warn!(path = %dir.display(), error = %e, "failed to remove partial credential");
            }
        }

        result
    }

    async fn issue_into(
        &self,
        dir: &Path,
        sandbox_id: &str,
        username: &str,
    ) -> VirshboxResult<Credential> {
        let key = KeyPair::generate(format!("sandbox-{sandbox_id}-{username}"));
        let private_key_path = dir.join(PRIVATE_KEY_FILENAME);
        write_with_mode(&private_key_path, key.to_openssh().as_bytes(), PRIVATE_KEY_MODE).await?;

        let now = self.clock.now();
        let request = CertificateRequest::builder()
            .user_id(format!("sandbox-runner:{sandbox_id}"))
            .sandbox_id(sandbox_id)
            .public_key(key.public_key_line())
            .ttl(self.config.cert_ttl)
            .principals(vec![username.to_string()])
            .source_ip(INTERNAL_SOURCE_IP)
            .request_time(now)
            .build();

        let issued = self
            .authority
            .issue_certificate(request)
            .await
            .map_err(|e| match e {
                VirshboxError::CertificateIssuance(_) => e,
                other => VirshboxError::CertificateIssuance(other.to_string()),
            })?;

        let credential = Credential {
            private_key_path,
            certificate_path: dir.join(CERTIFICATE_FILENAME),
            public_key: key.public_key_line(),
            username: username.to_string(),
            valid_until: issued.valid_before,
            sandbox_id: sandbox_id.to_string(),
        };

        if !credential.is_fresh(now, self.config.refresh_margin) {
            return Err(VirshboxError::CertificateExpiresTooSoon {
                sandbox_id: sandbox_id.to_string(),
                valid_before: issued.valid_before,
            });
        }

        let mut certificate = issued.certificate;
        certificate.push('\n');
        write_with_mode(&credential.certificate_path, certificate.as_bytes(), CERTIFICATE_MODE)
            .await?;

        tracing::info!(
            sandbox_id = sandbox_id,
            username = username,
            serial = issued.serial,
            valid_until = %credential.valid_until,
            "issued sandbox credential"
        );
        Ok(credential)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Fails with [`VirshboxError::InvalidKeyPermissions`] if `path` is accessible to group or
/// others, which `ssh` would refuse anyway.
pub async fn check_private_key_permissions(path: &Path) -> VirshboxResult<()> {
    let mode = fs::metadata(path).await?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(VirshboxError::InvalidKeyPermissions {
            path: path.to_path_buf(),
            mode,
        });
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn cache_key(sandbox_id: &str, username: &str) -> String {
    format!("{sandbox_id}:{username}")
}

fn validate_component(label: &str, value: &str) -> VirshboxResult<()> {
    let unsafe_char = value
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
    if value.is_empty() || value == "." || value == ".." || unsafe_char {
        return Err(VirshboxError::InvalidArgument(format!(
            "{label} {value:?} must be a non-empty name made of letters, digits, '-', '_' or '.'"
        )));
    }

    Ok(())
}

async fn create_private_dir(path: &Path) -> VirshboxResult<()> {
    fs::create_dir_all(path).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE)).await?;
    Ok(())
}

/// Creates `path` with `mode` from the first byte written. Fails if it already exists.
pub(super) async fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> VirshboxResult<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents).await?;
    tokio::io::AsyncWriteExt::flush(&mut file).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
