use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a virshbox-related operation.
pub type VirshboxResult<T> = Result<T, VirshboxError>;

/// An error that occurred while managing sandboxes, domains or credentials.
#[derive(pretty_error_debug::Debug, Error)]
pub enum VirshboxError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A required argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A string was rejected before reaching a shell command line.
    #[error("unsafe shell input: {0}")]
    Shell(#[from] ShellInputError),

    /// An external command exited with a non-zero status.
    #[error("command `{command}` failed with status {}: {stderr}", .status.map(|s| s.to_string()).unwrap_or_else(|| "signal".to_string()))]
    CommandFailed {
        /// The program that was run.
        command: String,

        /// The exit status, if the process exited normally.
        status: Option<i32>,

        /// The captured standard error.
        stderr: String,
    },

    /// An external command did not finish within its deadline.
    #[error("command `{command}` timed out after {}s", .timeout.as_secs())]
    CommandTimedOut {
        /// The program that was run.
        command: String,

        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The SSH transport itself failed, as opposed to the remote command.
    #[error("ssh transport to {host} failed: {message}")]
    SshTransport {
        /// The `user@address:port` the connection targeted.
        host: String,

        /// The transport's error output.
        message: String,
    },

    /// The domain descriptor could not be parsed.
    #[error("domain descriptor parse error: {0}")]
    DescriptorParse(String),

    /// A required element is missing from the domain descriptor.
    #[error("domain descriptor is missing <{0}>")]
    DescriptorMissing(&'static str),

    /// The source descriptor has no virtio disk with device role "disk".
    #[error("could not find a virtio disk in the source descriptor to replace")]
    NoPrimaryDiskFound,

    /// No configured host reported the domain.
    #[error("domain {name:?} not found on any {}", .last_error.as_ref().map(|e| format!("host (last error: {e})")).unwrap_or_else(|| "configured host".to_string()))]
    DomainNotFoundOnAnyHost {
        /// The domain that was searched for.
        name: String,

        /// The last transport-level error seen while searching, if any.
        last_error: Option<String>,
    },

    /// A fleet operation was attempted with an empty host list.
    #[error("no hosts configured")]
    NoHostsConfigured,

    /// No IPv4 lease appeared for the domain before the deadline.
    #[error("no ip address found for domain {name:?} within {}s", .timeout.as_secs())]
    IpNotFoundWithinTimeout {
        /// The domain that was polled.
        name: String,

        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The certificate authority refused or failed to issue a certificate.
    #[error("certificate issuance failed: {0}")]
    CertificateIssuance(String),

    /// An issued certificate would already be inside its refresh margin.
    #[error("certificate for sandbox {sandbox_id} expires too soon ({valid_before})")]
    CertificateExpiresTooSoon {
        /// The sandbox the certificate was issued for.
        sandbox_id: String,

        /// The certificate's expiry.
        valid_before: DateTime<Utc>,
    },

    /// A private key file is readable by group or others.
    #[error("private key {path:?} has insecure permissions {mode:o}")]
    InvalidKeyPermissions {
        /// The key file.
        path: PathBuf,

        /// The file's permission bits.
        mode: u32,
    },

    /// A key could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation conflicts with the current state of a record.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An error that occurred during a database operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred during a database migration.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred while parsing the configuration file.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// An error that occurred during JSON (de)serialization.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// An error that occurred when validating a string destined for a shell command line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShellInputError {
    /// The input is longer than the allowed ceiling.
    #[error("input is {len} bytes, exceeding the {max} byte limit")]
    TooLong {
        /// The input length in bytes.
        len: usize,

        /// The allowed ceiling.
        max: usize,
    },

    /// The input contains a null byte.
    #[error("input contains a null byte")]
    NullByte,

    /// The input contains a control character other than tab or newline.
    #[error("input contains control character {ch:?} at byte {position}")]
    ControlChar {
        /// The byte offset of the character.
        position: usize,

        /// The offending character.
        ch: char,
    },
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VirshboxError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> VirshboxError {
        VirshboxError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether the error came from the transport or a deadline rather than the remote command.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VirshboxError::SshTransport { .. }
                | VirshboxError::CommandTimedOut { .. }
                | VirshboxError::Io(_)
        )
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `VirshboxResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> VirshboxResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_on_any_host_message_distinguishes_transport_errors() {
        let plain = VirshboxError::DomainNotFoundOnAnyHost {
            name: "vm-1".to_string(),
            last_error: None,
        };
        assert_eq!(
            plain.to_string(),
            "domain \"vm-1\" not found on any configured host"
        );

        let annotated = VirshboxError::DomainNotFoundOnAnyHost {
            name: "vm-1".to_string(),
            last_error: Some("connection refused".to_string()),
        };
        assert_eq!(
            annotated.to_string(),
            "domain \"vm-1\" not found on any host (last error: connection refused)"
        );
    }

    #[test]
    fn test_transport_classification() {
        let transport = VirshboxError::SshTransport {
            host: "root@10.0.0.1:22".to_string(),
            message: "no route to host".to_string(),
        };
        assert!(transport.is_transport());

        let failed = VirshboxError::CommandFailed {
            command: "virsh".to_string(),
            status: Some(1),
            stderr: "error: failed to get domain".to_string(),
        };
        assert!(!failed.is_transport());
    }
}
