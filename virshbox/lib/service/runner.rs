use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::fs;

use crate::{
    credentials::check_private_key_permissions,
    exec::{shell_quote, CommandExecutor, CommandLine, CommandOutput, LocalExecutor},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Seconds ssh waits for a sandbox to accept the connection.
pub const GUEST_CONNECT_TIMEOUT_SECS: u64 = 15;

/// The exit status ssh reports when the connection itself fails.
pub const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Runs a shell command inside a sandbox over SSH.
#[async_trait]
pub trait SshRunner: Send + Sync {
    /// Runs `command` as `target.user` and captures its output whatever its exit status.
    ///
    /// Errors mean the command never ran or never finished: bad key files, a transport
    /// failure or the deadline.
    async fn run(
        &self,
        target: &GuestTarget,
        command: &str,
        timeout: Duration,
    ) -> VirshboxResult<CommandOutput>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where and as whom a guest command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestTarget {
    /// The guest's address.
    pub address: String,

    /// The login user.
    pub user: String,

    /// The private key to authenticate with.
    pub private_key_path: PathBuf,

    /// The user certificate presented with the key, for CA-trusting guests.
    pub certificate_path: Option<PathBuf>,
}

/// Runs guest commands with the system `ssh` client.
#[derive(Clone)]
pub struct SystemSshRunner {
    executor: Arc<dyn CommandExecutor>,
    proxy_jump: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SystemSshRunner {
    /// Creates a runner that spawns `ssh` on the local host.
    pub fn new() -> Self {
        Self::with_executor(Arc::new(LocalExecutor::default()))
    }

    /// Creates a runner that spawns `ssh` through `executor`.
    pub fn with_executor(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            proxy_jump: None,
        }
    }

    /// Routes every connection through a jump host.
    pub fn with_proxy_jump(mut self, proxy_jump: Option<String>) -> Self {
        self.proxy_jump = proxy_jump.filter(|j| !j.is_empty());
        self
    }

    /// The `ssh` invocation for `command` on `target`.
    pub fn command_line(
        &self,
        target: &GuestTarget,
        command: &str,
        timeout: Duration,
    ) -> CommandLine {
        let mut line = CommandLine::new("ssh")
            .arg("-i")
            .arg(target.private_key_path.to_string_lossy());

        if let Some(cert) = &target.certificate_path {
            line = line
                .arg("-o")
                .arg(format!("CertificateFile={}", cert.display()));
        }

        line = line
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .arg("-o")
            .arg(format!("ConnectTimeout={GUEST_CONNECT_TIMEOUT_SECS}"));

        if let Some(jump) = &self.proxy_jump {
            line = line.arg("-J").arg(jump);
        }

        line.arg(format!("{}@{}", target.user, target.address))
            .arg("--")
            .arg(command)
            .timeout(timeout)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SystemSshRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshRunner for SystemSshRunner {
    async fn run(
        &self,
        target: &GuestTarget,
        command: &str,
        timeout: Duration,
    ) -> VirshboxResult<CommandOutput> {
        check_private_key_permissions(&target.private_key_path).await?;
        if let Some(cert) = &target.certificate_path {
            if !fs::try_exists(cert).await? {
                return Err(VirshboxError::NotFound(format!(
                    "ssh certificate file {}",
                    cert.display()
                )));
            }
        }

        let output = self
            .executor
            .run(self.command_line(target, command, timeout))
            .await?;

        if output.status == Some(SSH_TRANSPORT_EXIT_CODE) {
            return Err(VirshboxError::SshTransport {
                host: format!("{}@{}", target.user, target.address),
                message: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Wraps `command` in a login shell, exporting `env` first.
///
/// Variable names are reduced to `[A-Za-z0-9_]`; values are single-quoted. Variables are
/// exported in name order.
pub fn command_with_env<'a>(
    command: &str,
    env: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> String {
    let mut exports: Vec<String> = env
        .into_iter()
        .map(|(key, value)| format!("export {}={}", safe_shell_ident(key), shell_quote(value)))
        .collect();
    exports.sort();

    if exports.is_empty() {
        return format!("bash -lc {}", shell_quote(command));
    }

    let script = format!("{}; {command}", exports.join("; "));
    format!("bash -lc {}", shell_quote(&script))
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn safe_shell_ident(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
