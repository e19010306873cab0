use std::time::Duration;

use async_trait::async_trait;

use super::{CommandExecutor, CommandLine, CommandOutput, LocalExecutor};
use crate::{config::HostConfig, VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Seconds the SSH client waits for the TCP connection to a host.
pub const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

/// The exit status the OpenSSH client reserves for its own failures.
const SSH_TRANSPORT_EXIT_STATUS: i32 = 255;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs commands on a remote host through the system `ssh` client in batch mode.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    address: String,
    user: String,
    port: u16,
    proxy_jump: Option<String>,
    local: LocalExecutor,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SshExecutor {
    /// Creates an executor for `user@address:port`.
    pub fn new(
        address: impl Into<String>,
        user: impl Into<String>,
        port: u16,
        default_timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            port,
            proxy_jump: None,
            local: LocalExecutor::new(default_timeout),
        }
    }

    /// Creates an executor for a configured fleet host, using its query timeout.
    pub fn for_host(host: &HostConfig) -> Self {
        Self::new(
            host.get_address(),
            host.get_ssh_user(),
            *host.get_ssh_port(),
            host.query_timeout(),
        )
    }

    /// Routes the connection through a jump host.
    pub fn with_proxy_jump(mut self, proxy_jump: impl Into<String>) -> Self {
        self.proxy_jump = Some(proxy_jump.into());
        self
    }

    /// The `ssh` invocation that runs `command` on the remote host. Fails if any part of
    /// `command` is unsafe for a shell.
    pub fn wrap(&self, command: &CommandLine) -> VirshboxResult<CommandLine> {
        let mut ssh = CommandLine::new("ssh").args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
        ]);
        ssh = ssh.arg(format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"));

        if let Some(jump) = &self.proxy_jump {
            ssh = ssh.arg("-J").arg(jump);
        }

        ssh = ssh
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, self.address))
            .arg(command.to_shell_string()?);

        if let Some(input) = command.get_stdin() {
            ssh = ssh.stdin(input.to_vec());
        }

        if let Some(timeout) = command.get_timeout() {
            ssh = ssh.timeout(timeout);
        }

        Ok(ssh)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CommandExecutor for SshExecutor {
    fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.address, self.port)
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn run(&self, command: CommandLine) -> VirshboxResult<CommandOutput> {
        tracing::debug!(target_host = %self.target(), command = %command, "running remote command");

        let output = self.local.spawn_and_wait(&self.wrap(&command)?).await?;
        if output.status == Some(SSH_TRANSPORT_EXIT_STATUS) {
            return Err(VirshboxError::SshTransport {
                host: self.target(),
                message: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShellInputError;

    #[test]
    fn test_wrap_builds_batch_mode_invocation() -> anyhow::Result<()> {
        let executor = SshExecutor::new("10.0.0.5", "root", 2222, Duration::from_secs(30));
        let wrapped = executor.wrap(&CommandLine::new("virsh").arg("list").arg("--all"))?;

        assert_eq!(wrapped.get_program(), "ssh");
        assert_eq!(
            wrapped.get_args(),
            &[
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "-o",
                "ConnectTimeout=10",
                "-p",
                "2222",
                "root@10.0.0.5",
                "'virsh' 'list' '--all'",
            ]
        );
        assert_eq!(executor.target(), "root@10.0.0.5:2222");
        Ok(())
    }

    #[test]
    fn test_wrap_with_proxy_jump_and_stdin() -> anyhow::Result<()> {
        let executor = SshExecutor::new("kvm-2", "ops", 22, Duration::from_secs(30))
            .with_proxy_jump("bastion.example.com");
        let wrapped = executor.wrap(&CommandLine::new("cat").stdin("payload"))?;

        let args = wrapped.get_args();
        let jump = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[jump + 1], "bastion.example.com");
        assert_eq!(wrapped.get_stdin(), Some(&b"payload"[..]));
        Ok(())
    }

    #[test]
    fn test_wrap_refuses_unsafe_arguments() {
        let executor = SshExecutor::new("kvm-2", "ops", 22, Duration::from_secs(30));
        let result = executor.wrap(&CommandLine::new("virsh").arg("start").arg("sbx\u{7}"));
        assert!(matches!(
            result,
            Err(VirshboxError::Shell(ShellInputError::ControlChar { .. }))
        ));
    }
}
