use std::{path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt, process::Command};

use super::{CommandExecutor, CommandLine, CommandOutput};
use crate::{config::DEFAULT_COMMAND_TIMEOUT, VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs commands as child processes of the current process.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    default_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalExecutor {
    /// Creates an executor that gives up on commands after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Spawns the command, feeds stdin and waits for it to exit or for the deadline.
    pub(crate) async fn spawn_and_wait(
        &self,
        command: &CommandLine,
    ) -> VirshboxResult<CommandOutput> {
        let timeout = command.get_timeout().unwrap_or(self.default_timeout);
        tracing::debug!(target_host = "local", command = %command, "running command");

        let mut child = Command::new(command.get_program())
            .args(command.get_args())
            .stdin(if command.get_stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let writer = match (command.get_stdin(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.to_vec();
                Some(tokio::spawn(async move {
                    stdin.write_all(&input).await?;
                    stdin.shutdown().await
                }))
            }
            _ => None,
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(VirshboxError::CommandTimedOut {
                    command: command.get_program().to_string(),
                    timeout,
                })
            }
        };

        if let Some(writer) = writer {
            if let Err(e) = writer.await? {
                tracing::debug!(error = %e, "child closed stdin early");
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    fn target(&self) -> String {
        "local".to_string()
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn run(&self, command: CommandLine) -> VirshboxResult<CommandOutput> {
        self.spawn_and_wait(&command).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> VirshboxResult<()> {
        fs::write(path, contents).await?;
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> VirshboxResult<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn remove_dir_all(&self, path: &Path) -> VirshboxResult<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn path_exists(&self, path: &Path) -> VirshboxResult<bool> {
        Ok(fs::try_exists(path).await?)
    }

    async fn has_program(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
