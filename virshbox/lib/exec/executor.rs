use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};

use super::{shell_quote, CommandLine, CommandOutput};
use crate::{VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Runs command lines on one host.
///
/// Only [`run`](CommandExecutor::run) is required. The filesystem helpers default to shell
/// commands so they work unchanged on remote hosts; local implementations override them.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// A human-readable name of the host commands run on.
    fn target(&self) -> String;

    /// Whether commands cross an SSH transport.
    fn is_remote(&self) -> bool;

    /// Runs a command and captures its output, whatever its exit status.
    async fn run(&self, command: CommandLine) -> VirshboxResult<CommandOutput>;

    /// Runs a command and fails with [`VirshboxError::CommandFailed`] on a non-zero exit.
    async fn run_checked(&self, command: CommandLine) -> VirshboxResult<CommandOutput> {
        let rendered = command.to_string();
        let output = self.run(command).await?;
        if !output.success() {
            return Err(VirshboxError::CommandFailed {
                command: rendered,
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }

    /// Writes `contents` to `path`, replacing any existing file.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> VirshboxResult<()> {
        let script = format!("base64 -d > {}", shell_quote(&path.to_string_lossy()));
        self.run_checked(
            CommandLine::new("sh")
                .arg("-c")
                .arg(script)
                .stdin(STANDARD.encode(contents)),
        )
        .await?;
        Ok(())
    }

    /// Creates `path` and any missing parents.
    async fn create_dir_all(&self, path: &Path) -> VirshboxResult<()> {
        self.run_checked(
            CommandLine::new("mkdir")
                .arg("-p")
                .arg(path.to_string_lossy()),
        )
        .await?;
        Ok(())
    }

    /// Removes `path` recursively. Missing paths are not an error.
    async fn remove_dir_all(&self, path: &Path) -> VirshboxResult<()> {
        self.run_checked(
            CommandLine::new("rm")
                .arg("-rf")
                .arg(path.to_string_lossy()),
        )
        .await?;
        Ok(())
    }

    /// Whether `path` exists on the host.
    async fn path_exists(&self, path: &Path) -> VirshboxResult<bool> {
        let output = self
            .run(CommandLine::new("test").arg("-e").arg(path.to_string_lossy()))
            .await?;
        Ok(output.success())
    }

    /// Whether `program` resolves on the host's `PATH`.
    async fn has_program(&self, program: &str) -> bool {
        let script = format!("command -v {}", shell_quote(program));
        self.run(CommandLine::new("sh").arg("-c").arg(script))
            .await
            .map(|output| output.success())
            .unwrap_or(false)
    }
}
