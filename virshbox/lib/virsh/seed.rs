//! Cloud-init NoCloud seed authoring.

use std::{fmt::Write as _, path::Path};

use typed_builder::TypedBuilder;

use crate::{
    exec::{CommandExecutor, CommandLine},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The volume label cloud-init's NoCloud datasource looks for.
pub const SEED_VOLUME_LABEL: &str = "cidata";

/// Where the guest's sshd finds the trusted user CA.
pub const GUEST_CA_PUB_PATH: &str = "/etc/ssh/ssh_ca.pub";

const NETWORK_CONFIG: &str = "\
# Ensure networking is configured via DHCP
network:
  version: 2
  ethernets:
    id0:
      match:
        driver: virtio*
      dhcp4: true
";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The contents of a NoCloud seed image.
///
/// A fresh `instance_id` is what makes cloud-init on a cloned disk redo its per-instance setup,
/// network configuration included.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CloudInitSeed {
    /// The instance id written to `meta-data`.
    #[builder(setter(into))]
    pub instance_id: String,

    /// The guest hostname.
    #[builder(setter(into))]
    pub hostname: String,

    /// The user certificate CA sshd should trust.
    #[builder(default, setter(strip_option, into))]
    pub ca_public_key: Option<String>,

    /// The account that logs in with CA-signed certificates.
    #[builder(default, setter(strip_option, into))]
    pub sandbox_user: Option<String>,

    /// An account to create with an authorized public key.
    #[builder(default, setter(strip_option))]
    pub authorized_key: Option<(String, String)>,
}

/// The ISO authoring tools the seed can be built with, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoTool {
    /// `cloud-localds` from cloud-image-utils.
    CloudLocalds,

    /// `genisoimage`.
    Genisoimage,

    /// `mkisofs`.
    Mkisofs,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CloudInitSeed {
    /// Renders `user-data`.
    pub fn user_data(&self) -> String {
        let mut out = String::from("#cloud-config\n");
        out.push_str("# Re-run network configuration on the first boot of a new instance\n\n");
        out.push_str(NETWORK_CONFIG);

        let ca_key = self
            .ca_public_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        let mut accounts: Vec<(&str, Option<&str>)> = Vec::new();
        if ca_key.is_some() {
            if let Some(user) = self.sandbox_user.as_deref() {
                accounts.push((user, None));
            }
        }
        if let Some((user, key)) = &self.authorized_key {
            match accounts.iter_mut().find(|(name, _)| *name == user.as_str()) {
                Some(entry) => entry.1 = Some(key.trim()),
                None => accounts.push((user.as_str(), Some(key.trim()))),
            }
        }

        if !accounts.is_empty() {
            out.push_str("\nusers:\n  - default\n");
            for (name, key) in &accounts {
                let _ = writeln!(out, "  - name: {name}");
                out.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
                out.push_str("    shell: /bin/bash\n");
                out.push_str("    lock_passwd: true\n");
                if let Some(key) = key {
                    out.push_str("    ssh_authorized_keys:\n");
                    let _ = writeln!(out, "      - {key}");
                }
            }
        }

        if let Some(key) = ca_key {
            out.push_str("\nwrite_files:\n");
            let _ = writeln!(out, "  - path: {GUEST_CA_PUB_PATH}");
            out.push_str("    content: |\n");
            let _ = writeln!(out, "      {key}");
            out.push_str("    permissions: '0644'\n");
            out.push_str("    owner: root:root\n");

            out.push_str("\nruncmd:\n  - |\n");
            let _ = writeln!(out, "    if [ -s {GUEST_CA_PUB_PATH} ]; then");
            out.push_str("      if ! grep -q \"TrustedUserCAKeys\" /etc/ssh/sshd_config; then\n");
            let _ = writeln!(
                out,
                "        echo \"TrustedUserCAKeys {GUEST_CA_PUB_PATH}\" >> /etc/ssh/sshd_config"
            );
            out.push_str("        systemctl restart sshd || systemctl restart ssh || true\n");
            out.push_str("      fi\n    fi\n");
        }

        out
    }

    /// Renders `meta-data`.
    pub fn meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.instance_id, self.hostname
        )
    }

    /// Writes `user-data` and `meta-data` into `source_dir` and authors `output` from them.
    pub async fn build(
        &self,
        executor: &dyn CommandExecutor,
        source_dir: &Path,
        output: &Path,
    ) -> VirshboxResult<()> {
        executor.create_dir_all(source_dir).await?;

        let user_data = source_dir.join("user-data");
        let meta_data = source_dir.join("meta-data");
        executor
            .write_file(&user_data, self.user_data().as_bytes())
            .await?;
        executor
            .write_file(&meta_data, self.meta_data().as_bytes())
            .await?;

        let tool = IsoTool::detect(executor).await.ok_or_else(|| {
            VirshboxError::NotFound(
                "cloud-init seed build tools not found: need cloud-localds or genisoimage/mkisofs"
                    .to_string(),
            )
        })?;

        tracing::debug!(
            host = %executor.target(),
            tool = tool.program(),
            output = %output.display(),
            "authoring cloud-init seed"
        );
        executor
            .run_checked(tool.command(output, &user_data, &meta_data))
            .await?;

        Ok(())
    }
}

impl IsoTool {
    /// All tools, in order of preference.
    pub const ALL: [IsoTool; 3] = [IsoTool::CloudLocalds, IsoTool::Genisoimage, IsoTool::Mkisofs];

    /// The tool's binary.
    pub fn program(&self) -> &'static str {
        match self {
            IsoTool::CloudLocalds => "cloud-localds",
            IsoTool::Genisoimage => "genisoimage",
            IsoTool::Mkisofs => "mkisofs",
        }
    }

    /// The first tool available on the executor's host.
    pub async fn detect(executor: &dyn CommandExecutor) -> Option<IsoTool> {
        for tool in Self::ALL {
            if executor.has_program(tool.program()).await {
                return Some(tool);
            }
        }

        None
    }

    /// The invocation that authors `output` from the two seed files.
    pub fn command(&self, output: &Path, user_data: &Path, meta_data: &Path) -> CommandLine {
        let output = output.to_string_lossy();
        let user_data = user_data.to_string_lossy();
        let meta_data = meta_data.to_string_lossy();

        match self {
            IsoTool::CloudLocalds => {
                CommandLine::new(self.program()).args([output, user_data, meta_data])
            }
            IsoTool::Genisoimage => CommandLine::new(self.program())
                .args(["-output".into(), output])
                .args(["-volid", SEED_VOLUME_LABEL, "-joliet", "-rock"])
                .args([user_data, meta_data]),
            IsoTool::Mkisofs => CommandLine::new(self.program())
                .args(["-output".into(), output])
                .args(["-V", SEED_VOLUME_LABEL, "-J", "-R"])
                .args([user_data, meta_data]),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_seed_only_configures_dhcp() {
        let seed = CloudInitSeed::builder()
            .instance_id("sbx-1-4f2a9c1e")
            .hostname("sbx-1")
            .build();

        let user_data = seed.user_data();
        assert!(user_data.starts_with("#cloud-config\n"));
        assert!(user_data.contains("        driver: virtio*\n      dhcp4: true\n"));
        assert!(!user_data.contains("users:"));
        assert!(!user_data.contains("TrustedUserCAKeys"));

        assert_eq!(
            seed.meta_data(),
            "instance-id: sbx-1-4f2a9c1e\nlocal-hostname: sbx-1\n"
        );
    }

    #[test]
    fn test_seed_with_ca_trusts_it_for_the_sandbox_user() {
        let seed = CloudInitSeed::builder()
            .instance_id("sbx-2-1")
            .hostname("sbx-2")
            .ca_public_key("ssh-ed25519 AAAAC3Nza virshbox-ca\n")
            .sandbox_user("sandbox")
            .build();

        let user_data = seed.user_data();
        assert!(user_data.contains("users:\n  - default\n  - name: sandbox\n"));
        assert!(user_data.contains("    lock_passwd: true\n"));
        assert!(user_data.contains("    content: |\n      ssh-ed25519 AAAAC3Nza virshbox-ca\n"));
        assert!(user_data
            .contains("echo \"TrustedUserCAKeys /etc/ssh/ssh_ca.pub\" >> /etc/ssh/sshd_config"));
    }

    #[test]
    fn test_seed_with_authorized_key_merges_into_sandbox_user() {
        let seed = CloudInitSeed::builder()
            .instance_id("sbx-3-1")
            .hostname("sbx-3")
            .ca_public_key("ssh-ed25519 CA")
            .sandbox_user("sandbox")
            .authorized_key(("sandbox".to_string(), "ssh-ed25519 USER".to_string()))
            .build();

        let user_data = seed.user_data();
        assert_eq!(user_data.matches("- name: sandbox").count(), 1);
        assert!(user_data.contains("    ssh_authorized_keys:\n      - ssh-ed25519 USER\n"));
    }

    #[test]
    fn test_iso_tool_invocations() {
        let out = Path::new("/jobs/sbx-1/cloud-init.iso");
        let user = Path::new("/jobs/sbx-1/cloud-init/user-data");
        let meta = Path::new("/jobs/sbx-1/cloud-init/meta-data");

        assert_eq!(
            IsoTool::CloudLocalds.command(out, user, meta).to_string(),
            "cloud-localds /jobs/sbx-1/cloud-init.iso /jobs/sbx-1/cloud-init/user-data /jobs/sbx-1/cloud-init/meta-data"
        );
        assert_eq!(
            IsoTool::Genisoimage.command(out, user, meta).get_args()[..6],
            [
                "-output",
                "/jobs/sbx-1/cloud-init.iso",
                "-volid",
                "cidata",
                "-joliet",
                "-rock"
            ]
        );
        assert_eq!(
            IsoTool::Mkisofs.command(out, user, meta).get_args()[2..6],
            ["-V", "cidata", "-J", "-R"]
        );
    }
}
