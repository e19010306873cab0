//! Scripted hosts and guests for exercising the service without libvirt.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use super::{GuestTarget, SshRunner};
use crate::{
    exec::{CommandExecutor, CommandLine, CommandOutput},
    virsh::{DomainManager, DomainManagerConfig},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

pub(crate) const SOURCE_XML: &str = r#"<domain type='kvm'>
  <name>base-ubuntu</name>
  <uuid>6d1c3a52-0000-4000-8000-000000000001</uuid>
  <memory unit='KiB'>1048576</memory>
  <currentMemory unit='KiB'>1048576</currentMemory>
  <vcpu placement='static'>1</vcpu>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/base/ubuntu.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:11:22:33'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>"#;

pub(crate) const LEASED_IP: &str = "192.168.122.63";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Answers commands whose rendered line contains a pattern; anything else exits 1.
pub(crate) struct FakeHost {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
}

/// Records guest commands and answers them all the same way.
pub(crate) struct FakeSsh {
    reply: Mutex<Option<CommandOutput>>,
    calls: Mutex<Vec<(GuestTarget, String)>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeHost {
    /// A host with `base-ubuntu` defined whose clones boot and lease [`LEASED_IP`].
    pub(crate) fn with_base_domain() -> Arc<Self> {
        let host = Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        });
        host.answer("dominfo base-ubuntu", ok("Name:           base-ubuntu\n"));
        host.answer(
            "domblklist base-ubuntu",
            ok(" file       disk     vda      /var/lib/libvirt/images/base/ubuntu.qcow2\n"),
        );
        host.answer("dumpxml base-ubuntu", ok(SOURCE_XML));
        host.answer("qemu-img create", ok(""));
        host.answer("undefine", ok("Domain undefined\n"));
        host.answer(" define ", ok("Domain defined\n"));
        host.answer("domuuid", ok("0b6c5d2e-1111-4000-8000-000000000002\n"));
        host.answer(" start ", ok("Domain started\n"));
        host.answer(" shutdown ", ok("Domain is being shutdown\n"));
        host.answer(" destroy ", ok("Domain destroyed\n"));
        host.answer("domstate", ok("running\n"));
        host.answer(
            "domifaddr",
            ok(&format!(
                " Name       MAC address          Protocol     Address\n-------\n vnet0      52:54:00:6b:3c:86    ipv4         {LEASED_IP}/24\n"
            )),
        );
        host.answer("snapshot-create-as", ok("Domain snapshot created\n"));
        host
    }

    /// A host that knows no domains.
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answers lines containing `pattern` with `output`, ahead of earlier rules.
    pub(crate) fn answer(&self, pattern: &str, output: CommandOutput) {
        self.rules
            .lock()
            .unwrap()
            .insert(0, (pattern.to_string(), output));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn called(&self, pattern: &str) -> bool {
        self.calls().iter().any(|line| line.contains(pattern))
    }
}

impl FakeSsh {
    pub(crate) fn replying(output: CommandOutput) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(Some(output)),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A guest that is never reachable.
    pub(crate) fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<(GuestTarget, String)> {
        self.calls.lock().unwrap().clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CommandExecutor for FakeHost {
    fn target(&self) -> String {
        "fake".to_string()
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn run(&self, command: CommandLine) -> VirshboxResult<CommandOutput> {
        let line = command.to_string();
        self.calls.lock().unwrap().push(line.clone());
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| fail("unexpected command")))
    }

    async fn write_file(&self, _path: &Path, _contents: &[u8]) -> VirshboxResult<()> {
        Ok(())
    }

    async fn create_dir_all(&self, _path: &Path) -> VirshboxResult<()> {
        Ok(())
    }

    async fn remove_dir_all(&self, path: &Path) -> VirshboxResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("rm -rf {}", path.display()));
        Ok(())
    }

    async fn path_exists(&self, _path: &Path) -> VirshboxResult<bool> {
        Ok(false)
    }

    async fn has_program(&self, _program: &str) -> bool {
        false
    }
}

#[async_trait]
impl SshRunner for FakeSsh {
    async fn run(
        &self,
        target: &GuestTarget,
        command: &str,
        _timeout: Duration,
    ) -> VirshboxResult<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((target.clone(), command.to_string()));

        match self.reply.lock().unwrap().clone() {
            Some(output) => Ok(output),
            None => Err(VirshboxError::SshTransport {
                host: format!("{}@{}", target.user, target.address),
                message: "Connection refused".to_string(),
            }),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        status: Some(0),
    }
}

pub(crate) fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        status: Some(1),
    }
}

pub(crate) fn manager(host: Arc<FakeHost>) -> DomainManager {
    DomainManager::new(
        host,
        DomainManagerConfig::builder()
            .work_dir("/jobs")
            .ip_poll_interval(Duration::from_millis(10))
            .build(),
    )
}
