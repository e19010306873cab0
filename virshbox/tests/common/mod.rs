#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use virshbox::{
    config::HostConfig,
    exec::{CommandExecutor, CommandLine, CommandOutput},
    fleet::HostConnector,
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

pub const BASE_UBUNTU_XML: &str = r#"<domain type='kvm'>
  <name>base-ubuntu</name>
  <uuid>6d1c3a52-0000-4000-8000-000000000001</uuid>
  <memory unit='KiB'>1048576</memory>
  <currentMemory unit='KiB'>1048576</currentMemory>
  <vcpu placement='static'>1</vcpu>
  <os>
    <type arch='x86_64' machine='pc-q35-6.2'>hvm</type>
  </os>
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
      <address type='pci' domain='0x0000' bus='0x01' slot='0x00' function='0x0'/>
    </interface>
    <graphics type='vnc' port='-1' autoport='yes'/>
    <sound model='ich9'/>
  </devices>
</domain>"#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a scripted host answers a command.
#[derive(Clone)]
pub enum Reply {
    /// Exits with the given output.
    Output(CommandOutput),

    /// Fails as if the host could not be reached.
    Unreachable,

    /// Never answers.
    Hang,
}

/// A host that answers commands from a script of `(pattern, reply)` rules.
///
/// The last matching rule wins; unmatched commands exit 1.
pub struct ScriptedHost {
    name: String,
    rules: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<String>>,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

/// Hands out scripted hosts by host name.
#[derive(Default)]
pub struct ScriptedFleet {
    hosts: HashMap<String, Arc<ScriptedHost>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ScriptedHost {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
        })
    }

    /// A host holding the `base-ubuntu` domain whose clones boot and lease `ip`.
    pub fn with_base_ubuntu(name: &str, ip: &str) -> Arc<Self> {
        let host = Self::new(name);
        host.answer("dominfo base-ubuntu", ok("Name:           base-ubuntu\nUUID:           6d1c3a52-0000-4000-8000-000000000001\nState:          shut off\nPersistent:     yes\n"));
        host.answer(
            "domblklist base-ubuntu",
            ok(" Type   Device   Target   Source\n------------------------------------------------\n file   disk     vda      /var/lib/libvirt/images/base/ubuntu.qcow2\n"),
        );
        host.answer("dumpxml base-ubuntu", ok(BASE_UBUNTU_XML));
        host.answer("qemu-img create", ok("Formatting overlay\n"));
        host.answer(" define ", ok("Domain defined\n"));
        host.answer("domuuid", ok("0b6c5d2e-1111-4000-8000-000000000002\n"));
        host.answer(" start ", ok("Domain started\n"));
        host.answer("domstate", ok("running\n"));
        host.answer(
            "domifaddr",
            ok(&format!(
                " Name       MAC address          Protocol     Address\n-------------------------------------------------------\n vnet0      52:54:00:6b:3c:86    ipv4         {ip}/24\n"
            )),
        );
        host.answer(" destroy ", ok("Domain destroyed\n"));
        host.answer("undefine", ok("Domain undefined\n"));
        host
    }

    pub fn answer(&self, pattern: &str, output: CommandOutput) {
        self.reply(pattern, Reply::Output(output));
    }

    pub fn reply(&self, pattern: &str, reply: Reply) {
        self.rules.lock().unwrap().push((pattern.to_string(), reply));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls().iter().position(|line| line.contains(pattern))
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path.as_ref())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

impl ScriptedFleet {
    pub fn with(mut self, host: Arc<ScriptedHost>) -> Self {
        self.hosts.insert(host.name.clone(), host);
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CommandExecutor for ScriptedHost {
    fn target(&self) -> String {
        self.name.clone()
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn run(&self, command: CommandLine) -> VirshboxResult<CommandOutput> {
        let line = command.to_string();
        self.calls.lock().unwrap().push(line.clone());

        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Unreachable) => Err(VirshboxError::SshTransport {
                host: self.name.clone(),
                message: "ssh: connect to host: Connection refused".to_string(),
            }),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(VirshboxError::custom(anyhow::anyhow!("hung host woke up")))
            }
            None => Ok(fail("error: unexpected command")),
        }
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> VirshboxResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> VirshboxResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("mkdir -p {}", path.display()));
        Ok(())
    }

    async fn remove_dir_all(&self, path: &Path) -> VirshboxResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("rm -rf {}", path.display()));
        Ok(())
    }

    async fn path_exists(&self, path: &Path) -> VirshboxResult<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn has_program(&self, _program: &str) -> bool {
        false
    }
}

impl HostConnector for ScriptedFleet {
    fn connect(&self, host: &HostConfig) -> VirshboxResult<Arc<dyn CommandExecutor>> {
        self.hosts
            .get(host.get_name())
            .map(|h| h.clone() as Arc<dyn CommandExecutor>)
            .ok_or_else(|| VirshboxError::NotFound(format!("host {}", host.get_name())))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        status: Some(0),
    }
}

pub fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        status: Some(1),
    }
}

pub fn host(name: &str, address: &str, timeout_secs: u64) -> HostConfig {
    HostConfig::builder()
        .name(name)
        .address(address)
        .query_timeout_secs(timeout_secs)
        .build()
}
