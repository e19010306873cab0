mod common;

use std::{sync::Arc, time::Duration};

use common::{ok, ScriptedHost};
use virshbox::{
    domain::DomainDescriptor,
    exec::CommandOutput,
    service::{
        CreateSandboxRequest, GuestTarget, RunCommandRequest, SandboxService, ServiceConfig,
        SshRunner,
    },
    store::{ListOptions, SandboxFilter, SandboxState, SqliteStore},
    utils::DOMAIN_XML_FILENAME,
    virsh::{DomainManager, DomainManagerConfig},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct EchoGuest;

#[async_trait::async_trait]
impl SshRunner for EchoGuest {
    async fn run(
        &self,
        target: &GuestTarget,
        command: &str,
        _timeout: Duration,
    ) -> VirshboxResult<CommandOutput> {
        Ok(CommandOutput {
            stdout: format!("{}@{}: {command}\n", target.user, target.address),
            stderr: String::new(),
            status: Some(0),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn manager(host: Arc<ScriptedHost>) -> DomainManager {
    DomainManager::new(
        host,
        DomainManagerConfig::builder()
            .work_dir("/jobs")
            .ip_poll_interval(Duration::from_millis(10))
            .build(),
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_clone_base_ubuntu_into_sbx_1() -> anyhow::Result<()> {
    let host = ScriptedHost::with_base_ubuntu("local", "192.168.122.63");
    let manager = manager(host.clone());

    let domain = manager
        .clone_from("base-ubuntu", "sbx-1", 2, 2048, Some("default"))
        .await?;
    assert_eq!(domain.name, "sbx-1");
    assert_eq!(
        domain.uuid.as_deref(),
        Some("0b6c5d2e-1111-4000-8000-000000000002")
    );

    // The name is checked first and the domain is defined last.
    let probe = host.position("dominfo sbx-1").unwrap();
    let disks = host.position("domblklist base-ubuntu --details").unwrap();
    let dump = host.position("dumpxml base-ubuntu").unwrap();
    let overlay = host
        .position("qemu-img create -f qcow2 -F qcow2 -b /var/lib/libvirt/images/base/ubuntu.qcow2 /jobs/sbx-1/disk-overlay.qcow2")
        .unwrap();
    let define = host.position("define /jobs/sbx-1/domain.xml").unwrap();
    assert!(probe < disks && disks < dump && dump < overlay && overlay < define);

    let xml = host
        .file(format!("/jobs/sbx-1/{DOMAIN_XML_FILENAME}"))
        .expect("descriptor written");
    let descriptor = DomainDescriptor::parse(&xml)?;
    assert_eq!(descriptor.name().as_deref(), Some("sbx-1"));
    assert!(descriptor.uuid().is_none());
    assert_eq!(descriptor.vcpu(), Some(2));
    assert_eq!(descriptor.memory_kib(), Some(2048 * 1024));
    assert_eq!(
        descriptor.primary_disk().and_then(|d| d.source).as_deref(),
        Some("/jobs/sbx-1/disk-overlay.qcow2")
    );
    let mac = descriptor.mac_address().expect("clone has a mac");
    assert!(mac.starts_with("52:54:00:"));
    assert_ne!(mac, "52:54:00:11:22:33");
    assert!(!xml.contains("<sound"));
    assert!(!xml.contains("6d1c3a52-0000-4000-8000-000000000001"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_clone_refuses_existing_name() -> anyhow::Result<()> {
    let host = ScriptedHost::with_base_ubuntu("local", "192.168.122.63");
    host.answer("dominfo sbx-1", ok("Name: sbx-1\n"));

    let result = manager(host.clone())
        .clone_from("base-ubuntu", "sbx-1", 0, 0, None)
        .await;
    assert!(matches!(result, Err(VirshboxError::AlreadyExists(_))));
    assert!(host.position("qemu-img").is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_sandbox_lifecycle_end_to_end() -> anyhow::Result<()> {
    let host = ScriptedHost::with_base_ubuntu("local", "192.168.122.63");
    let service = SandboxService::builder()
        .manager(manager(host.clone()))
        .store(Arc::new(SqliteStore::in_memory().await?))
        .config(
            ServiceConfig::builder()
                .ip_discovery_timeout(Duration::from_secs(1))
                .build(),
        )
        .ssh(Arc::new(EchoGuest))
        .build();

    let sandbox = service
        .create_sandbox(
            CreateSandboxRequest::builder()
                .source("base-ubuntu")
                .agent_id("agent-7")
                .name("sbx-1")
                .ttl_seconds(600)
                .auto_start(true)
                .wait_for_ip(true)
                .build(),
        )
        .await?;
    assert_eq!(sandbox.state, SandboxState::Running);
    assert_eq!(sandbox.ip_address.as_deref(), Some("192.168.122.63"));
    assert_eq!(sandbox.ttl_seconds, Some(600));

    let command = service
        .run_command(
            RunCommandRequest::builder()
                .sandbox_id(sandbox.id.clone())
                .command("uname -a")
                .username("ubuntu")
                .private_key_path("/home/op/.ssh/id_ed25519")
                .build(),
        )
        .await?;
    assert_eq!(command.exit_code, 0);
    assert_eq!(
        command.stdout,
        "ubuntu@192.168.122.63: bash -lc 'uname -a'\n"
    );

    let listed = service
        .list_sandboxes(
            &SandboxFilter {
                agent_id: Some("agent-7".to_string()),
                ..Default::default()
            },
            ListOptions::default(),
        )
        .await?;
    assert_eq!(listed.len(), 1);

    let destroyed = service.destroy_sandbox(&sandbox.id).await?;
    assert_eq!(destroyed.state, SandboxState::Destroyed);
    assert!(host.position("undefine sbx-1").is_some());
    assert!(host.position("rm -rf /jobs/sbx-1").is_some());

    let listed = service
        .list_sandboxes(&SandboxFilter::default(), ListOptions::default())
        .await?;
    assert!(listed.is_empty());
    Ok(())
}
