use std::{sync::Arc, time::Duration};

use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};
use virshbox::{
    cli::{AnsiStyles, VirshboxArgs, VirshboxSubcommand},
    config::VirshboxConfig,
    credentials::{CredentialManager, CredentialManagerConfig, Ed25519Authority},
    exec::LocalExecutor,
    fleet::{MultiHostDiscovery, SshConnector},
    service::{CreateSandboxRequest, Janitor, SandboxService, ServiceConfig, SystemSshRunner},
    store::{SqliteStore, Store},
    virsh::{DomainManager, DomainManagerConfig},
    VirshboxError, VirshboxResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> VirshboxResult<()> {
    dotenvy::dotenv().ok();

    let args = VirshboxArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let Some(subcommand) = args.subcommand else {
        VirshboxArgs::command().print_help()?;
        return Ok(());
    };

    let config_path = args.config.unwrap_or_else(VirshboxConfig::default_path);
    let config = VirshboxConfig::load(&config_path).await?;
    let manager = local_manager(&config).await?;
    let fleet = fleet(&config);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match subcommand {
        VirshboxSubcommand::List { host } => {
            let domains = match host {
                Some(name) => {
                    let host = fleet
                        .hosts()
                        .iter()
                        .find(|h| *h.get_name() == name)
                        .ok_or_else(|| VirshboxError::NotFound(format!("host {name}")))?;
                    fleet
                        .manager_for(host, manager.config().clone())?
                        .list_domains()
                        .await?
                }
                None => manager.list_domains().await?,
            };

            for name in domains {
                println!("{name}");
            }
        }
        VirshboxSubcommand::Discover => {
            if fleet.hosts().is_empty() {
                return Err(VirshboxError::NoHostsConfigured);
            }

            let result = fleet.list_domains(&cancel).await?;
            for domain in &result.domains {
                println!(
                    "{}\t{}\t{}\t{}",
                    domain.host_name.header(),
                    domain.name,
                    domain.state,
                    domain.disk_path.as_deref().unwrap_or("-")
                );
            }
            for error in &result.host_errors {
                eprintln!(
                    "{} {} ({}): {}",
                    "unreachable".error(),
                    error.host_name,
                    error.host_address,
                    error.error
                );
            }
        }
        VirshboxSubcommand::FindHost { name } => {
            let host = fleet.find_host_for_vm(&name, &cancel).await?;
            println!("{}\t{}", host.get_name().header(), host.get_address());
        }
        VirshboxSubcommand::Validate { name } => {
            let result = manager.validate_source(&name).await?;
            let verdict = if result.valid {
                "valid".valid()
            } else {
                "invalid".invalid()
            };
            println!("{} {verdict} (state: {})", result.vm_name.header(), result.state);
            if let Some(mac) = &result.mac_address {
                println!("  mac: {mac}");
            }
            if let Some(ip) = &result.ip_address {
                println!("  ip:  {ip}");
            }
            for warning in &result.warnings {
                println!("  {} {warning}", "warning:".placeholder());
            }
            for error in &result.errors {
                println!("  {} {error}", "error:".error());
            }
        }
        VirshboxSubcommand::Resources { cpu, memory } => {
            let result = manager.check_host_resources(cpu, memory).await?;
            let verdict = if result.valid {
                "sufficient".valid()
            } else {
                "insufficient".invalid()
            };
            println!(
                "{verdict}: need {} vCPU / {} MiB, have {} CPU / {} of {} MiB free / {} MiB disk",
                result.required_cpus,
                result.required_memory_mb,
                result.available_cpus,
                result.available_memory_mb,
                result.total_memory_mb,
                result.available_disk_mb
            );
            for warning in &result.warnings {
                println!("  {} {warning}", "warning:".placeholder());
            }
            for error in &result.errors {
                println!("  {} {error}", "error:".error());
            }
        }
        VirshboxSubcommand::Clone {
            source,
            name,
            agent,
            cpu,
            memory,
            ttl,
            start,
        } => {
            let service = sandbox_service(&config, manager, fleet, cancel).await?;
            let mut request = CreateSandboxRequest::builder()
                .source(source)
                .agent_id(agent)
                .name(name)
                .vcpus(cpu)
                .memory_mb(memory)
                .auto_start(start)
                .wait_for_ip(start)
                .build();
            request.ttl_seconds = ttl;

            let sandbox = service.create_sandbox(request).await?;
            println!(
                "{}\t{}\t{}\t{}",
                sandbox.id.header(),
                sandbox.sandbox_name,
                sandbox.state,
                sandbox.ip_address.as_deref().unwrap_or("-")
            );
        }
        VirshboxSubcommand::Destroy { name } => {
            let service = sandbox_service(&config, manager.clone(), fleet, cancel).await?;
            match service.store().get_sandbox_by_name(&name).await {
                Ok(sandbox) => {
                    service.destroy_sandbox(&sandbox.id).await?;
                    println!("{} {}", "destroyed".valid(), sandbox.id);
                }
                Err(VirshboxError::NotFound(_)) => {
                    tracing::info!(domain = %name, "no sandbox record, destroying the domain directly");
                    let report = manager.destroy(&name).await?;
                    if report.is_clean() {
                        println!("{} {name}", "destroyed".valid());
                    } else {
                        println!("{} {name}: {report}", "partially destroyed".invalid());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        VirshboxSubcommand::Janitor { interval, once } => {
            let service = Arc::new(sandbox_service(&config, manager, fleet, cancel.clone()).await?);
            let mut janitor = Janitor::new(service);
            if let Some(secs) = interval {
                janitor = janitor.with_interval(Duration::from_secs(secs));
            }

            if once {
                for id in janitor.sweep().await {
                    println!("{} {id}", "destroyed".valid());
                }
            } else {
                let token = janitor.cancellation_token();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    token.cancel();
                });
                janitor.run().await;
            }
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn local_manager(config: &VirshboxConfig) -> VirshboxResult<DomainManager> {
    let ca_public_key = match config.get_ssh().get_ca_pub_path() {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read ssh ca public key");
                None
            }
        },
        None => None,
    };

    Ok(DomainManager::new(
        Arc::new(LocalExecutor::new(config.get_vm().command_timeout())),
        DomainManagerConfig::from_config(config, ca_public_key)?,
    ))
}

fn fleet(config: &VirshboxConfig) -> MultiHostDiscovery {
    let connector = SshConnector::new().with_proxy_jump(config.get_ssh().get_proxy_jump().clone());
    MultiHostDiscovery::new(config.get_hosts().clone(), Arc::new(connector))
        .with_uri(config.get_libvirt().get_uri().clone())
}

async fn sandbox_service(
    config: &VirshboxConfig,
    manager: DomainManager,
    fleet: MultiHostDiscovery,
    shutdown: CancellationToken,
) -> VirshboxResult<SandboxService> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config.get_database().get_path()).await?);
    let service_config = ServiceConfig::from_config(config);
    let ssh = Arc::new(SystemSshRunner::new().with_proxy_jump(service_config.proxy_jump.clone()));
    let fleet = (!fleet.hosts().is_empty()).then_some(fleet);

    let ssh_config = config.get_ssh();
    let credentials = match ssh_config.get_ca_key_path() {
        Some(key_path) => {
            let authority = Ed25519Authority::load_or_generate(
                key_path,
                ssh_config.get_ca_pub_path().as_deref(),
                ssh_config.max_ttl(),
            )
            .await?;
            Some(Arc::new(CredentialManager::new(
                Arc::new(authority),
                CredentialManagerConfig::from_config(ssh_config),
            )))
        }
        None => None,
    };

    Ok(SandboxService::builder()
        .manager(manager)
        .store(store)
        .config(service_config)
        .credentials(credentials)
        .ssh(ssh)
        .fleet(fleet)
        .shutdown(shutdown)
        .build())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            cancel.cancel();
        }
    });
}
