//! `virshbox` provisions short-lived KVM sandboxes cloned from base domains across a fleet of
//! libvirt hosts.
//!
//! # Overview
//!
//! virshbox drives `virsh` and `qemu-img` on the local host or over SSH to:
//! - clone a base domain into a copy-on-write sandbox
//! - boot it and discover its address
//! - run commands inside it with short-lived SSH certificates
//! - snapshot it and record what happened inside
//! - tear it down when it is destroyed or its TTL runs out
//!
//! # Architecture
//!
//! - **exec**: Command execution on the local host or a remote one over SSH, with shell safety
//! - **domain**: Editing and generating libvirt domain descriptors
//! - **virsh**: The Domain Manager, one host's sandbox lifecycle
//! - **fleet**: Finding domains across many hosts concurrently
//! - **credentials**: An SSH certificate authority and per-sandbox ephemeral credentials
//! - **store**: Sandbox, snapshot, command and diff records in SQLite
//! - **service**: Sandbox orchestration and the expiry janitor
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use virshbox::{
//!     config::VirshboxConfig,
//!     exec::LocalExecutor,
//!     service::{CreateSandboxRequest, SandboxService, ServiceConfig},
//!     store::SqliteStore,
//!     virsh::{DomainManager, DomainManagerConfig},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = VirshboxConfig::load(VirshboxConfig::default_path()).await?;
//!     let manager = DomainManager::new(
//!         Arc::new(LocalExecutor::default()),
//!         DomainManagerConfig::from_config(&config, None)?,
//!     );
//!
//!     let service = SandboxService::builder()
//!         .manager(manager)
//!         .store(Arc::new(SqliteStore::open(config.get_database().get_path()).await?))
//!         .config(ServiceConfig::from_config(&config))
//!         .build();
//!
//!     let sandbox = service
//!         .create_sandbox(
//!             CreateSandboxRequest::builder()
//!                 .source("base-ubuntu")
//!                 .agent_id("agent-1")
//!                 .auto_start(true)
//!                 .wait_for_ip(true)
//!                 .build(),
//!         )
//!         .await?;
//!
//!     println!("{} is running at {:?}", sandbox.sandbox_name, sandbox.ip_address);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod exec;
pub mod fleet;
pub mod service;
pub mod store;
pub mod utils;
pub mod virsh;

pub use error::*;
