use std::path::PathBuf;

use clap::Parser;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// virshbox - short-lived KVM sandboxes cloned from base domains across libvirt hosts
#[derive(Debug, Parser)]
#[command(name = "virshbox", author, about, version, styles=styles::styles())]
pub struct VirshboxArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<VirshboxSubcommand>,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum VirshboxSubcommand {
    /// List the domains defined on the local host or on one fleet host
    #[command(name = "list")]
    List {
        /// Name of a configured fleet host to query instead of the local host
        #[arg(long)]
        host: Option<String>,
    },

    /// List the domains of every configured fleet host
    #[command(name = "discover")]
    Discover,

    /// Find the fleet host that holds a domain
    #[command(name = "find-host")]
    FindHost {
        /// Domain name
        name: String,
    },

    /// Check that a domain can be used as a clone source
    #[command(name = "validate")]
    Validate {
        /// Domain name
        name: String,
    },

    /// Check whether the local host has room for a sandbox
    #[command(name = "resources")]
    Resources {
        /// vCPUs the sandbox needs
        #[arg(long, default_value_t = 0)]
        cpu: u32,

        /// Memory in MiB the sandbox needs
        #[arg(long, default_value_t = 0)]
        memory: u32,
    },

    /// Clone a domain into a new sandbox
    #[command(name = "clone")]
    Clone {
        /// Domain to clone
        source: String,

        /// Name of the new sandbox domain
        name: String,

        /// Agent the sandbox is recorded for
        #[arg(long, default_value = "operator")]
        agent: String,

        /// vCPUs, defaults to the configured value
        #[arg(long, default_value_t = 0)]
        cpu: u32,

        /// Memory in MiB, defaults to the configured value
        #[arg(long, default_value_t = 0)]
        memory: u32,

        /// Seconds after which the janitor destroys the sandbox
        #[arg(long)]
        ttl: Option<u64>,

        /// Boot the sandbox and wait for its address
        #[arg(long)]
        start: bool,
    },

    /// Destroy a sandbox by domain name
    #[command(name = "destroy")]
    Destroy {
        /// Sandbox domain name
        name: String,
    },

    /// Destroy expired sandboxes until interrupted
    #[command(name = "janitor")]
    Janitor {
        /// Seconds between sweeps, defaults to 60
        #[arg(long)]
        interval: Option<u64>,

        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_consistent() {
        VirshboxArgs::command().debug_assert();
    }

    #[test]
    fn test_parses_global_flags_after_subcommand() -> anyhow::Result<()> {
        let args = VirshboxArgs::try_parse_from([
            "virshbox",
            "clone",
            "base-ubuntu",
            "sbx-1",
            "--cpu",
            "4",
            "--start",
            "--config",
            "/etc/virshbox.yaml",
            "-v",
        ])?;

        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("/etc/virshbox.yaml")));
        match args.subcommand {
            Some(VirshboxSubcommand::Clone {
                source,
                name,
                agent,
                cpu,
                memory,
                ttl,
                start,
            }) => {
                assert_eq!(source, "base-ubuntu");
                assert_eq!(name, "sbx-1");
                assert_eq!(agent, "operator");
                assert_eq!(cpu, 4);
                assert_eq!(memory, 0);
                assert_eq!(ttl, None);
                assert!(start);
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_list_takes_optional_host() -> anyhow::Result<()> {
        let args = VirshboxArgs::try_parse_from(["virshbox", "list", "--host", "h2"])?;
        assert!(matches!(
            args.subcommand,
            Some(VirshboxSubcommand::List { host: Some(h) }) if h == "h2"
        ));
        Ok(())
    }
}
