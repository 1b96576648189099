//! CLI tool for managing chost domains and the hosts file
//!
//! Usage:
//!   chost-domain add <hostname> <port> [--ssl] [--disabled]
//!   chost-domain remove <hostname>
//!   chost-domain enable|disable <hostname>
//!   chost-domain ssl <hostname> <on|off>
//!   chost-domain list [--json]
//!   chost-domain ports <http> <https>
//!   chost-domain hosts sync|clear|restore|show

use anyhow::Result;
use chost::{DomainRegistry, HostsConfig, HostsReconciler, SqliteRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// CLI tool for managing chost domains
#[derive(Parser, Debug)]
#[command(name = "chost-domain")]
#[command(author = "CHost Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage chost domain mappings")]
struct Args {
    /// Domain registry database
    #[arg(long, env = "CHOST_DB_PATH", default_value = "./data/chost.db")]
    db_path: PathBuf,

    /// Hosts file to keep in sync
    #[arg(long, env = "CHOST_HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// Only change the registry, leave the hosts file alone
    #[arg(long)]
    no_hosts: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Map a hostname to a local port
    Add {
        /// Hostname (e.g., app.local)
        hostname: String,

        /// Local port the application listens on
        port: u16,

        /// Serve the hostname over HTTPS as well
        #[arg(long)]
        ssl: bool,

        /// Register without routing traffic yet
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a hostname
    Remove { hostname: String },

    /// Start routing traffic for a hostname
    Enable { hostname: String },

    /// Stop routing traffic for a hostname
    Disable { hostname: String },

    /// Turn HTTPS on or off for a hostname
    Ssl { hostname: String, state: Toggle },

    /// Change the target port of a hostname
    Port { hostname: String, port: u16 },

    /// List all mappings
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Set the proxy listener ports
    Ports { http_port: u16, https_port: u16 },

    /// Hosts file maintenance
    Hosts {
        #[command(subcommand)]
        action: HostsAction,
    },
}

#[derive(Subcommand, Debug)]
enum HostsAction {
    /// Rewrite the managed block from the registry
    Sync {
        /// Include hostnames whose proxying is disabled
        #[arg(long)]
        all: bool,
    },
    /// Remove the managed block
    Clear,
    /// Restore the hosts file from the last backup
    Restore,
    /// Print the hostnames currently in the managed block
    Show,
}

fn main() -> Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_target(false)
        .compact()
        .init();

    let registry = SqliteRegistry::open(&args.db_path)?;
    let reconciler = HostsReconciler::new(
        args.hosts_file
            .clone()
            .map(HostsConfig::new)
            .unwrap_or_default(),
    );
    let sync_hosts = !args.no_hosts;

    match args.command {
        Commands::Add {
            hostname,
            port,
            ssl,
            disabled,
        } => {
            let entry = registry.add_domain(&hostname, port, ssl, !disabled)?;
            println!("Added mapping:");
            print_entry(&entry);

            if sync_hosts && entry.proxy_enabled {
                report_hosts(reconciler.add_hostname(&entry.hostname)?, &reconciler);
            }
        }

        Commands::Remove { hostname } => {
            let entry = registry.remove_domain(&hostname)?;
            println!("Removed {}", entry.hostname);

            if sync_hosts {
                report_hosts(reconciler.remove_hostname(&entry.hostname)?, &reconciler);
            }
        }

        Commands::Enable { hostname } => {
            registry.set_proxy_enabled(&hostname, true)?;
            println!("Enabled {}", hostname);

            if sync_hosts {
                report_hosts(reconciler.add_hostname(&hostname)?, &reconciler);
            }
        }

        Commands::Disable { hostname } => {
            registry.set_proxy_enabled(&hostname, false)?;
            println!("Disabled {}", hostname);

            if sync_hosts {
                report_hosts(reconciler.remove_hostname(&hostname)?, &reconciler);
            }
        }

        Commands::Ssl { hostname, state } => {
            let enabled = matches!(state, Toggle::On);
            registry.set_ssl_enabled(&hostname, enabled)?;
            println!(
                "HTTPS {} for {}",
                if enabled { "enabled" } else { "disabled" },
                hostname
            );
        }

        Commands::Port { hostname, port } => {
            registry.set_target_port(&hostname, port)?;
            println!("{} now routes to port {}", hostname, port);
        }

        Commands::List { json } => {
            let entries = registry.list_all()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }

            if entries.is_empty() {
                println!("No mappings found");
                return Ok(());
            }

            println!("{:<40} {:<8} {:<6} {:<8} {:<25}", "HOSTNAME", "PORT", "SSL", "PROXY", "CREATED");
            println!("{}", "-".repeat(90));

            for entry in &entries {
                println!(
                    "{:<40} {:<8} {:<6} {:<8} {:<25}",
                    entry.hostname,
                    entry.target_port,
                    if entry.ssl_enabled { "yes" } else { "no" },
                    if entry.proxy_enabled { "on" } else { "off" },
                    entry.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }

            println!("\nTotal: {} mapping(s)", entries.len());
        }

        Commands::Ports {
            http_port,
            https_port,
        } => {
            let settings = registry.set_ports(http_port, https_port)?;
            println!(
                "Proxy ports set to http {} / https {} (restart chost to apply)",
                settings.http_port, settings.https_port
            );
        }

        Commands::Hosts { action } => match action {
            HostsAction::Sync { all } => {
                report_hosts(reconciler.sync_registry(&registry, all)?, &reconciler);
            }
            HostsAction::Clear => {
                report_hosts(reconciler.clear_all()?, &reconciler);
            }
            HostsAction::Restore => {
                if reconciler.restore_from_backup()? {
                    println!("Restored {} from backup", reconciler.path().display());
                } else {
                    eprintln!("No backup found");
                    std::process::exit(1);
                }
            }
            HostsAction::Show => {
                for hostname in reconciler.managed_hostnames()? {
                    println!("{}", hostname);
                }
            }
        },
    }

    Ok(())
}

fn report_hosts(written: bool, reconciler: &HostsReconciler) {
    if written {
        println!("Updated {}", reconciler.path().display());
    } else {
        println!("{} already up to date", reconciler.path().display());
    }
}

fn print_entry(entry: &chost::DomainEntry) {
    println!("  Hostname:   {}", entry.hostname);
    println!("  Port:       {}", entry.target_port);
    println!("  SSL:        {}", entry.ssl_enabled);
    println!("  Proxy:      {}", entry.proxy_enabled);
    println!("  Created:    {}", entry.created_at.to_rfc3339());
}
