mod acm;
mod aws;
mod cloudfront;
mod commands;
mod config;
mod credentials;
mod dns;
mod error;
mod poller;
mod probe;
mod provider;
mod reconcile;
mod record;
mod route53;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use crate::commands::App;
use crate::error::MigrateError;

#[derive(Parser, Debug)]
#[command(name = "dns-migrate")]
#[command(about = "Move a domain between Cloudflare, Route 53 and CloudFront")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "migrate.toml")]
    config: String,

    /// Cloudflare API token (skips the Kubernetes secret and environment lookup)
    #[arg(long)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy the Cloudflare zone into the Route 53 hosted zone
    Sync {
        /// Show the planned changes without submitting them
        #[arg(long)]
        dry_run: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Delete Route 53 record sets that no longer exist in Cloudflare
        #[arg(long)]
        prune: bool,
    },

    /// Point each distribution alias at its CloudFront domain in Cloudflare
    PointCloudfront,

    /// Remove Route 53 NS records from Cloudflare and validate the certificate
    Cleanup,

    /// Set the Cloudflare vanity nameservers to the Route 53 set
    Nameservers,

    /// Point subdomains at the apex and redirect them with page rules
    Redirects,

    /// Create or update a single proxied CNAME
    AddCname {
        /// Record name (e.g. docs)
        name: String,

        /// Target host name
        target: String,

        /// Zone name (defaults to the configured zone)
        #[arg(long)]
        zone: Option<String>,

        /// Disable the Cloudflare proxy
        #[arg(long)]
        no_proxy: bool,
    },

    /// Repoint distributions at their origins and wait for deployment
    UpdateOrigins {
        /// Return without waiting for the rollout
        #[arg(long)]
        no_wait: bool,
    },

    /// Create a CloudFront distribution for each configured alias
    CreateDistributions {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Wait for the ACM certificate to be issued
    WaitCertificate,

    /// Wait for all distributions to deploy, then check the sites answer
    WaitDeployment {
        /// Skip the HTTPS checks after deployment
        #[arg(long)]
        no_probe: bool,
    },

    /// Wait for the Route 53 nameservers to be live and the certificate issued
    MonitorMigration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (before logger init)
    let config = config::Config::load(&args.config)?;

    // RUST_LOG takes precedence over the config file
    let level = if args.verbose { "debug" } else { config.log_level.as_str() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    info!("Loaded configuration from: {} (zone {})", args.config, config.zone.name);

    let app = App::new(config, args.token);
    let result = match args.command {
        Command::Sync { dry_run, yes, prune } => app.sync(dry_run, yes, prune).await,
        Command::PointCloudfront => app.point_cloudfront().await,
        Command::Cleanup => app.cleanup().await,
        Command::Nameservers => app.set_nameservers().await,
        Command::Redirects => app.redirects().await,
        Command::AddCname { name, target, zone, no_proxy } => {
            app.add_cname(zone.as_deref(), &name, &target, !no_proxy).await
        }
        Command::UpdateOrigins { no_wait } => app.update_origins(!no_wait).await,
        Command::CreateDistributions { yes } => app.create_distributions(yes).await,
        Command::WaitCertificate => app.wait_certificate().await,
        Command::WaitDeployment { no_probe } => app.wait_deployment(!no_probe).await,
        Command::MonitorMigration => app.monitor_migration().await,
    };

    if let Err(e) = result {
        let code = exit_code(&e);
        if code == EXIT_INTERRUPTED {
            info!("Monitoring stopped");
        } else {
            error!("{:#}", e);
        }
        std::process::exit(code);
    }
    Ok(())
}

const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

fn exit_code(err: &anyhow::Error) -> i32 {
    if MigrateError::is_cancelled(err) {
        EXIT_INTERRUPTED
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_sync_flags() {
        let args = Args::try_parse_from(["dns-migrate", "-c", "prod.toml", "sync", "--dry-run", "--prune"]).unwrap();
        assert_eq!(args.config, "prod.toml");
        match args.command {
            Command::Sync { dry_run, yes, prune } => {
                assert!(dry_run);
                assert!(!yes);
                assert!(prune);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_add_cname() {
        let args = Args::try_parse_from([
            "dns-migrate",
            "--token",
            "t",
            "add-cname",
            "docs",
            "548iv9i4.up.railway.app",
            "--no-proxy",
        ])
        .unwrap();
        assert_eq!(args.token.as_deref(), Some("t"));
        match args.command {
            Command::AddCname { name, target, zone, no_proxy } => {
                assert_eq!(name, "docs");
                assert_eq!(target, "548iv9i4.up.railway.app");
                assert!(zone.is_none());
                assert!(no_proxy);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn exit_code_distinguishes_interruption() {
        assert_eq!(exit_code(&MigrateError::Cancelled.into()), EXIT_INTERRUPTED);
        let wrapped = anyhow::Error::from(MigrateError::Cancelled).context("certificate wait");
        assert_eq!(exit_code(&wrapped), EXIT_INTERRUPTED);
        assert_eq!(exit_code(&anyhow::anyhow!("2 record(s) could not be applied")), EXIT_FAILURE);
    }

    #[test]
    fn missing_subcommand_is_rejected() {
        assert!(Args::try_parse_from(["dns-migrate"]).is_err());
    }
}
