use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use crate::acm::Acm;
use crate::aws::AwsCli;
use crate::cloudfront::{
    mutate_distribution, new_distribution_config, AwsCloudFront, ConfigOverrides, DistributionApi,
};
use crate::config::{Config, DistributionConfig};
use crate::credentials::CredentialChain;
use crate::dns::{nameservers_match, SystemResolver};
use crate::error::MigrateError;
use crate::poller::{PollOutcome, PollReport, Poller, TerminalStates};
use crate::provider::{CloudflareClient, CloudflareZone};
use crate::reconcile::{
    apply_upserts, plan_record_sets, ApplySummary, Converter, RecordStore, SkipReason,
};
use crate::record::{normalize_name, qualify, DnsRecord, RecordType};
use crate::route53::{ChangeAction, Route53};

const MIGRATION_READY: &str = "READY";
const MIGRATION_CERT_FAILED: &str = "CERTIFICATE_FAILED";

pub struct App {
    config: Config,
    token: Option<String>,
}

impl App {
    pub fn new(config: Config, token: Option<String>) -> Self {
        Self { config, token }
    }

    fn aws(&self) -> AwsCli {
        AwsCli::new(&self.config.aws)
    }

    fn poller(&self) -> Poller {
        Poller::new(self.config.polling.interval(), self.config.polling.timeout())
    }

    async fn cloudflare(&self) -> Result<CloudflareClient> {
        let token = CredentialChain::from_config(&self.config.credentials, self.token.clone())
            .resolve()
            .await?;
        CloudflareClient::new(token)
    }

    fn distributions(&self) -> Result<&[DistributionConfig]> {
        if self.config.distributions.is_empty() {
            bail!("No [[distributions]] configured");
        }
        Ok(&self.config.distributions)
    }

    /// Mirror the Cloudflare zone into the Route 53 hosted zone.
    pub async fn sync(&self, dry_run: bool, yes: bool, prune: bool) -> Result<()> {
        let zone_name = &self.config.zone.name;
        let hosted_zone_id = self.config.route53_zone_id()?;

        let cf = self.cloudflare().await?;
        info!("Fetching DNS records from Cloudflare for {}...", zone_name);
        let zone = cf.zone(zone_name).await?;
        let records = cf.list_records(&zone.id, None).await?;
        info!("Found {} records in Cloudflare", records.len());

        println!("\nCloudflare records:");
        print_records(&records);

        let resolver = SystemResolver::new();
        let converter = Converter {
            zone: zone_name,
            hosting_suffix: &self.config.zone.hosting_suffix,
            resolver: &resolver,
        };
        let conversion = converter.convert_all(&records).await;

        let manual: Vec<&DnsRecord> = conversion
            .skipped
            .iter()
            .filter(|(_, reason)| !matches!(reason, SkipReason::ApexAuthority))
            .map(|(record, _)| record)
            .collect();
        if !manual.is_empty() {
            println!("\nSkipped records that need manual handling:");
            for record in &manual {
                println!("  {:<6} {:<40} {}", record.record_type, record.name, record.content);
            }
        }

        let route53 = Route53::new(self.aws());
        let existing = route53.list_record_sets(hosted_zone_id).await?;
        let changes = plan_record_sets(
            &conversion.record_sets,
            &existing,
            zone_name,
            prune,
            &conversion.retained_names(),
        );

        if changes.is_empty() {
            info!("Route 53 zone {} is already in sync", hosted_zone_id);
            return Ok(());
        }

        println!("\nChanges for Route 53 zone {}:", hosted_zone_id);
        for change in &changes {
            let set = &change.record_set;
            let action = match change.action {
                ChangeAction::Upsert => "UPSERT",
                ChangeAction::Delete => "DELETE",
            };
            println!("  {:<6} {:<6} {:<40} {:?}", action, set.record_type, set.name, set.values());
        }

        if dry_run {
            info!("Dry run: {} change(s) not submitted", changes.len());
            return Ok(());
        }
        if !yes && !confirm("Do you want to proceed with the DNS sync?")? {
            info!("Sync cancelled");
            return Ok(());
        }

        let batches = route53.submit(hosted_zone_id, &changes).await?;
        info!("Synced {} change(s) to Route 53 in {} batch(es)", changes.len(), batches);
        Ok(())
    }

    /// Point every distribution alias at its CloudFront domain through a
    /// proxied CNAME.
    pub async fn point_cloudfront(&self) -> Result<()> {
        let desired: Vec<DnsRecord> = self
            .distributions()?
            .iter()
            .map(|d| DnsRecord::cname(&d.alias, &d.cloudfront_domain, true))
            .collect();

        let cf = self.cloudflare().await?;
        let zone = CloudflareZone {
            zone: cf.zone(&self.config.zone.name).await?,
            client: &cf,
        };
        let summary = apply_upserts(&zone, &desired).await?;
        report_summary(&summary)?;

        if summary.changed() > 0 {
            info!("DNS changes may take a few minutes to propagate; distributions 15-30 minutes to deploy");
        }
        Ok(())
    }

    /// Drop Route 53 NS records from Cloudflare, add the ACM validation
    /// record and wait for the certificate.
    pub async fn cleanup(&self) -> Result<()> {
        let cf = self.cloudflare().await?;
        let zone = cf.zone(&self.config.zone.name).await?;
        let store = CloudflareZone { client: &cf, zone: zone.clone() };
        let mut failures = 0;

        info!("Looking for Route 53 NS records to remove...");
        let route53_ns: Vec<String> = self
            .config
            .route53_nameservers
            .iter()
            .map(|n| normalize_name(n))
            .collect();
        for record in cf.list_records(&zone.id, Some(&RecordType::Ns)).await? {
            if !route53_ns.contains(&normalize_name(&record.content)) {
                continue;
            }
            let Some(id) = record.id.as_deref() else { continue };
            match store.delete(id).await {
                Ok(()) => info!("Deleted NS record {} -> {}", record.name, record.content),
                Err(e) => {
                    error!("Failed to delete NS record {}: {:#}", record.content, e);
                    failures += 1;
                }
            }
        }

        let certificate = &self.config.certificate;
        if let (Some(name), Some(value)) = (&certificate.validation_name, &certificate.validation_value) {
            info!("Adding ACM validation record...");
            let record = DnsRecord::cname(&qualify(name, &zone.name), value, false).with_ttl(300);
            let summary = apply_upserts(&store, &[record]).await?;
            failures += summary.failed;
        } else {
            warn!("No certificate.validation_name/validation_value configured; skipping validation record");
        }

        if failures > 0 {
            bail!("{} cleanup step(s) failed", failures);
        }
        self.wait_certificate().await
    }

    pub async fn set_nameservers(&self) -> Result<()> {
        let cf = self.cloudflare().await?;
        let zone = cf.zone(&self.config.zone.name).await?;
        cf.set_vanity_nameservers(&zone.id, &self.config.route53_nameservers)
            .await?;

        println!("Nameservers for {} set to:", zone.name);
        for ns in &self.config.route53_nameservers {
            println!("  - {}", ns);
        }
        Ok(())
    }

    /// Point subdomains at the apex and redirect them with page rules.
    pub async fn redirects(&self) -> Result<()> {
        if self.config.redirects.is_empty() {
            bail!("No [[redirects]] configured");
        }

        let cf = self.cloudflare().await?;
        let zone = cf.zone(&self.config.zone.name).await?;
        let desired: Vec<DnsRecord> = self
            .config
            .redirects
            .iter()
            .map(|r| DnsRecord::cname(&qualify(&r.subdomain, &zone.name), &zone.name, true))
            .collect();

        let store = CloudflareZone { client: &cf, zone: zone.clone() };
        let summary = apply_upserts(&store, &desired).await?;
        let mut failures = summary.failed;

        for redirect in &self.config.redirects {
            let pattern = format!("{}/*", qualify(&redirect.subdomain, &zone.name));
            let destination = format!("https://{}/$1", redirect.target.trim_end_matches('/'));
            info!("Creating page rule {} -> {}", pattern, destination);
            match cf.create_forwarding_rule(&zone.id, &pattern, &destination).await {
                Ok(id) => info!("Created page rule {}", id),
                Err(e) => {
                    error!("Failed to create page rule for {}: {:#}", pattern, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            bail!("{} redirect step(s) failed", failures);
        }
        Ok(())
    }

    pub async fn add_cname(&self, zone: Option<&str>, name: &str, target: &str, proxied: bool) -> Result<()> {
        let zone_name = zone.unwrap_or(self.config.zone.name.as_str());
        let cf = self.cloudflare().await?;
        let zone = cf.zone(zone_name).await?;
        let record = DnsRecord::cname(&qualify(name, &zone.name), target, proxied);
        let store = CloudflareZone { client: &cf, zone };
        let summary = apply_upserts(&store, &[record]).await?;
        report_summary(&summary)
    }

    /// Repoint every distribution at its origin, then wait for rollout.
    pub async fn update_origins(&self, wait: bool) -> Result<()> {
        let api = AwsCloudFront::new(self.aws());
        let mut failures = 0;

        for dist in self.distributions()? {
            let overrides = ConfigOverrides {
                origin_domain: Some(dist.origin.clone()),
                origin_path: Some(dist.kind.origin_path().to_string()),
                pass_through_cache: true,
            };
            info!("Updating distribution {} ({})...", dist.id, dist.alias);
            if let Err(e) =
                mutate_distribution(&api, &dist.id, &overrides, self.config.aws.conflict_retries).await
            {
                error!("Failed to update distribution {}: {:#}", dist.id, e);
                failures += 1;
            }
        }

        if failures > 0 {
            bail!("{} distribution update(s) failed", failures);
        }
        if wait {
            self.wait_deployment(true).await?;
        }
        Ok(())
    }

    pub async fn create_distributions(&self, yes: bool) -> Result<()> {
        let arn = self.config.certificate_arn()?;
        if !yes && !confirm(&format!("Create distributions using certificate {}?", arn))? {
            info!("Nothing created");
            return Ok(());
        }

        let api = AwsCloudFront::new(self.aws());
        let mut failures = 0;
        for dist in self.distributions()? {
            let config = new_distribution_config(&dist.alias, &dist.origin, arn);
            match api.create(&config).await {
                Ok(domain) => println!("Created distribution for {}: {}", dist.alias, domain),
                Err(e) => {
                    error!("Error creating distribution for {}: {:#}", dist.alias, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            bail!("{} distribution(s) could not be created", failures);
        }
        Ok(())
    }

    pub async fn wait_certificate(&self) -> Result<()> {
        let arn = self.config.certificate_arn()?;
        let acm = Acm::new(self.aws());
        info!("Waiting for ACM to validate the certificate...");

        let acm = &acm;
        let report = self
            .poller()
            .poll(
                "certificate",
                &TerminalStates::certificate(),
                move || acm.certificate_status(arn),
                interrupted(),
            )
            .await;
        finish_poll("certificate", report)
    }

    /// Wait until every distribution is `Deployed`, then check the sites answer.
    pub async fn wait_deployment(&self, probe: bool) -> Result<()> {
        let distributions = self.distributions()?;
        let api = AwsCloudFront::new(self.aws());

        let api = &api;
        let report = self
            .poller()
            .poll(
                "distributions",
                &TerminalStates::distribution(),
                move || deployment_status(api, distributions),
                interrupted(),
            )
            .await;
        finish_poll("distributions", report)?;

        if probe {
            self.probe_sites(distributions).await?;
        }
        Ok(())
    }

    async fn probe_sites(&self, distributions: &[DistributionConfig]) -> Result<()> {
        let prober = crate::probe::Prober::new()?;
        let mut failures = 0;

        for dist in distributions {
            for host in [&dist.alias, &dist.cloudfront_domain] {
                let result = prober.probe(host).await;
                if result.is_ok() {
                    info!("{} is working ({:?})", host, result);
                } else {
                    warn!("{} failed: {:?}", host, result);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            bail!("{} host(s) failed the HTTPS check; DNS may still be propagating", failures);
        }
        info!("All domains are working");
        Ok(())
    }

    /// Wait for the Route 53 nameservers to be live and the certificate issued.
    pub async fn monitor_migration(&self) -> Result<()> {
        let arn = self.config.certificate_arn()?;
        let expected = &self.config.route53_nameservers;
        let zone = &self.config.zone.name;
        let acm = Acm::new(self.aws());
        let resolver = SystemResolver::new();

        info!("Expected nameservers: {}", expected.join(", "));

        let (acm, resolver) = (&acm, &resolver);
        let report = self
            .poller()
            .poll(
                "migration",
                &TerminalStates::new(&[MIGRATION_READY], &[MIGRATION_CERT_FAILED]),
                move || migration_status(resolver, acm, zone, expected, arn),
                interrupted(),
            )
            .await;
        finish_poll("migration", report)?;

        info!("Migration prerequisites complete; ready to create CloudFront distributions");
        Ok(())
    }
}

async fn deployment_status(api: &dyn DistributionApi, distributions: &[DistributionConfig]) -> Result<String> {
    let mut deployed = 0;
    for dist in distributions {
        let status = api
            .get_status(&dist.id)
            .await
            .with_context(|| format!("Failed to get status for {}", dist.id))?;
        info!(
            "  {} ({} at {}): {} enabled={}",
            dist.alias, dist.id, status.domain_name, status.status, status.enabled
        );
        if status.status == "Deployed" {
            deployed += 1;
        }
    }

    Ok(if deployed == distributions.len() {
        "Deployed".to_string()
    } else {
        format!("InProgress ({}/{} deployed)", deployed, distributions.len())
    })
}

async fn migration_status(
    resolver: &SystemResolver,
    acm: &Acm,
    zone: &str,
    expected: &[String],
    arn: &str,
) -> Result<String> {
    let current = resolver.nameservers(zone).await?;
    let ns_match = nameservers_match(&current, expected);
    info!(
        "  nameservers: {} ({})",
        current.iter().cloned().collect::<Vec<_>>().join(", "),
        if ns_match { "MATCH" } else { "NO MATCH" }
    );

    let cert = acm.certificate_status(arn).await?;
    info!("  certificate: {}", cert);

    Ok(if TerminalStates::certificate().is_failure(&cert) {
        MIGRATION_CERT_FAILED.to_string()
    } else if ns_match && cert == "ISSUED" {
        MIGRATION_READY.to_string()
    } else {
        "WAITING".to_string()
    })
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn finish_poll(label: &str, report: PollReport) -> Result<()> {
    match report.outcome {
        PollOutcome::Succeeded(status) => {
            info!("{} reached {} after {} check(s)", label, status, report.observations);
            Ok(())
        }
        PollOutcome::Failed(status) => bail!("{} ended in failure state {}", label, status),
        PollOutcome::TimedOut => bail!(
            "{} did not reach a terminal state after {} check(s)",
            label,
            report.observations
        ),
        PollOutcome::Cancelled => Err(MigrateError::Cancelled.into()),
    }
}

fn report_summary(summary: &ApplySummary) -> Result<()> {
    info!(
        "{} created, {} updated, {} unchanged, {} failed",
        summary.created, summary.updated, summary.unchanged, summary.failed
    );
    if summary.failed > 0 {
        bail!("{} record(s) could not be applied", summary.failed);
    }
    Ok(())
}

fn print_records(records: &[DnsRecord]) {
    println!("{:<6} {:<40} {:<40}", "TYPE", "NAME", "CONTENT");
    println!("{}", "-".repeat(88));
    for record in records {
        println!(
            "{:<6} {:<40} {:<40}",
            record.record_type,
            record.name,
            truncate(&record.content, 40)
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("\n{} (yes/no): ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read answer")?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}
