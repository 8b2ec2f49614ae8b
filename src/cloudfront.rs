//! CloudFront distribution configs: read with their ETag, override a few
//! fields, and write back conditioned on that ETag.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::aws::AwsCli;
use crate::error::MigrateError;

pub const RAILWAY_ORIGIN_ID: &str = "RailwayOrigin";

#[derive(Debug, Clone)]
pub struct VersionedConfig {
    pub etag: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistributionStatus {
    pub status: String,
    pub enabled: bool,
    pub domain_name: String,
}

#[async_trait]
pub trait DistributionApi: Send + Sync {
    async fn get_config(&self, id: &str) -> Result<VersionedConfig>;

    /// Fails with [`MigrateError::Conflict`] when `etag` is stale.
    async fn update_config(&self, id: &str, config: &Value, etag: &str) -> Result<()>;

    async fn get_status(&self, id: &str) -> Result<DistributionStatus>;

    /// Returns the new distribution's CloudFront domain name.
    async fn create(&self, config: &Value) -> Result<String>;
}

pub struct AwsCloudFront {
    aws: AwsCli,
}

impl AwsCloudFront {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }
}

#[async_trait]
impl DistributionApi for AwsCloudFront {
    async fn get_config(&self, id: &str) -> Result<VersionedConfig> {
        let mut output = self
            .aws
            .run(&["cloudfront", "get-distribution-config", "--id", id])
            .await?;

        let etag = output["ETag"]
            .as_str()
            .context("get-distribution-config returned no ETag")?
            .to_string();
        let config = output
            .get_mut("DistributionConfig")
            .map(Value::take)
            .context("get-distribution-config returned no DistributionConfig")?;

        Ok(VersionedConfig { etag, config })
    }

    async fn update_config(&self, id: &str, config: &Value, etag: &str) -> Result<()> {
        let body = config.to_string();
        let result = self
            .aws
            .run(&[
                "cloudfront",
                "update-distribution",
                "--id",
                id,
                "--distribution-config",
                &body,
                "--if-match",
                etag,
            ])
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_precondition_failure(&e) => {
                Err(MigrateError::Conflict { id: id.to_string() }.into())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_status(&self, id: &str) -> Result<DistributionStatus> {
        let output = self
            .aws
            .run(&["cloudfront", "get-distribution", "--id", id])
            .await?;
        parse_status(&output)
    }

    async fn create(&self, config: &Value) -> Result<String> {
        let body = config.to_string();
        let output = self
            .aws
            .run(&["cloudfront", "create-distribution", "--distribution-config", &body])
            .await?;

        output["Distribution"]["DomainName"]
            .as_str()
            .map(str::to_string)
            .context("create-distribution returned no DomainName")
    }
}

fn is_precondition_failure(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<MigrateError>() {
        Some(MigrateError::Command { stderr, .. }) => {
            stderr.contains("PreconditionFailed") || stderr.contains("InvalidIfMatchVersion")
        }
        _ => false,
    }
}

fn parse_status(output: &Value) -> Result<DistributionStatus> {
    let distribution = &output["Distribution"];
    Ok(DistributionStatus {
        status: distribution["Status"]
            .as_str()
            .context("get-distribution returned no Status")?
            .to_string(),
        enabled: distribution["DistributionConfig"]["Enabled"]
            .as_bool()
            .unwrap_or(false),
        domain_name: distribution["DomainName"].as_str().unwrap_or_default().to_string(),
    })
}

/// Fields the migration changes on an existing distribution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Domain of the first origin.
    pub origin_domain: Option<String>,
    /// Path prefix of the first origin; empty string clears it.
    pub origin_path: Option<String>,
    /// Forward everything to the origin uncached (dynamic Railway app).
    pub pass_through_cache: bool,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.origin_domain.is_none() && self.origin_path.is_none() && !self.pass_through_cache
    }

    pub fn apply(&self, config: &mut Value) -> Result<()> {
        if self.origin_domain.is_some() || self.origin_path.is_some() {
            let origin = config
                .pointer_mut("/Origins/Items/0")
                .context("Distribution config has no origins")?;
            if let Some(domain) = &self.origin_domain {
                origin["DomainName"] = json!(domain);
            }
            if let Some(path) = &self.origin_path {
                origin["OriginPath"] = json!(path);
            }
        }

        if self.pass_through_cache {
            let origin_id = config
                .pointer("/Origins/Items/0/Id")
                .and_then(Value::as_str)
                .unwrap_or(RAILWAY_ORIGIN_ID)
                .to_string();
            let behavior = config
                .get_mut("DefaultCacheBehavior")
                .and_then(Value::as_object_mut)
                .context("Distribution config has no DefaultCacheBehavior")?;
            if let Value::Object(fields) = pass_through_behavior(&origin_id) {
                behavior.extend(fields);
            }
        }

        Ok(())
    }
}

/// All methods allowed, nothing cached, every header, cookie and query string
/// forwarded.
fn pass_through_behavior(origin_id: &str) -> Value {
    json!({
        "TargetOriginId": origin_id,
        "ViewerProtocolPolicy": "redirect-to-https",
        "AllowedMethods": {
            "Quantity": 7,
            "Items": ["GET", "HEAD", "OPTIONS", "PUT", "POST", "PATCH", "DELETE"],
            "CachedMethods": { "Quantity": 2, "Items": ["GET", "HEAD"] }
        },
        "MinTTL": 0,
        "DefaultTTL": 0,
        "MaxTTL": 31536000,
        "Compress": true,
        "ForwardedValues": {
            "QueryString": true,
            "Cookies": { "Forward": "all" },
            "Headers": { "Quantity": 1, "Items": ["*"] }
        }
    })
}

/// Read, override and conditionally write one distribution config. On an
/// ETag conflict the config is re-read and the overrides re-applied, up to
/// `conflict_retries` times.
pub async fn mutate_distribution(
    api: &dyn DistributionApi,
    id: &str,
    overrides: &ConfigOverrides,
    conflict_retries: u32,
) -> Result<()> {
    if overrides.is_empty() {
        debug!("Nothing to change on distribution {}", id);
        return Ok(());
    }

    let mut attempt = 0;
    loop {
        let VersionedConfig { etag, mut config } = api
            .get_config(id)
            .await
            .with_context(|| format!("Failed to read config of distribution {}", id))?;

        overrides.apply(&mut config)?;

        match api.update_config(id, &config, &etag).await {
            Ok(()) => {
                info!("Updated distribution {} (ETag {})", id, etag);
                return Ok(());
            }
            Err(e) if MigrateError::is_conflict(&e) && attempt < conflict_retries => {
                attempt += 1;
                warn!("{}; re-reading (retry {} of {})", e, attempt, conflict_retries);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Config for a new distribution serving `alias` from a Railway origin.
pub fn new_distribution_config(alias: &str, origin: &str, certificate_arn: &str) -> Value {
    json!({
        "CallerReference": format!("migration-{}", alias),
        "Origins": {
            "Quantity": 1,
            "Items": [{
                "Id": RAILWAY_ORIGIN_ID,
                "DomainName": origin,
                "CustomOriginConfig": {
                    "HTTPPort": 80,
                    "HTTPSPort": 443,
                    "OriginProtocolPolicy": "https-only",
                    "OriginSslProtocols": { "Quantity": 1, "Items": ["TLSv1.2"] }
                }
            }]
        },
        "DefaultCacheBehavior": pass_through_behavior(RAILWAY_ORIGIN_ID),
        "Comment": format!("Distribution for {}", alias),
        "Enabled": true,
        "Aliases": { "Quantity": 1, "Items": [alias] },
        "ViewerCertificate": {
            "ACMCertificateArn": certificate_arn,
            "SSLSupportMethod": "sni-only",
            "MinimumProtocolVersion": "TLSv1.2_2021"
        }
    })
}
