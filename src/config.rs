use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub zone: ZoneConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub certificate: CertificateConfig,
    #[serde(default = "default_route53_nameservers")]
    pub route53_nameservers: Vec<String>,
    #[serde(default)]
    pub distributions: Vec<DistributionConfig>,
    #[serde(default)]
    pub redirects: Vec<RedirectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    #[serde(default = "default_zone_name")]
    pub name: String,
    #[serde(default)]
    pub route53_zone_id: Option<String>,
    /// CNAME targets ending in this suffix are flattened to A records.
    #[serde(default = "default_hosting_suffix")]
    pub hosting_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default = "default_secret_key")]
    pub key: String,
    #[serde(default = "default_env_var")]
    pub env_var: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// 0 disables the deadline.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_aws_program")]
    pub program: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Re-fetch and resubmit a distribution config this many times on ETag conflict.
    #[serde(default)]
    pub conflict_retries: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertificateConfig {
    #[serde(default)]
    pub arn: Option<String>,
    #[serde(default)]
    pub validation_name: Option<String>,
    #[serde(default)]
    pub validation_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    Api,
    Docs,
    Main,
}

impl DistributionKind {
    /// Path prefix on the shared origin that serves this kind of site.
    pub fn origin_path(self) -> &'static str {
        match self {
            DistributionKind::Api => "/api",
            DistributionKind::Docs => "/docs",
            DistributionKind::Main => "",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionConfig {
    pub id: String,
    pub alias: String,
    pub cloudfront_domain: String,
    pub origin: String,
    #[serde(default = "default_kind")]
    pub kind: DistributionKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectConfig {
    pub subdomain: String,
    /// Host and path prefix without scheme, e.g. `example.com/api`.
    pub target: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_zone_name() -> String {
    "rinawarptech.com".to_string()
}

fn default_hosting_suffix() -> String {
    "railway.app".to_string()
}

fn default_namespace() -> String {
    "rinawarp-staging".to_string()
}

fn default_secret() -> String {
    "cloudflare-credentials".to_string()
}

fn default_secret_key() -> String {
    "api-token".to_string()
}

fn default_env_var() -> String {
    "CLOUDFLARE_API_TOKEN".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_aws_program() -> String {
    "aws".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_kind() -> DistributionKind {
    DistributionKind::Main
}

fn default_route53_nameservers() -> Vec<String> {
    [
        "ns-1525.awsdns-62.org",
        "ns-1686.awsdns-18.co.uk",
        "ns-769.awsdns-32.net",
        "ns-455.awsdns-56.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            name: default_zone_name(),
            route53_zone_id: None,
            hosting_suffix: default_hosting_suffix(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            secret: default_secret(),
            key: default_secret_key(),
            env_var: default_env_var(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            program: default_aws_program(),
            region: default_region(),
            conflict_retries: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            zone: ZoneConfig::default(),
            credentials: CredentialsConfig::default(),
            polling: PollingConfig::default(),
            aws: AwsConfig::default(),
            certificate: CertificateConfig::default(),
            route53_nameservers: default_route53_nameservers(),
            distributions: Vec::new(),
            redirects: Vec::new(),
        }
    }
}

impl Config {
    /// Load the config file, or fall back to defaults when it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.polling.interval_secs == 0 {
            bail!("polling.interval_secs must be at least 1");
        }
        Ok(config)
    }

    pub fn route53_zone_id(&self) -> Result<&str> {
        self.zone
            .route53_zone_id
            .as_deref()
            .context("zone.route53_zone_id is not set in the config file")
    }

    pub fn certificate_arn(&self) -> Result<&str> {
        self.certificate
            .arn
            .as_deref()
            .context("certificate.arn is not set in the config file")
    }
}
