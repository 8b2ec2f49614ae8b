//! API token lookup with ordered fallback sources.

use std::env;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::config::CredentialsConfig;
use crate::error::MigrateError;

#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn describe(&self) -> String;

    /// `Ok(None)` means the source is reachable but holds no token.
    async fn fetch(&self) -> Result<Option<String>>;
}

/// Token stored base64-encoded in a Kubernetes secret, read through `kubectl`.
pub struct KubernetesSecret {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

#[async_trait]
impl CredentialSource for KubernetesSecret {
    fn describe(&self) -> String {
        format!("kubernetes secret {}/{}", self.namespace, self.name)
    }

    async fn fetch(&self) -> Result<Option<String>> {
        let jsonpath = format!("jsonpath={{.data.{}}}", self.key.replace('.', "\\."));
        let output = Command::new("kubectl")
            .args(["get", "secret", &self.name, "-n", &self.namespace, "-o", &jsonpath])
            .output()
            .await
            .context("Failed to run kubectl")?;

        if !output.status.success() {
            return Err(MigrateError::Command {
                program: "kubectl".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        let encoded = String::from_utf8(output.stdout).context("kubectl output is not UTF-8")?;
        decode_secret(&encoded)
    }
}

fn decode_secret(encoded: &str) -> Result<Option<String>> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Ok(None);
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("Secret value is not valid base64")?;
    let token = String::from_utf8(bytes).context("Secret value is not UTF-8")?;
    Ok(Some(token.trim().to_string()).filter(|t| !t.is_empty()))
}

pub struct EnvVar(pub String);

#[async_trait]
impl CredentialSource for EnvVar {
    fn describe(&self) -> String {
        format!("environment variable {}", self.0)
    }

    async fn fetch(&self) -> Result<Option<String>> {
        Ok(env::var(&self.0).ok().filter(|v| !v.trim().is_empty()))
    }
}

/// A token passed on the command line.
pub struct Explicit(pub String);

#[async_trait]
impl CredentialSource for Explicit {
    fn describe(&self) -> String {
        "command line".to_string()
    }

    async fn fetch(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

pub struct CredentialChain {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }

    /// Cluster secret first, then the environment.
    pub fn from_config(config: &CredentialsConfig, explicit: Option<String>) -> Self {
        let mut sources: Vec<Box<dyn CredentialSource>> = Vec::new();
        if let Some(token) = explicit {
            sources.push(Box::new(Explicit(token)));
        }
        sources.push(Box::new(KubernetesSecret {
            namespace: config.namespace.clone(),
            name: config.secret.clone(),
            key: config.key.clone(),
        }));
        sources.push(Box::new(EnvVar(config.env_var.clone())));
        Self::new(sources)
    }

    /// First token any source yields. Source failures fall through to the next.
    pub async fn resolve(&self) -> Result<String> {
        for source in &self.sources {
            match source.fetch().await {
                Ok(Some(token)) => {
                    info!("Using API token from {}", source.describe());
                    return Ok(token);
                }
                Ok(None) => debug!("No token in {}", source.describe()),
                Err(e) => warn!("Could not read {}: {:#}", source.describe(), e),
            }
        }

        let tried: Vec<String> = self.sources.iter().map(|s| s.describe()).collect();
        Err(MigrateError::CredentialNotFound(tried.join(", ")).into())
    }
}
