use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Ok(u16),
    Status(u16),
    Unreachable(String),
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeResult::Ok(_))
    }
}

/// HTTPS reachability check of migrated hosts.
pub struct Prober {
    client: Client,
}

impl Prober {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub async fn probe(&self, host: &str) -> ProbeResult {
        match self.client.get(format!("https://{}", host)).send().await {
            Ok(response) => classify(response.status().as_u16()),
            Err(e) => ProbeResult::Unreachable(e.to_string()),
        }
    }
}

fn classify(status: u16) -> ProbeResult {
    if status == 200 {
        ProbeResult::Ok(status)
    } else {
        ProbeResult::Status(status)
    }
}
