use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::MigrateError;
use crate::reconcile::RecordStore;
use crate::record::{DnsRecord, RecordType};

const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const PAGE_SIZE: u32 = 100;

pub struct CloudflareClient {
    client: Client,
    api_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

impl CloudflareClient {
    pub fn new(api_token: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("dns-migrate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, api_token })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<CloudflareResponse<T>> {
        let response: CloudflareResponse<T> = self
            .authorized(request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to Cloudflare", what))?
            .json()
            .await
            .with_context(|| format!("Failed to parse Cloudflare {} response", what))?;

        if !response.success {
            let errors: Vec<String> = response
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect();
            return Err(MigrateError::Api {
                provider: "Cloudflare",
                message: errors.join(", "),
            }
            .into());
        }

        Ok(response)
    }

    /// Resolve a zone by its domain name.
    pub async fn zone(&self, name: &str) -> Result<Zone> {
        debug!("Looking up zone ID for: {}", name);
        let url = format!("{}/zones", CLOUDFLARE_API_BASE);

        let response: CloudflareResponse<Vec<Zone>> = self
            .send(self.client.get(&url).query(&[("name", name)]), "zone lookup")
            .await?;

        let zone = response
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| MigrateError::ZoneNotFound(name.to_string()))?;

        info!("Zone {} has ID {}", zone.name, zone.id);
        Ok(zone)
    }

    /// All records in the zone, optionally filtered by type, across every page.
    pub async fn list_records(&self, zone_id: &str, record_type: Option<&RecordType>) -> Result<Vec<DnsRecord>> {
        let url = format!("{}/zones/{}/dns_records", CLOUDFLARE_API_BASE, zone_id);
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let mut query = vec![
                ("page", page.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
            ];
            if let Some(t) = record_type {
                query.push(("type", t.to_string()));
            }

            let response: CloudflareResponse<Vec<DnsRecord>> = self
                .send(self.client.get(&url).query(&query), "list")
                .await?;

            records.extend(response.result.unwrap_or_default());

            match response.result_info {
                Some(info) if info.page < info.total_pages => page = info.page + 1,
                _ => break,
            }
        }

        debug!("Fetched {} records from zone {}", records.len(), zone_id);
        Ok(records)
    }

    pub async fn create_record(&self, zone_id: &str, record: &DnsRecord) -> Result<DnsRecord> {
        let url = format!("{}/zones/{}/dns_records", CLOUDFLARE_API_BASE, zone_id);

        let response: CloudflareResponse<DnsRecord> = self
            .send(self.client.post(&url).json(record), "create")
            .await?;

        response
            .result
            .ok_or_else(|| anyhow::anyhow!("No result in Cloudflare response"))
    }

    pub async fn update_record(&self, zone_id: &str, record_id: &str, record: &DnsRecord) -> Result<DnsRecord> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            CLOUDFLARE_API_BASE, zone_id, record_id
        );

        let response: CloudflareResponse<DnsRecord> = self
            .send(self.client.put(&url).json(record), "update")
            .await?;

        response
            .result
            .ok_or_else(|| anyhow::anyhow!("No result in Cloudflare response"))
    }

    pub async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            CLOUDFLARE_API_BASE, zone_id, record_id
        );

        self.send::<serde_json::Value>(self.client.delete(&url), "delete")
            .await?;
        Ok(())
    }

    /// Permanent redirect of every URL matching `pattern` to `destination`
    /// (`$1` carries the wildcard match).
    pub async fn create_forwarding_rule(&self, zone_id: &str, pattern: &str, destination: &str) -> Result<String> {
        let url = format!("{}/zones/{}/pagerules", CLOUDFLARE_API_BASE, zone_id);

        let response: CloudflareResponse<PageRule> = self
            .send(
                self.client.post(&url).json(&forwarding_rule(pattern, destination)),
                "page rule",
            )
            .await?;

        response
            .result
            .map(|rule| rule.id)
            .ok_or_else(|| anyhow::anyhow!("No result in Cloudflare response"))
    }

    pub async fn set_vanity_nameservers(&self, zone_id: &str, nameservers: &[String]) -> Result<()> {
        let url = format!(
            "{}/zones/{}/settings/vanity_nameservers",
            CLOUDFLARE_API_BASE, zone_id
        );

        self.send::<serde_json::Value>(
            self.client.put(&url).json(&json!({ "value": nameservers })),
            "nameserver",
        )
        .await?;
        Ok(())
    }
}

fn forwarding_rule(pattern: &str, destination: &str) -> serde_json::Value {
    json!({
        "targets": [{
            "target": "url",
            "constraint": { "operator": "matches", "value": pattern }
        }],
        "actions": [{
            "id": "forwarding_url",
            "value": { "url": destination, "status_code": 301 }
        }],
        "priority": 1,
        "status": "active"
    })
}

/// A client bound to one zone, usable wherever records are reconciled.
pub struct CloudflareZone<'a> {
    pub client: &'a CloudflareClient,
    pub zone: Zone,
}

#[async_trait]
impl RecordStore for CloudflareZone<'_> {
    async fn list(&self) -> Result<Vec<DnsRecord>> {
        self.client.list_records(&self.zone.id, None).await
    }

    async fn create(&self, record: &DnsRecord) -> Result<DnsRecord> {
        self.client.create_record(&self.zone.id, record).await
    }

    async fn update(&self, id: &str, record: &DnsRecord) -> Result<DnsRecord> {
        self.client.update_record(&self.zone.id, id, record).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.client.delete_record(&self.zone.id, id).await
    }
}

// Cloudflare API types

#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    page: u32,
    total_pages: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PageRule {
    id: String,
}
