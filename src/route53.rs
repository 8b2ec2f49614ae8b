//! Route 53 record sets and change batches, submitted through the `aws` CLI.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::aws::AwsCli;
use crate::record::{RecordKey, RecordType};

/// Route 53 rejects change batches larger than this.
pub const MAX_CHANGES_PER_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSet {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type")]
    pub record_type: RecordType,
    #[serde(rename = "TTL", default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(rename = "ResourceRecords", default, skip_serializing_if = "Vec::is_empty")]
    pub resource_records: Vec<ResourceRecord>,
    #[serde(rename = "AliasTarget", default, skip_serializing_if = "Option::is_none")]
    pub alias_target: Option<Value>,
    /// Present on weighted, latency, failover, geolocation and multivalue sets.
    #[serde(rename = "SetIdentifier", default, skip_serializing_if = "Option::is_none")]
    pub set_identifier: Option<String>,
    /// Remaining routing-policy fields (`Weight`, `Region`, `HealthCheckId`, ...)
    /// kept verbatim so a DELETE matches the listed set exactly.
    #[serde(flatten)]
    pub routing: Map<String, Value>,
}

impl RecordSet {
    pub fn new(name: &str, record_type: RecordType, ttl: u32, values: Vec<String>) -> Self {
        Self {
            name: fqdn(name),
            record_type,
            ttl: Some(ttl),
            resource_records: values.into_iter().map(|value| ResourceRecord { value }).collect(),
            alias_target: None,
            set_identifier: None,
            routing: Map::new(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&unescape_name(&self.name), self.record_type.clone())
    }

    pub fn values(&self) -> Vec<&str> {
        self.resource_records.iter().map(|r| r.value.as_str()).collect()
    }

    pub fn is_alias(&self) -> bool {
        self.alias_target.is_some()
    }

    /// One of several sets sharing a (name, type) under a routing policy.
    pub fn is_routed(&self) -> bool {
        self.set_identifier.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "Action")]
    pub action: ChangeAction,
    #[serde(rename = "ResourceRecordSet")]
    pub record_set: RecordSet,
}

pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Route 53 returns `*` as the octal escape `\052`.
fn unescape_name(name: &str) -> String {
    name.replace("\\052", "*")
}

pub fn change_batches(changes: &[Change]) -> Vec<Value> {
    changes
        .chunks(MAX_CHANGES_PER_BATCH)
        .map(|chunk| json!({ "Changes": chunk }))
        .collect()
}

pub struct Route53 {
    aws: AwsCli,
}

impl Route53 {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }

    pub async fn list_record_sets(&self, hosted_zone_id: &str) -> Result<Vec<RecordSet>> {
        let output = self
            .aws
            .run(&["route53", "list-resource-record-sets", "--hosted-zone-id", hosted_zone_id])
            .await?;

        let sets = output
            .get("ResourceRecordSets")
            .cloned()
            .unwrap_or_else(|| json!([]));
        serde_json::from_value(sets).context("Unexpected list-resource-record-sets output")
    }

    /// Submit changes in batches; returns the number of batches sent.
    pub async fn submit(&self, hosted_zone_id: &str, changes: &[Change]) -> Result<usize> {
        let batches = change_batches(changes);
        for (i, batch) in batches.iter().enumerate() {
            let body = batch.to_string();
            let output = self
                .aws
                .run(&[
                    "route53",
                    "change-resource-record-sets",
                    "--hosted-zone-id",
                    hosted_zone_id,
                    "--change-batch",
                    &body,
                ])
                .await
                .with_context(|| format!("Change batch {} of {} rejected", i + 1, batches.len()))?;

            let status = output["ChangeInfo"]["Status"].as_str().unwrap_or("UNKNOWN");
            info!("Submitted change batch {} of {} ({})", i + 1, batches.len(), status);
        }
        Ok(batches.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(i: usize) -> Change {
        Change {
            action: ChangeAction::Upsert,
            record_set: RecordSet::new(
                &format!("h{}.example.com", i),
                RecordType::A,
                300,
                vec!["192.0.2.1".to_string()],
            ),
        }
    }

    #[test]
    fn batches_never_exceed_limit() {
        let changes: Vec<Change> = (0..250).map(upsert).collect();
        let batches = change_batches(&changes);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0]["Changes"].as_array().unwrap().len(), 100);
        assert_eq!(batches[2]["Changes"].as_array().unwrap().len(), 50);
    }

    #[test]
    fn change_serializes_in_route53_shape() {
        let value = serde_json::to_value(upsert(1)).unwrap();
        assert_eq!(value["Action"], "UPSERT");
        assert_eq!(value["ResourceRecordSet"]["Name"], "h1.example.com.");
        assert_eq!(value["ResourceRecordSet"]["Type"], "A");
        assert_eq!(value["ResourceRecordSet"]["TTL"], 300);
        assert_eq!(value["ResourceRecordSet"]["ResourceRecords"][0]["Value"], "192.0.2.1");
        assert!(value["ResourceRecordSet"].get("AliasTarget").is_none());
    }

    #[test]
    fn parses_listed_record_sets_including_aliases() {
        let sets: Vec<RecordSet> = serde_json::from_value(json!([
            {
                "Name": "\\052.example.com.",
                "Type": "CNAME",
                "TTL": 300,
                "ResourceRecords": [{"Value": "example.com"}]
            },
            {
                "Name": "example.com.",
                "Type": "A",
                "AliasTarget": {
                    "HostedZoneId": "Z2FDTNDATAQYW2",
                    "DNSName": "d1.cloudfront.net.",
                    "EvaluateTargetHealth": false
                }
            }
        ]))
        .unwrap();

        assert_eq!(sets[0].key(), RecordKey::new("*.example.com", RecordType::Cname));
        assert!(!sets[0].is_alias());
        assert!(sets[1].is_alias());
        assert!(sets[1].values().is_empty());
    }

    #[test]
    fn routed_sets_keep_their_policy_fields_for_delete() {
        let listed = json!({
            "Name": "api.example.com.",
            "Type": "A",
            "SetIdentifier": "blue",
            "Weight": 90,
            "HealthCheckId": "hc-1",
            "TTL": 60,
            "ResourceRecords": [{"Value": "192.0.2.1"}]
        });
        let set: RecordSet = serde_json::from_value(listed.clone()).unwrap();
        assert!(set.is_routed());
        assert!(!RecordSet::new("api.example.com", RecordType::A, 60, vec![]).is_routed());

        let delete = serde_json::to_value(Change {
            action: ChangeAction::Delete,
            record_set: set,
        })
        .unwrap();
        assert_eq!(delete["ResourceRecordSet"], listed);
    }
}
