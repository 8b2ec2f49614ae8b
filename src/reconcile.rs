//! Record reconciliation: converting Cloudflare records into Route 53 record
//! sets, planning the minimal change list, and create-or-update against a
//! record store keyed by (name, type).

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};

use crate::dns::HostResolver;
use crate::record::{is_apex, normalize_name, DnsRecord, RecordKey, RecordType, AUTO_TTL};
use crate::route53::{Change, ChangeAction, RecordSet};

/// Route 53 has no "auto" TTL.
pub const DEFAULT_TTL: u32 = 300;
pub const DEFAULT_MX_PRIORITY: u16 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Apex NS/SOA belong to whichever provider is authoritative.
    ApexAuthority,
    /// Route 53 cannot hold a CNAME at the apex.
    ApexCname,
    /// A hosting-provider CNAME whose target did not resolve.
    Unresolvable(String),
}

#[derive(Debug, Default)]
pub struct Conversion {
    pub record_sets: Vec<RecordSet>,
    pub skipped: Vec<(DnsRecord, SkipReason)>,
}

impl Conversion {
    /// Names whose source records exist but were not converted this run.
    /// Their target records must survive a prune.
    pub fn retained_names(&self) -> HashSet<String> {
        self.skipped
            .iter()
            .filter(|(_, reason)| !matches!(reason, SkipReason::ApexAuthority))
            .map(|(record, _)| normalize_name(&record.name))
            .collect()
    }
}

/// Shared settings for converting one zone.
pub struct Converter<'a> {
    pub zone: &'a str,
    pub hosting_suffix: &'a str,
    pub resolver: &'a dyn HostResolver,
}

impl Converter<'_> {
    /// Convert every record, merging records with the same (name, type) into
    /// one record set in first-seen order.
    pub async fn convert_all(&self, records: &[DnsRecord]) -> Conversion {
        let mut conversion = Conversion::default();
        let mut index: HashMap<RecordKey, usize> = HashMap::new();

        for record in records {
            let set = match self.convert(record).await {
                Ok(set) => set,
                Err(reason) => {
                    warn!("Skipping {} {}: {:?}", record.record_type, record.name, reason);
                    conversion.skipped.push((record.clone(), reason));
                    continue;
                }
            };

            match index.get(&set.key()) {
                Some(&i) => {
                    let existing = &mut conversion.record_sets[i];
                    for rr in set.resource_records {
                        if !existing.resource_records.contains(&rr) {
                            existing.resource_records.push(rr);
                        }
                    }
                }
                None => {
                    index.insert(set.key(), conversion.record_sets.len());
                    conversion.record_sets.push(set);
                }
            }
        }

        conversion
    }

    /// Convert a single record, or say why it has no Route 53 counterpart.
    pub async fn convert(&self, record: &DnsRecord) -> Result<RecordSet, SkipReason> {
        let ttl = route53_ttl(record.ttl);
        let apex = is_apex(&record.name, self.zone);

        match &record.record_type {
            RecordType::Ns | RecordType::Soa if apex => Err(SkipReason::ApexAuthority),
            RecordType::Cname if self.is_hosted_target(&record.content) => {
                match self.resolver.resolve_ipv4(&record.content).await {
                    Ok(ip) => {
                        info!("Flattened {} -> {} ({})", record.name, record.content, ip);
                        Ok(RecordSet::new(&record.name, RecordType::A, ttl, vec![ip.to_string()]))
                    }
                    Err(e) => {
                        warn!("Could not resolve {}: {:#}", record.content, e);
                        Err(SkipReason::Unresolvable(record.content.clone()))
                    }
                }
            }
            RecordType::Cname if apex => Err(SkipReason::ApexCname),
            RecordType::Mx => {
                let priority = record.priority.unwrap_or(DEFAULT_MX_PRIORITY);
                let value = format!("{} {}", priority, record.content);
                Ok(RecordSet::new(&record.name, RecordType::Mx, ttl, vec![value]))
            }
            RecordType::Txt => Ok(RecordSet::new(
                &record.name,
                RecordType::Txt,
                ttl,
                vec![quote_txt(&record.content)],
            )),
            other => Ok(RecordSet::new(
                &record.name,
                other.clone(),
                ttl,
                vec![record.content.clone()],
            )),
        }
    }

    fn is_hosted_target(&self, target: &str) -> bool {
        let target = target.trim_end_matches('.').to_ascii_lowercase();
        let suffix = self.hosting_suffix.trim_matches('.').to_ascii_lowercase();
        target == suffix || target.ends_with(&format!(".{}", suffix))
    }
}

pub fn route53_ttl(ttl: u32) -> u32 {
    if ttl == 0 || ttl == AUTO_TTL {
        DEFAULT_TTL
    } else {
        ttl
    }
}

/// Wrap in exactly one pair of double quotes, escaping quotes inside.
pub fn quote_txt(content: &str) -> String {
    let inner = content
        .strip_prefix('"')
        .and_then(|c| c.strip_suffix('"'))
        .unwrap_or(content);
    let escaped = inner.replace("\\\"", "\"").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn comparable_values(set: &RecordSet) -> BTreeSet<String> {
    set.values()
        .iter()
        .map(|v| v.trim_end_matches('.').to_string())
        .collect()
}

fn same_record_set(a: &RecordSet, b: &RecordSet) -> bool {
    !a.is_alias()
        && !b.is_alias()
        && a.ttl == b.ttl
        && comparable_values(a) == comparable_values(b)
}

/// Changes needed to move `existing` to `desired`. Identical sets produce no
/// change; with `prune`, sets missing from `desired` are deleted except the
/// apex NS/SOA, alias and routed sets and anything named in `retained`.
/// Routed sets are never compared or touched.
pub fn plan_record_sets(
    desired: &[RecordSet],
    existing: &[RecordSet],
    zone: &str,
    prune: bool,
    retained: &HashSet<String>,
) -> Vec<Change> {
    let current: HashMap<RecordKey, &RecordSet> = existing
        .iter()
        .filter(|s| !s.is_routed())
        .map(|s| (s.key(), s))
        .collect();
    let mut changes = Vec::new();

    for set in desired {
        match current.get(&set.key()) {
            Some(found) if same_record_set(found, set) => {}
            _ => changes.push(Change {
                action: ChangeAction::Upsert,
                record_set: set.clone(),
            }),
        }
    }

    if prune {
        let wanted: HashSet<RecordKey> = desired.iter().map(RecordSet::key).collect();
        for set in existing {
            let key = set.key();
            let authority = matches!(set.record_type, RecordType::Ns | RecordType::Soa)
                && is_apex(&key.name, zone);
            if wanted.contains(&key) || authority || set.is_alias() || set.is_routed() {
                continue;
            }
            if retained.contains(&key.name) {
                debug!("Keeping {}: its source record was skipped", key);
                continue;
            }
            changes.push(Change {
                action: ChangeAction::Delete,
                record_set: set.clone(),
            });
        }
    }

    changes
}

/// CRUD surface of a provider zone that records can be reconciled against.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list(&self) -> Result<Vec<DnsRecord>>;
    async fn create(&self, record: &DnsRecord) -> Result<DnsRecord>;
    async fn update(&self, id: &str, record: &DnsRecord) -> Result<DnsRecord>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ApplySummary {
    pub fn changed(&self) -> usize {
        self.created + self.updated
    }
}

/// Create-or-update each desired record, keyed by (name, type). Names in
/// `desired` must already be fully qualified. Failures are logged and counted.
/// When `desired` repeats a key only the first record is applied.
pub async fn apply_upserts(store: &dyn RecordStore, desired: &[DnsRecord]) -> Result<ApplySummary> {
    let existing = store.list().await?;
    let mut index: HashMap<RecordKey, DnsRecord> =
        existing.into_iter().map(|r| (r.key(), r)).collect();
    let mut summary = ApplySummary::default();

    let mut seen: HashSet<RecordKey> = HashSet::new();
    for record in desired {
        let key = record.key();
        if !seen.insert(key.clone()) {
            warn!("Ignoring duplicate {} -> {}", key, record.content);
            continue;
        }
        let result = match index.get(&key) {
            Some(found) if found.same_content(record) => {
                info!("{} is already up to date", key);
                summary.unchanged += 1;
                continue;
            }
            Some(found) => match found.id.as_deref() {
                Some(id) => {
                    info!("Updating {} (id {}) -> {}", key, id, record.content);
                    store.update(id, record).await.map(|r| (r, false))
                }
                None => Err(anyhow::anyhow!("Existing record {} has no id", key)),
            },
            None => {
                info!("Creating {} -> {}", key, record.content);
                store.create(record).await.map(|r| (r, true))
            }
        };

        match result {
            Ok((stored, created)) => {
                if created {
                    summary.created += 1;
                } else {
                    summary.updated += 1;
                }
                index.insert(key, stored);
            }
            Err(e) => {
                error!("Failed to apply {}: {:#}", key, e);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use super::*;

    const ZONE: &str = "example.com";

    struct FakeResolver;

    #[async_trait]
    impl HostResolver for FakeResolver {
        async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
            match host {
                "app.up.railway.app" => Ok(Ipv4Addr::new(66, 33, 22, 11)),
                _ => anyhow::bail!("NXDOMAIN"),
            }
        }
    }

    fn converter() -> Converter<'static> {
        Converter {
            zone: ZONE,
            hosting_suffix: "railway.app",
            resolver: &FakeResolver,
        }
    }

    fn record(t: RecordType, name: &str, content: &str) -> DnsRecord {
        DnsRecord::new(t, name, content)
    }

    #[tokio::test]
    async fn apex_ns_and_soa_are_dropped_but_delegations_kept() {
        let records = vec![
            record(RecordType::Ns, ZONE, "ns1.cloudflare.com"),
            record(RecordType::Soa, ZONE, "ns1.cloudflare.com dns.cloudflare.com 1 2 3 4 5"),
            record(RecordType::Ns, "dev.example.com", "ns1.other.net"),
        ];
        let conversion = converter().convert_all(&records).await;

        assert_eq!(conversion.record_sets.len(), 1);
        assert_eq!(conversion.record_sets[0].name, "dev.example.com.");
        assert_eq!(conversion.skipped.len(), 2);
        assert!(conversion
            .skipped
            .iter()
            .all(|(_, reason)| *reason == SkipReason::ApexAuthority));
    }

    #[tokio::test]
    async fn hosted_cname_becomes_a_record() {
        let set = converter()
            .convert(&record(RecordType::Cname, "api.example.com", "app.up.railway.app"))
            .await
            .unwrap();
        assert_eq!(set.record_type, RecordType::A);
        assert_eq!(set.values(), vec!["66.33.22.11"]);
        assert_eq!(set.ttl, Some(DEFAULT_TTL));
    }

    #[tokio::test]
    async fn hosted_cname_at_apex_is_flattened_too() {
        let set = converter()
            .convert(&record(RecordType::Cname, ZONE, "app.up.railway.app"))
            .await
            .unwrap();
        assert_eq!(set.name, "example.com.");
        assert_eq!(set.record_type, RecordType::A);
    }

    #[tokio::test]
    async fn unresolvable_hosted_cname_emits_nothing() {
        let conversion = converter()
            .convert_all(&[record(RecordType::Cname, "docs.example.com", "gone.up.railway.app")])
            .await;
        assert!(conversion.record_sets.is_empty());
        assert_eq!(
            conversion.skipped[0].1,
            SkipReason::Unresolvable("gone.up.railway.app".to_string())
        );
    }

    #[tokio::test]
    async fn suffix_match_is_on_label_boundary() {
        let set = converter()
            .convert(&record(RecordType::Cname, "x.example.com", "notrailway.app"))
            .await
            .unwrap();
        assert_eq!(set.record_type, RecordType::Cname);
        assert_eq!(set.values(), vec!["notrailway.app"]);
    }

    #[tokio::test]
    async fn other_apex_cname_needs_manual_handling() {
        let reason = converter()
            .convert(&record(RecordType::Cname, ZONE, "d1.cloudfront.net"))
            .await
            .unwrap_err();
        assert_eq!(reason, SkipReason::ApexCname);
    }

    #[tokio::test]
    async fn mx_value_carries_priority() {
        let mut mx = record(RecordType::Mx, ZONE, "mx1.mail.example.net");
        mx.priority = Some(20);
        let set = converter().convert(&mx).await.unwrap();
        assert_eq!(set.values(), vec!["20 mx1.mail.example.net"]);

        let default = converter()
            .convert(&record(RecordType::Mx, ZONE, "mx2.mail.example.net"))
            .await
            .unwrap();
        assert_eq!(default.values(), vec!["10 mx2.mail.example.net"]);
    }

    #[test]
    fn txt_is_quoted_exactly_once() {
        assert_eq!(quote_txt("v=spf1 -all"), "\"v=spf1 -all\"");
        assert_eq!(quote_txt("\"v=spf1 -all\""), "\"v=spf1 -all\"");
        assert_eq!(quote_txt("\"\""), "\"\"");
    }

    #[test]
    fn txt_inner_quotes_are_escaped() {
        assert_eq!(quote_txt("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_txt("\"say \"hi\"\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_txt("say \\\"hi\\\""), "\"say \\\"hi\\\"\"");
    }

    #[tokio::test]
    async fn same_name_and_type_merge_into_one_set() {
        let records = vec![
            record(RecordType::Txt, ZONE, "v=spf1 -all"),
            record(RecordType::Txt, ZONE, "google-site-verification=abc").with_ttl(3600),
        ];
        let conversion = converter().convert_all(&records).await;
        assert_eq!(conversion.record_sets.len(), 1);
        assert_eq!(
            conversion.record_sets[0].values(),
            vec!["\"v=spf1 -all\"", "\"google-site-verification=abc\""]
        );
    }

    #[test]
    fn auto_ttl_maps_to_default() {
        assert_eq!(route53_ttl(AUTO_TTL), DEFAULT_TTL);
        assert_eq!(route53_ttl(0), DEFAULT_TTL);
        assert_eq!(route53_ttl(120), 120);
    }

    #[tokio::test]
    async fn replanning_against_synced_target_is_empty() {
        let records = vec![
            record(RecordType::A, "www.example.com", "192.0.2.10"),
            record(RecordType::Txt, ZONE, "v=spf1 -all"),
            record(RecordType::Cname, "api.example.com", "app.up.railway.app"),
        ];
        let desired = converter().convert_all(&records).await.record_sets;

        let first = plan_record_sets(&desired, &[], ZONE, false, &HashSet::new());
        assert_eq!(first.len(), 3);

        // Target after applying the first plan, as Route 53 lists it back.
        let mut synced: Vec<RecordSet> = first.into_iter().map(|c| c.record_set).collect();
        synced.push(RecordSet::new(ZONE, RecordType::Ns, 172800, vec!["ns-1.awsdns-1.org.".into()]));

        let none = HashSet::new();
        assert!(plan_record_sets(&desired, &synced, ZONE, false, &none).is_empty());
        assert!(plan_record_sets(&desired, &synced, ZONE, true, &none).is_empty());
    }

    #[test]
    fn changed_values_upsert_and_prune_deletes_extras() {
        let desired = vec![RecordSet::new("www.example.com", RecordType::A, 300, vec!["192.0.2.2".into()])];
        let existing = vec![
            RecordSet::new("www.example.com", RecordType::A, 300, vec!["192.0.2.1".into()]),
            RecordSet::new("old.example.com", RecordType::A, 300, vec!["192.0.2.9".into()]),
        ];

        let none = HashSet::new();
        let changes = plan_record_sets(&desired, &existing, ZONE, false, &none);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Upsert);

        let changes = plan_record_sets(&desired, &existing, ZONE, true, &none);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].action, ChangeAction::Delete);
        assert_eq!(changes[1].record_set.name, "old.example.com.");
    }

    #[tokio::test]
    async fn prune_keeps_targets_of_unresolvable_sources() {
        let records = vec![
            record(RecordType::Cname, "api.example.com", "down.up.railway.app"),
            record(RecordType::A, "www.example.com", "192.0.2.10"),
        ];
        let conversion = converter().convert_all(&records).await;
        let existing = vec![
            RecordSet::new("api.example.com", RecordType::A, 300, vec!["66.33.22.11".into()]),
            RecordSet::new("www.example.com", RecordType::A, 300, vec!["192.0.2.10".into()]),
        ];

        let changes = plan_record_sets(
            &conversion.record_sets,
            &existing,
            ZONE,
            true,
            &conversion.retained_names(),
        );
        assert!(changes.is_empty(), "unexpected changes: {:?}", changes);
    }

    #[tokio::test]
    async fn prune_keeps_hand_made_apex_record_for_manual_cname() {
        let records = vec![record(RecordType::Cname, ZONE, "d1.cloudfront.net")];
        let conversion = converter().convert_all(&records).await;
        let existing = vec![
            RecordSet::new(ZONE, RecordType::A, 300, vec!["192.0.2.50".into()]),
            RecordSet::new("stale.example.com", RecordType::A, 300, vec!["192.0.2.9".into()]),
        ];

        let changes = plan_record_sets(
            &conversion.record_sets,
            &existing,
            ZONE,
            true,
            &conversion.retained_names(),
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Delete);
        assert_eq!(changes[0].record_set.name, "stale.example.com.");
    }

    #[test]
    fn routed_sets_are_neither_compared_nor_pruned() {
        let desired = vec![RecordSet::new("www.example.com", RecordType::A, 300, vec!["192.0.2.2".into()])];
        let mut weighted = RecordSet::new("lb.example.com", RecordType::A, 60, vec!["192.0.2.7".into()]);
        weighted.set_identifier = Some("blue".to_string());
        weighted.routing.insert("Weight".to_string(), serde_json::json!(90));
        let mut synced = desired[0].clone();
        synced.set_identifier = Some("green".to_string());

        let changes = plan_record_sets(&desired, &[weighted, synced], ZONE, true, &HashSet::new());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Upsert);
        assert_eq!(changes[0].record_set.name, "www.example.com.");
    }

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<DnsRecord>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn list(&self) -> Result<Vec<DnsRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn create(&self, record: &DnsRecord) -> Result<DnsRecord> {
            let mut records = self.records.lock().unwrap();
            let mut stored = record.clone();
            stored.id = Some(format!("id-{}", records.len()));
            records.push(stored.clone());
            self.calls.lock().unwrap().push(format!("create {}", record.name));
            Ok(stored)
        }

        async fn update(&self, id: &str, record: &DnsRecord) -> Result<DnsRecord> {
            let mut records = self.records.lock().unwrap();
            let slot = records
                .iter_mut()
                .find(|r| r.id.as_deref() == Some(id))
                .ok_or_else(|| anyhow::anyhow!("no record {}", id))?;
            let mut stored = record.clone();
            stored.id = Some(id.to_string());
            *slot = stored.clone();
            self.calls.lock().unwrap().push(format!("update {}", id));
            Ok(stored)
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.records.lock().unwrap().retain(|r| r.id.as_deref() != Some(id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_in_place() {
        let store = MemoryStore::default();
        let desired = vec![
            DnsRecord::cname("api.example.com", "d9db5a94dictq.cloudfront.net", true),
            DnsRecord::cname("www.example.com", "d361asqhi0ugoo.cloudfront.net", true),
        ];

        let first = apply_upserts(&store, &desired).await.unwrap();
        assert_eq!(first.created, 2);

        let moved = vec![DnsRecord::cname("api.example.com", "dnew.cloudfront.net", true)];
        let second = apply_upserts(&store, &moved).await.unwrap();
        assert_eq!(second.updated, 1);
        assert_eq!(store.calls.lock().unwrap().last().unwrap(), "update id-0");
        assert_eq!(store.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upsert_twice_is_idempotent() {
        let store = MemoryStore::default();
        let desired = vec![
            DnsRecord::cname("api.example.com", "d9db5a94dictq.cloudfront.net", true),
            record(RecordType::Txt, ZONE, "\"v=spf1 -all\""),
        ];

        apply_upserts(&store, &desired).await.unwrap();
        let calls_after_first = store.calls.lock().unwrap().len();

        let again = apply_upserts(&store, &desired).await.unwrap();
        assert_eq!(again.changed(), 0);
        assert_eq!(again.unchanged, 2);
        assert_eq!(store.calls.lock().unwrap().len(), calls_after_first);
    }

    #[tokio::test]
    async fn duplicate_desired_keys_apply_only_the_first() {
        let store = MemoryStore::default();
        let desired = vec![
            DnsRecord::cname("docs.example.com", "example.com", true),
            DnsRecord::cname("DOCS.example.com.", "other.example.net", true),
        ];
        let summary = apply_upserts(&store, &desired).await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.updated, 0);
        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "example.com");
    }

    #[tokio::test]
    async fn distinct_types_with_same_name_do_not_collide() {
        let store = MemoryStore::default();
        let desired = vec![
            record(RecordType::A, "www.example.com", "192.0.2.1"),
            record(RecordType::Txt, "www.example.com", "\"hello\""),
        ];
        let summary = apply_upserts(&store, &desired).await.unwrap();
        assert_eq!(summary.created, 2);
    }
}
