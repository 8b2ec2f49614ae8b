use std::fmt;

use serde::{Deserialize, Serialize};

/// TTL value Cloudflare uses for "automatic".
pub const AUTO_TTL: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Ns,
    Mx,
    Txt,
    Soa,
    Other(String),
}

impl RecordType {
    pub fn as_str(&self) -> &str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Ns => "NS",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Soa => "SOA",
            RecordType::Other(s) => s,
        }
    }
}

impl From<String> for RecordType {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "A" => RecordType::A,
            "AAAA" => RecordType::Aaaa,
            "CNAME" => RecordType::Cname,
            "NS" => RecordType::Ns,
            "MX" => RecordType::Mx,
            "TXT" => RecordType::Txt,
            "SOA" => RecordType::Soa,
            other => RecordType::Other(other.to_string()),
        }
    }
}

impl From<&str> for RecordType {
    fn from(s: &str) -> Self {
        RecordType::from(s.to_string())
    }
}

impl From<RecordType> for String {
    fn from(t: RecordType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as Cloudflare describes it. `id` is only set for records read
/// back from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(default, skip_serializing)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub name: String,
    pub content: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
}

fn default_ttl() -> u32 {
    AUTO_TTL
}

impl DnsRecord {
    pub fn new(record_type: RecordType, name: &str, content: &str) -> Self {
        Self {
            id: None,
            record_type,
            name: name.to_string(),
            content: content.to_string(),
            ttl: AUTO_TTL,
            proxied: None,
            priority: None,
        }
    }

    pub fn cname(name: &str, target: &str, proxied: bool) -> Self {
        Self {
            proxied: Some(proxied),
            ..Self::new(RecordType::Cname, name, target)
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.name, self.record_type.clone())
    }

    /// Same payload, ignoring the provider-assigned id.
    pub fn same_content(&self, other: &DnsRecord) -> bool {
        self.record_type == other.record_type
            && self.content == other.content
            && self.ttl == other.ttl
            && self.proxied.unwrap_or(false) == other.proxied.unwrap_or(false)
            && self.priority == other.priority
    }
}

/// Identity of a record inside a zone: (name, type).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub name: String,
    pub record_type: RecordType,
}

impl RecordKey {
    pub fn new(name: &str, record_type: RecordType) -> Self {
        Self {
            name: normalize_name(name),
            record_type,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.record_type, self.name)
    }
}

/// Lower-cased, without the trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Expand a relative name (`api`, `@`) into a name inside `zone`.
pub fn qualify(name: &str, zone: &str) -> String {
    let name = name.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');
    if name.is_empty() || name == "@" || name.eq_ignore_ascii_case(zone) {
        zone.to_string()
    } else if normalize_name(name).ends_with(&format!(".{}", normalize_name(zone))) {
        name.to_string()
    } else {
        format!("{}.{}", name, zone)
    }
}

pub fn is_apex(name: &str, zone: &str) -> bool {
    normalize_name(name) == normalize_name(zone)
}
