//! Wire schema of the upstream feed.
//!
//! The upstream payload mixes several severity-metric versions and many
//! optional fields. It is decoded here into a strict schema where every
//! optional field is explicit, so nothing downstream inspects raw JSON.
//! Fields the engine does not interpret are kept in `extra` and passed
//! through to the stored record.
//!
//! Entries of `vulnerabilities` are decoded one by one: an entry that does
//! not fit the schema becomes a [`RawRecord`] marked malformed instead of
//! failing the whole page. Severity metrics are decoded leniently; a metric
//! block that cannot be read leaves the record unscored.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Upper bound on `resultsPerPage` imposed by the upstream API
pub const MAX_PAGE_SIZE: u32 = 2000;

/// One page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub start_index: u64,
    pub page_size: u32,
    /// Restrict to records modified inside `[start, end]`
    pub modified_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl PageRequest {
    pub fn new(start_index: u64, page_size: u32) -> Self {
        Self {
            start_index,
            page_size,
            modified_window: None,
        }
    }

    pub fn with_modified_window(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.modified_window = Some((since, until));
        self
    }
}

/// One decoded page of the feed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub total_results: u64,
    #[serde(default)]
    pub results_per_page: Option<u64>,
    #[serde(default)]
    pub start_index: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub vulnerabilities: Vec<RawRecord>,
}

/// A raw feed entry, wrapping the CVE payload
///
/// Decoding never fails: an entry without a usable `cve` object keeps the
/// decode error in `malformed` (and whatever id could be read) so the
/// normalizer can skip it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct RawRecord {
    pub cve: RawCve,
    /// Why the entry could not be decoded
    pub malformed: Option<String>,
}

impl RawRecord {
    pub fn from_cve(cve: RawCve) -> Self {
        Self {
            cve,
            malformed: None,
        }
    }

    /// An entry that did not match the schema
    pub fn malformed(reason: impl Into<String>, id: Option<String>) -> Self {
        Self {
            cve: RawCve {
                id,
                ..Default::default()
            },
            malformed: Some(reason.into()),
        }
    }
}

impl From<Value> for RawRecord {
    fn from(value: Value) -> Self {
        let cve = match value {
            Value::Object(mut entry) => entry.remove("cve"),
            _ => None,
        };
        let Some(cve) = cve else {
            return Self::malformed("entry has no `cve` object", None);
        };

        let id = cve.get("id").and_then(Value::as_str).map(String::from);
        match serde_json::from_value::<RawCve>(cve) {
            Ok(cve) => Self::from_cve(cve),
            Err(e) => Self::malformed(format!("undecodable `cve` object: {}", e), id),
        }
    }
}

impl From<RawRecord> for Value {
    fn from(record: RawRecord) -> Self {
        let mut entry = Map::new();
        if let Ok(cve) = serde_json::to_value(record.cve) {
            entry.insert("cve".to_string(), cve);
        }
        Value::Object(entry)
    }
}

/// CVE payload as published upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCve {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub metrics: Option<RawMetrics>,
    /// Everything else (descriptions, references, weaknesses, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Severity metric blocks, one list per CVSS version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetrics {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cvss_metric_v40: Vec<RawCvssMetric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cvss_metric_v31: Vec<RawCvssMetric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cvss_metric_v30: Vec<RawCvssMetric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cvss_metric_v2: Vec<RawCvssMetric>,
    /// Metric kinds the engine does not score
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One scoring of a CVE by one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCvssMetric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// "Primary" or "Secondary"
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    #[serde(default)]
    pub cvss_data: RawCvssData,
    /// Exploitability and impact sub-scores, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawCvssMetric {
    pub fn is_primary(&self) -> bool {
        self.metric_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("primary"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCvssData {
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_string: Option<String>,
    /// Version, attack vector, impact fields, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decode an optional field, treating a value of the wrong shape as absent
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}
