//! Raw feed record → [`CveRecord`].
//!
//! Pure and synchronous. Records that cannot be stored produce a
//! [`SkipSignal`] instead of an error; the orchestrator counts and logs them
//! and carries on with the page.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::feed::{RawCvssMetric, RawMetrics, RawRecord};
use crate::model::{CveRecord, CvssVersion};

/// Why a raw record was not turned into a `CveRecord`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No id, or an empty one
    MissingId,
    /// `lastModified` absent
    MissingLastModified,
    /// A timestamp field that could not be parsed
    InvalidTimestamp { field: &'static str, value: String },
    /// The entry did not match the feed schema
    Malformed(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingId => f.write_str("missing id"),
            SkipReason::MissingLastModified => f.write_str("missing lastModified"),
            SkipReason::InvalidTimestamp { field, value } => {
                write!(f, "invalid {} timestamp '{}'", field, value)
            }
            SkipReason::Malformed(detail) => write!(f, "malformed entry: {}", detail),
        }
    }
}

/// A raw record the caller should count and move past
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipSignal {
    /// Id, when the record had one
    pub id: Option<String>,
    pub reason: SkipReason,
}

/// Result of normalizing one raw record
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(CveRecord),
    Skipped(SkipSignal),
}

/// Normalize one raw feed record
///
/// `published` falls back to `lastModified` when absent. `base_score` comes
/// from the first metric block present in [`CvssVersion::PRIORITY`] order;
/// with no block the score is 0.0 and `cvss_version` stays `None`. The
/// metric blocks themselves are kept in `attributes["metrics"]`.
pub fn normalize(raw: RawRecord) -> Normalized {
    if let Some(detail) = raw.malformed {
        return Normalized::Skipped(SkipSignal {
            id: raw.cve.id,
            reason: SkipReason::Malformed(detail),
        });
    }
    let cve = raw.cve;

    let id = match cve.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return Normalized::Skipped(SkipSignal {
                id: None,
                reason: SkipReason::MissingId,
            });
        }
    };

    let skip = |reason| {
        Normalized::Skipped(SkipSignal {
            id: Some(id.clone()),
            reason,
        })
    };

    let last_modified = match cve.last_modified.as_deref() {
        None => return skip(SkipReason::MissingLastModified),
        Some(value) => match parse_feed_timestamp(value) {
            Some(ts) => ts,
            None => {
                return skip(SkipReason::InvalidTimestamp {
                    field: "lastModified",
                    value: value.to_string(),
                });
            }
        },
    };

    let published = match cve.published.as_deref() {
        None => last_modified,
        Some(value) => match parse_feed_timestamp(value) {
            Some(ts) => ts,
            None => {
                return skip(SkipReason::InvalidTimestamp {
                    field: "published",
                    value: value.to_string(),
                });
            }
        },
    };

    let mut record = CveRecord::new(id, published, last_modified);
    record.attributes = cve.extra;
    if let Some(metrics) = cve.metrics {
        if let Some((score, version)) = select_base_score(&metrics) {
            record = record.with_score(score, version);
        }
        if let Ok(value) = serde_json::to_value(&metrics) {
            record.attributes.insert("metrics".to_string(), value);
        }
    }

    Normalized::Record(record)
}

/// Pick the base score from the highest-priority metric block present
///
/// Within a block the source marked "Primary" wins; otherwise the first
/// entry with a usable score is taken.
pub fn select_base_score(metrics: &RawMetrics) -> Option<(f64, CvssVersion)> {
    CvssVersion::PRIORITY.iter().find_map(|version| {
        let block = metric_block(metrics, *version);
        block
            .iter()
            .filter(|m| m.is_primary())
            .chain(block.iter().filter(|m| !m.is_primary()))
            .find_map(usable_score)
            .map(|score| (score, *version))
    })
}

fn metric_block(metrics: &RawMetrics, version: CvssVersion) -> &[RawCvssMetric] {
    match version {
        CvssVersion::V40 => &metrics.cvss_metric_v40,
        CvssVersion::V31 => &metrics.cvss_metric_v31,
        CvssVersion::V30 => &metrics.cvss_metric_v30,
        CvssVersion::V2 => &metrics.cvss_metric_v2,
    }
}

fn usable_score(metric: &RawCvssMetric) -> Option<f64> {
    metric
        .cvss_data
        .base_score
        .filter(|s| s.is_finite() && (0.0..=10.0).contains(s))
}

/// Parse the timestamp formats seen in the feed
///
/// The upstream omits the offset ("2024-01-02T03:04:05.678"); such values are
/// taken as UTC. RFC 3339 and bare dates are accepted as well.
pub fn parse_feed_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{RawCve, RawCvssData};
    use chrono::TimeZone;
    use serde_json::json;

    fn metric(score: f64, metric_type: &str) -> RawCvssMetric {
        RawCvssMetric {
            source: Some("nvd@nist.gov".into()),
            metric_type: Some(metric_type.into()),
            cvss_data: RawCvssData {
                base_score: Some(score),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn raw(id: Option<&str>, metrics: Option<RawMetrics>) -> RawRecord {
        RawRecord::from_cve(RawCve {
            id: id.map(String::from),
            published: Some("2023-05-01T12:00:00.000".into()),
            last_modified: Some("2024-02-03T04:05:06.789".into()),
            metrics,
            extra: Default::default(),
        })
    }

    fn expect_record(normalized: Normalized) -> CveRecord {
        match normalized {
            Normalized::Record(record) => record,
            Normalized::Skipped(signal) => panic!("unexpected skip: {:?}", signal),
        }
    }

    #[test]
    fn test_newest_scheme_wins() {
        let metrics = RawMetrics {
            cvss_metric_v31: vec![metric(9.8, "Primary")],
            cvss_metric_v2: vec![metric(7.5, "Primary")],
            ..Default::default()
        };
        let record = expect_record(normalize(raw(Some("CVE-2024-1"), Some(metrics))));
        assert_eq!(record.base_score, 9.8);
        assert_eq!(record.cvss_version, Some(CvssVersion::V31));
    }

    #[test]
    fn test_v40_beats_v31() {
        let metrics = RawMetrics {
            cvss_metric_v40: vec![metric(8.7, "Secondary")],
            cvss_metric_v31: vec![metric(9.8, "Primary")],
            ..Default::default()
        };
        let record = expect_record(normalize(raw(Some("CVE-2024-2"), Some(metrics))));
        assert_eq!(record.base_score, 8.7);
        assert_eq!(record.cvss_version, Some(CvssVersion::V40));
    }

    #[test]
    fn test_primary_source_preferred_within_block() {
        let metrics = RawMetrics {
            cvss_metric_v31: vec![metric(5.3, "Secondary"), metric(6.1, "Primary")],
            ..Default::default()
        };
        let record = expect_record(normalize(raw(Some("CVE-2024-3"), Some(metrics))));
        assert_eq!(record.base_score, 6.1);
    }

    #[test]
    fn test_out_of_range_score_falls_through() {
        let metrics = RawMetrics {
            cvss_metric_v31: vec![metric(42.0, "Primary")],
            cvss_metric_v30: vec![metric(4.4, "Primary")],
            ..Default::default()
        };
        let record = expect_record(normalize(raw(Some("CVE-2024-4"), Some(metrics))));
        assert_eq!(record.base_score, 4.4);
        assert_eq!(record.cvss_version, Some(CvssVersion::V30));
    }

    #[test]
    fn test_no_metrics_scores_zero() {
        let record = expect_record(normalize(raw(Some("CVE-2024-5"), None)));
        assert_eq!(record.base_score, 0.0);
        assert!(!record.is_scored());
    }

    #[test]
    fn test_missing_id_is_skipped() {
        let normalized = normalize(raw(None, None));
        assert_eq!(
            normalized,
            Normalized::Skipped(SkipSignal {
                id: None,
                reason: SkipReason::MissingId
            })
        );
        assert!(matches!(
            normalize(raw(Some("   "), None)),
            Normalized::Skipped(SkipSignal { reason: SkipReason::MissingId, .. })
        ));
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let normalized = normalize(RawRecord::malformed(
            "undecodable `cve` object: invalid type",
            Some("CVE-2024-9".into()),
        ));
        match normalized {
            Normalized::Skipped(SkipSignal {
                id,
                reason: SkipReason::Malformed(detail),
            }) => {
                assert_eq!(id.as_deref(), Some("CVE-2024-9"));
                assert!(detail.contains("invalid type"));
            }
            other => panic!("expected malformed skip, got {:?}", other),
        }
    }

    #[test]
    fn test_metrics_kept_in_attributes() {
        let mut scored = metric(7.5, "Primary");
        scored.cvss_data.vector_string = Some("CVSS:3.1/AV:N/AC:L".into());
        let metrics = RawMetrics {
            cvss_metric_v31: vec![scored],
            ..Default::default()
        };
        let record = expect_record(normalize(raw(Some("CVE-2024-10"), Some(metrics))));
        let block = &record.attributes["metrics"]["cvssMetricV31"][0];
        assert_eq!(block["cvssData"]["vectorString"], "CVSS:3.1/AV:N/AC:L");
        assert_eq!(block["cvssData"]["baseScore"], 7.5);

        let unscored = expect_record(normalize(raw(Some("CVE-2024-11"), None)));
        assert!(!unscored.attributes.contains_key("metrics"));
    }

    #[test]
    fn test_missing_last_modified_is_skipped() {
        let mut input = raw(Some("CVE-2024-6"), None);
        input.cve.last_modified = None;
        assert!(matches!(
            normalize(input),
            Normalized::Skipped(SkipSignal { reason: SkipReason::MissingLastModified, .. })
        ));
    }

    #[test]
    fn test_missing_published_falls_back() {
        let mut input = raw(Some("CVE-2024-7"), None);
        input.cve.published = None;
        let record = expect_record(normalize(input));
        assert_eq!(record.published, record.last_modified);
    }

    #[test]
    fn test_attributes_pass_through() {
        let mut input = raw(Some("CVE-2024-8"), None);
        input
            .cve
            .extra
            .insert("descriptions".into(), json!([{"lang": "en", "value": "overflow"}]));
        let record = expect_record(normalize(input));
        assert_eq!(record.attributes["descriptions"][0]["value"], "overflow");
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();
        assert_eq!(parse_feed_timestamp("2024-02-03T04:05:06"), Some(expected));
        assert_eq!(parse_feed_timestamp("2024-02-03T04:05:06Z"), Some(expected));
        assert_eq!(parse_feed_timestamp("2024-02-03T06:05:06+02:00"), Some(expected));
        assert!(parse_feed_timestamp("2024-02-03T04:05:06.789").is_some());
        assert_eq!(
            parse_feed_timestamp("2024-02-03"),
            Some(Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_feed_timestamp("yesterday"), None);
    }
}
