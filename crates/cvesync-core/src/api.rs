//! Handlers behind the two service endpoints
//!
//! - `GET /update-cve-data/` → [`update_cve_data`]
//! - `GET /filter-cve-data/?cveId=&baseScore=&minBaseScore=&lastModifiedDays=` → [`filter_cve_data`]
//!
//! Handlers return an [`ApiResponse`] (status code plus JSON body) and leave
//! routing and serving to whatever HTTP server embeds them.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::engine::SyncScheduler;
use crate::error::Error;
use crate::traits::{RecordFilter, RecordStore, ScoreMatch};

/// Status code and JSON body of a handler response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status_code: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    fn error(status_code: u16, message: String) -> Self {
        Self {
            status_code,
            body: json!({ "status": "error", "message": message }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Query parameters of the filter endpoint
///
/// Every field is optional; an absent field imposes no constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterParams {
    /// `cveId`: exact id
    pub cve_id: Option<String>,
    /// `baseScore`: exact score
    pub base_score: Option<f64>,
    /// `minBaseScore`: score threshold
    pub min_base_score: Option<f64>,
    /// `lastModifiedDays`: modified within the last N days
    pub last_modified_days: Option<u32>,
}

impl FilterParams {
    /// Parse query pairs
    ///
    /// Unknown keys and empty values are ignored. The last occurrence of a
    /// repeated key wins.
    ///
    /// # Returns
    ///
    /// - `Ok(FilterParams)`: Parsed parameters
    /// - `Err(Error::InvalidInput)`: A value is malformed or out of range
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Self::default();

        for (key, value) in pairs {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "cveId" => params.cve_id = Some(value.to_string()),
                "baseScore" => params.base_score = Some(parse_score("baseScore", value)?),
                "minBaseScore" => params.min_base_score = Some(parse_score("minBaseScore", value)?),
                "lastModifiedDays" => {
                    params.last_modified_days = Some(value.parse().map_err(|_| {
                        Error::invalid_input(format!(
                            "lastModifiedDays must be a non-negative integer (got '{}')",
                            value
                        ))
                    })?);
                }
                _ => {}
            }
        }

        if params.base_score.is_some() && params.min_base_score.is_some() {
            return Err(Error::invalid_input(
                "baseScore and minBaseScore cannot be combined",
            ));
        }

        Ok(params)
    }

    /// Translate into a store filter evaluated at `now`
    pub fn to_filter(&self, now: DateTime<Utc>) -> RecordFilter {
        let mut filter = RecordFilter::new();
        if let Some(id) = &self.cve_id {
            filter = filter.with_id(id.clone());
        }
        if let Some(score) = self.base_score {
            filter = filter.with_base_score(ScoreMatch::Exact(score));
        } else if let Some(threshold) = self.min_base_score {
            filter = filter.with_base_score(ScoreMatch::AtLeast(threshold));
        }
        if let Some(days) = self.last_modified_days {
            filter = filter.modified_within_days(days, now);
        }
        filter
    }
}

fn parse_score(name: &str, value: &str) -> Result<f64, Error> {
    match value.parse::<f64>() {
        Ok(score) if score.is_finite() && (0.0..=10.0).contains(&score) => Ok(score),
        _ => Err(Error::invalid_input(format!(
            "{} must be a number between 0.0 and 10.0 (got '{}')",
            name, value
        ))),
    }
}

/// `GET /update-cve-data/`
///
/// Runs a manual sync to completion. Overlapping a running sync yields 409
/// without starting anything.
pub async fn update_cve_data(scheduler: &SyncScheduler) -> ApiResponse {
    match scheduler.trigger().await {
        Ok(report) => {
            info!(
                "Manual sync finished: {} records processed",
                report.records_processed
            );
            ApiResponse::ok(json!({
                "status": "success",
                "message": "CVE data updated successfully."
            }))
        }
        Err(e) => {
            error!("Error updating CVE data: {}", e);
            let status_code = match e {
                Error::SyncInProgress => 409,
                _ => 500,
            };
            ApiResponse::error(status_code, format!("Error updating CVE data: {}", e))
        }
    }
}

/// `GET /filter-cve-data/` with already-parsed parameters
///
/// Responds with a JSON array of records ordered by id.
pub async fn filter_cve_data(store: &dyn RecordStore, params: &FilterParams) -> ApiResponse {
    let filter = params.to_filter(Utc::now());

    let records = match store.query(&filter).await {
        Ok(records) => records,
        Err(e) => {
            error!("Error filtering CVE data: {}", e);
            return ApiResponse::error(500, format!("Error filtering CVE data: {}", e));
        }
    };

    match serde_json::to_value(&records) {
        Ok(body) => ApiResponse::ok(body),
        Err(e) => {
            error!("Error filtering CVE data: {}", e);
            ApiResponse::error(500, format!("Error filtering CVE data: {}", e))
        }
    }
}

/// `GET /filter-cve-data/` from raw query pairs; malformed parameters yield 400
pub async fn filter_cve_data_from_query<I, K, V>(store: &dyn RecordStore, pairs: I) -> ApiResponse
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    match FilterParams::from_pairs(pairs) {
        Ok(params) => filter_cve_data(store, &params).await,
        Err(e) => ApiResponse::error(400, format!("Error filtering CVE data: {}", e)),
    }
}
