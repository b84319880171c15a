//! Dune Analytics client
//!
//! Read-only boundary to the external analytical query service. The
//! refresher only ever fetches the latest stored result for a fixed query
//! identifier; it never triggers executions. The call is treated as slow
//! and failure-prone: any HTTP error, malformed payload, or empty result
//! set aborts the run before anything is promoted.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::DuneConfig;
use crate::error::{RefreshError, RefreshResult};

/// The latest tabular result of an analytics query
#[derive(Debug, Clone)]
pub struct FetchedTable {
    /// Column names in service-reported order
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl FetchedTable {
    fn from_envelope(query_id: u64, envelope: ResultsEnvelope) -> RefreshResult<Self> {
        if envelope.result.rows.is_empty() {
            // Never silently publish zero rows over previously-populated data.
            return Err(RefreshError::ExternalFetch(format!(
                "query {} returned an empty result set",
                query_id
            )));
        }
        Ok(Self {
            columns: envelope.result.metadata.column_names,
            rows: envelope.result.rows,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope {
    result: ResultsBody,
}

#[derive(Debug, Deserialize)]
struct ResultsBody {
    rows: Vec<Map<String, Value>>,
    metadata: ResultsMetadata,
}

#[derive(Debug, Deserialize)]
struct ResultsMetadata {
    column_names: Vec<String>,
}

/// HTTP client for the Dune results API
pub struct DuneClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl DuneClient {
    pub fn new(config: &DuneConfig) -> RefreshResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                RefreshError::ExternalFetch(format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the latest stored result set for a query.
    pub async fn latest_result(&self, query_id: u64) -> RefreshResult<FetchedTable> {
        let url = format!("{}/api/v1/query/{}/results", self.base_url, query_id);
        info!(query_id, "fetching latest results from Dune");

        let response = self
            .http
            .get(&url)
            .header("X-Dune-API-Key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::ExternalFetch(format!(
                "query {} returned HTTP {}",
                query_id, status
            )));
        }

        let envelope: ResultsEnvelope = response.json().await?;
        let table = FetchedTable::from_envelope(query_id, envelope)?;
        info!(
            query_id,
            rows = table.rows.len(),
            "retrieved analytics query results"
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn envelope(json: &str) -> ResultsEnvelope {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_envelope_deserialization() {
        let envelope = envelope(
            r#"{
                "result": {
                    "rows": [
                        {"tx_timestamp": "2024-10-01 12:00:00", "gmv": 150.5, "role": "grantee"}
                    ],
                    "metadata": {"column_names": ["tx_timestamp", "gmv", "role"]}
                }
            }"#,
        );
        let table = FetchedTable::from_envelope(4_118_421, envelope).unwrap();
        assert_eq!(table.columns, vec!["tx_timestamp", "gmv", "role"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0]["role"], Value::String("grantee".to_string()));
    }

    #[test]
    fn test_empty_result_set_is_fatal() {
        let envelope = envelope(
            r#"{"result": {"rows": [], "metadata": {"column_names": ["a"]}}}"#,
        );
        let err = FetchedTable::from_envelope(4_118_421, envelope).unwrap_err();
        assert!(matches!(err, RefreshError::ExternalFetch(_)));
    }
}
