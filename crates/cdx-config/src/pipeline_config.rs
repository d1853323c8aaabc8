//! The pipeline's enumerated configuration surface.
//!
//! Mirrors the env-var-backed configuration contract of the system this
//! pipeline replaces, but expressed as a typed, validated Rust struct rather
//! than ad-hoc `env::var` calls scattered through the codebase.

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLanguage {
    PropertyGraph,
    Rdf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationScope {
    /// Replicate both vertices and edges.
    All,
    /// Drop edge records entirely (`ReplicationScope=nodes`).
    NodesOnly,
}

#[derive(Debug, Clone)]
pub struct HandlerAdditionalParams {
    pub search_endpoint: String,
    pub number_of_shards: i64,
    pub number_of_replica: i64,
    pub geo_location_fields: Vec<String>,
    pub datatypes_to_exclude: Vec<String>,
    pub properties_to_exclude: Vec<String>,
    pub ignore_missing_document: bool,
    pub replication_scope: ReplicationScope,
    pub enable_non_string_indexing: bool,
}

impl Default for HandlerAdditionalParams {
    fn default() -> Self {
        Self {
            search_endpoint: String::new(),
            number_of_shards: 5,
            number_of_replica: 1,
            geo_location_fields: Vec::new(),
            datatypes_to_exclude: Vec::new(),
            properties_to_exclude: Vec::new(),
            ignore_missing_document: true,
            replication_scope: ReplicationScope::All,
            enable_non_string_indexing: true,
        }
    }
}

impl HandlerAdditionalParams {
    /// Parse from the JSON object carried in `HANDLER_ADDITIONAL_PARAMS`
    /// (env var `AdditionalParams`). Missing keys take the documented default.
    pub fn from_json(v: &Value) -> Self {
        let mut out = Self::default();
        let Some(obj) = v.as_object() else {
            return out;
        };

        if let Some(s) = obj.get("ElasticSearchEndpoint").and_then(Value::as_str) {
            out.search_endpoint = s.to_string();
        }
        if let Some(n) = obj.get("NumberOfShards").and_then(Value::as_i64) {
            out.number_of_shards = n;
        }
        if let Some(n) = obj.get("NumberOfReplica").and_then(Value::as_i64) {
            out.number_of_replica = n;
        }
        if let Some(s) = obj.get("GeoLocationFields").and_then(Value::as_str) {
            out.geo_location_fields = split_comma_list(s);
        }
        if let Some(s) = obj.get("DatatypesToExclude").and_then(Value::as_str) {
            out.datatypes_to_exclude = split_comma_list(s);
        }
        if let Some(s) = obj.get("PropertiesToExclude").and_then(Value::as_str) {
            out.properties_to_exclude = split_comma_list(s);
        }
        if let Some(b) = obj.get("IgnoreMissingDocument").and_then(Value::as_bool) {
            out.ignore_missing_document = b;
        }
        if let Some(s) = obj.get("ReplicationScope").and_then(Value::as_str) {
            out.replication_scope = if s.eq_ignore_ascii_case("nodes") {
                ReplicationScope::NodesOnly
            } else {
                ReplicationScope::All
            };
        }
        if let Some(b) = obj.get("EnableNonStringIndexing").and_then(Value::as_bool) {
            out.enable_non_string_indexing = b;
        }

        out
    }
}

fn split_comma_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub region: String,
    pub application_name: String,
    pub lease_table_name: String,
    pub stream_endpoint: String,
    pub iam_auth_enabled: bool,
    pub stream_records_batch_size: i64,
    pub max_polling_wait_time_secs: i64,
    pub max_polling_interval_secs: i64,
    pub handler_name: String,
    pub handler_additional_params: HandlerAdditionalParams,
}

/// Raised when a required configuration value is missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub missing_key: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "missing or malformed required configuration value: {}",
            self.missing_key
        )
    }
}

impl std::error::Error for ConfigError {}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError {
            missing_key: name.to_string(),
        }),
    }
}

fn parse_required_i64(name: &'static str) -> Result<i64, ConfigError> {
    required(name)?
        .parse::<i64>()
        .map_err(|_| ConfigError {
            missing_key: name.to_string(),
        })
}

impl PipelineConfig {
    /// Load configuration from environment variables. All the below
    /// variables are mandatory to run the process except where a default is
    /// noted.
    pub fn from_env() -> Result<Self, ConfigError> {
        let region = required("AWS_REGION")?;
        let application_name = required("Application")?;
        let lease_table_name = required("LeaseTable")?;
        let stream_endpoint = required("NeptuneStreamEndpoint")?;
        let handler_name = required("StreamRecordsHandler")?;
        let stream_records_batch_size = parse_required_i64("StreamRecordsBatchSize")?;

        let max_polling_wait_time_secs = std::env::var("MaxPollingWaitTime")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let max_polling_interval_secs = std::env::var("MaxPollingInterval")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);
        let iam_auth_enabled = std::env::var("IAMAuthEnabledOnSourceStream")
            .map(|v| v != "false")
            .unwrap_or(false);

        let handler_additional_params = match std::env::var("AdditionalParams") {
            Ok(raw) if !raw.trim().is_empty() => {
                let v: Value = serde_json::from_str(&raw).map_err(|_| ConfigError {
                    missing_key: "AdditionalParams".to_string(),
                })?;
                HandlerAdditionalParams::from_json(&v)
            }
            _ => HandlerAdditionalParams::default(),
        };

        Ok(Self {
            region,
            application_name,
            lease_table_name,
            stream_endpoint,
            iam_auth_enabled,
            stream_records_batch_size,
            max_polling_wait_time_secs,
            max_polling_interval_secs,
            handler_name,
            handler_additional_params,
        })
    }

    /// Query language is derived from a substring match on the stream
    /// endpoint: `gremlin` implies property-graph, `sparql` implies RDF.
    pub fn query_language(&self) -> Result<QueryLanguage, ConfigError> {
        let lower = self.stream_endpoint.to_ascii_lowercase();
        if lower.contains("gremlin") {
            Ok(QueryLanguage::PropertyGraph)
        } else if lower.contains("sparql") {
            Ok(QueryLanguage::Rdf)
        } else {
            Err(ConfigError {
                missing_key: "streamEndpoint (must contain 'gremlin' or 'sparql')".to_string(),
            })
        }
    }

    pub fn max_polling_interval_millis(&self) -> i64 {
        self.max_polling_interval_secs * 1000
    }

    pub fn max_polling_wait_time_millis(&self) -> i64 {
        self.max_polling_wait_time_secs * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additional_params_defaults_when_object_empty() {
        let v = serde_json::json!({});
        let p = HandlerAdditionalParams::from_json(&v);
        assert_eq!(p.number_of_shards, 5);
        assert_eq!(p.number_of_replica, 1);
        assert!(p.ignore_missing_document);
        assert!(matches!(p.replication_scope, ReplicationScope::All));
    }

    #[test]
    fn additional_params_parses_nodes_only_scope() {
        let v = serde_json::json!({ "ReplicationScope": "nodes" });
        let p = HandlerAdditionalParams::from_json(&v);
        assert!(matches!(p.replication_scope, ReplicationScope::NodesOnly));
    }

    #[test]
    fn additional_params_splits_comma_lists() {
        let v = serde_json::json!({ "DatatypesToExclude": "geo_point, decimal ,, long" });
        let p = HandlerAdditionalParams::from_json(&v);
        assert_eq!(p.datatypes_to_exclude, vec!["geo_point", "decimal", "long"]);
    }

    #[test]
    fn query_language_detected_from_endpoint_substring() {
        let mut cfg = sample_config();
        cfg.stream_endpoint = "https://db.example.com:8182/gremlin/stream".to_string();
        assert_eq!(cfg.query_language().unwrap(), QueryLanguage::PropertyGraph);

        cfg.stream_endpoint = "https://db.example.com:8182/sparql/stream".to_string();
        assert_eq!(cfg.query_language().unwrap(), QueryLanguage::Rdf);
    }

    fn sample_config() -> PipelineConfig {
        PipelineConfig {
            region: "us-east-1".to_string(),
            application_name: "app".to_string(),
            lease_table_name: "lease".to_string(),
            stream_endpoint: String::new(),
            iam_auth_enabled: false,
            stream_records_batch_size: 100,
            max_polling_wait_time_secs: 10,
            max_polling_interval_secs: 600,
            handler_name: "gremlin".to_string(),
            handler_additional_params: HandlerAdditionalParams::default(),
        }
    }
}
