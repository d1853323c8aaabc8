//! Turns aggregated runs into idempotent scripted bulk actions and executes
//! them against the search index's `_bulk` endpoint.
//!
//! One action per run: adds append to a list-valued field, removes delete by
//! value and drop the field/document when nothing is left. Both scripts are
//! reproduced verbatim (including their two-space idiosyncratic indentation)
//! from the system they replace — Painless scripts are not Rust code this
//! crate can format, just text it must not disturb.

use async_trait::async_trait;
use cdx_aggregate::{AggregateEntry, AggregateRun};
use cdx_config::credentials::ResolvedCredentials;
use cdx_config::HandlerAdditionalParams;
use cdx_schemas::{ChangeRecord, DocumentType, Op, SearchDocument};
use cdx_transform::{mapping::MappingRegistry, ProjectedField, Transformer};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

pub const INDEX_NAME: &str = "amazon_neptune";
const ES_BULK_QUERY_SIZE: usize = 2000;
const INTERNAL_RETRY_LIMIT: u32 = 3;
const OUTER_RETRY_LIMIT: u32 = 5;

pub const ADD_FIELD_SCRIPT: &str = r#"void add(def object, def key, def value){
                         if (object[key] != null) {
                            if(!object[key].contains(value)) {
                                object[key].add(value)
                            }
                         }else {
                            object[key] = [value]
                         }
                      }
                      for (predicate in params.predicates){
                          if (predicate["key"]=="entity_type"){
                              add(ctx._source, predicate["key"], predicate["value"])
                          }
                          else {
                              if (ctx._source["predicates"] == null){
                                 ctx._source["predicates"] = new HashMap()
                              }
                              add(ctx._source.predicates, predicate["key"], predicate["value"])
                          }
                      }"#;

pub const DROP_FIELD_SCRIPT: &str = r#"void remove(def object, def key, def value){
                         if (object[key] != null) {
                             object[key].removeIf(x -> x.equals(value));
                             if (object[key].length == 0){
                                object.remove(key)
                             }
                         }
                       }
                       for (predicate in params.predicates){
                           if (predicate["key"]=="entity_type"){
                               remove(ctx._source, predicate["key"], predicate["value"])
                           }
                           else if(ctx._source["predicates"] != null){
                               remove(ctx._source.predicates, predicate["key"], predicate["value"])
                           }
                       }
                       if (ctx._source["predicates"] != null && ctx._source.predicates.size() == 0){
                           ctx._source.remove("predicates")
                       }
                       if(ctx._source.size() == 2){
                           ctx.op = "delete"
                       }else{
                           ctx.op = "index"
                       }"#;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScriptParam {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum BulkAction {
    Update {
        document_id: String,
        script_source: &'static str,
        params: Vec<ScriptParam>,
        upsert: Option<SearchDocument>,
    },
}

impl BulkAction {
    /// Render the two-line (action metadata + body) NDJSON fragment the
    /// `_bulk` API expects for this action.
    pub fn to_ndjson_lines(&self) -> anyhow::Result<(String, String)> {
        match self {
            BulkAction::Update { document_id, script_source, params, upsert } => {
                let meta = serde_json::json!({
                    "update": { "_index": INDEX_NAME, "_id": document_id }
                });
                let mut body = serde_json::json!({
                    "script": {
                        "source": script_source,
                        "lang": "painless",
                        "params": { "predicates": params },
                    }
                });
                if let Some(doc) = upsert {
                    body["upsert"] = serde_json::to_value(doc)?;
                }
                Ok((serde_json::to_string(&meta)?, serde_json::to_string(&body)?))
            }
        }
    }
}

/// Re-derive a record's field key/value through `transformer`. The registry
/// is expected to already be populated from the upstream filtering pass, so
/// this is a cheap lookup, not a fresh validation.
fn project(
    record: &ChangeRecord,
    transformer: &dyn Transformer,
    registry: &mut MappingRegistry,
    params_cfg: &HandlerAdditionalParams,
) -> Option<ProjectedField> {
    transformer.filter_and_project(record, registry, params_cfg)
}

fn document_id_for_run(
    run: &AggregateRun,
    transformer: &dyn Transformer,
    registry: &mut MappingRegistry,
    params_cfg: &HandlerAdditionalParams,
) -> Option<(String, DocumentType)> {
    let first = run.records.first()?;
    let field = project(first, transformer, registry, params_cfg)?;
    Some((entity_document_id(&field), field.document_type))
}

fn entity_document_id(field: &ProjectedField) -> String {
    match field.document_type {
        DocumentType::RdfResource => cdx_transform::rdf_document_id(&field.entity_id),
        DocumentType::Vertex => cdx_schemas::document_id(cdx_schemas::VERTEX_ID_PREFIX, &field.entity_id),
        DocumentType::Edge => cdx_schemas::document_id(cdx_schemas::EDGE_ID_PREFIX, &field.entity_id),
    }
}

/// Convert one aggregate entry's runs into bulk actions, one action per run
/// with an upsert document attached to add-runs (fresh documents only ever
/// get created by an add). A run's record count is already bounded by
/// `cdx_aggregate::AGGREGATE_QUERY_SIZE`, so no further splitting is needed
/// here — pagination of the resulting action list into `_bulk` requests of
/// at most [`ES_BULK_QUERY_SIZE`] happens in [`HttpBulkSink::execute`].
pub fn build_bulk_actions(
    entries: &[AggregateEntry],
    transformer: &dyn Transformer,
    registry: &mut MappingRegistry,
    params_cfg: &HandlerAdditionalParams,
) -> Vec<BulkAction> {
    let mut actions = Vec::new();

    for entry in entries {
        for run in &entry.runs {
            let Some((document_id, document_type)) = document_id_for_run(run, transformer, registry, params_cfg) else {
                continue;
            };
            let is_add = run.operation.starts_with("ADD");
            let script_source = if is_add { ADD_FIELD_SCRIPT } else { DROP_FIELD_SCRIPT };

            let params: Vec<ScriptParam> = run
                .records
                .iter()
                .filter_map(|r| project(r, transformer, registry, params_cfg))
                .map(|field| ScriptParam {
                    key: transformer.field_key(&field),
                    value: transformer.field_value(&field),
                })
                .collect();
            if params.is_empty() {
                continue;
            }
            let upsert = if is_add { Some(SearchDocument::new(document_id.clone(), document_type)) } else { None };
            actions.push(BulkAction::Update { document_id, script_source, params, upsert });
        }
    }

    actions
}

#[derive(Debug)]
pub enum BulkError {
    Transport(String),
    Http { status: u16, body: String },
    DocumentsFailed(Vec<String>),
}

impl fmt::Display for BulkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkError::Transport(msg) => write!(f, "bulk transport error: {msg}"),
            BulkError::Http { status, body } => write!(f, "bulk request failed with status {status}: {body}"),
            BulkError::DocumentsFailed(ids) => write!(f, "{} document(s) failed to index: {}", ids.len(), ids.join(", ")),
        }
    }
}

impl std::error::Error for BulkError {}

#[derive(Debug, Default, Clone, Copy)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub ignored_missing_document: usize,
}

#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn execute(&self, actions: &[BulkAction], ignore_missing_document: bool) -> Result<BulkOutcome, BulkError>;
}

#[derive(Debug, Deserialize)]
struct WireBulkItemError {
    #[serde(default)]
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct WireBulkItemResult {
    status: u16,
    #[serde(default)]
    error: Option<WireBulkItemError>,
}

#[derive(Debug, Deserialize)]
struct WireBulkItem {
    update: Option<WireBulkItemResult>,
}

#[derive(Debug, Deserialize)]
struct WireBulkResponse {
    errors: bool,
    items: Vec<WireBulkItem>,
}

fn is_missing_document_error(item: &WireBulkItem) -> bool {
    item.update
        .as_ref()
        .map(|u| u.status == 404 && u.error.as_ref().map(|e| e.r#type == "document_missing_exception").unwrap_or(false))
        .unwrap_or(false)
}

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

fn signature_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Minimal generic SigV4 signer for the search service's `_bulk` endpoint.
/// Unlike `cdx-signer` (scoped to the four fixed Neptune query endpoints),
/// this signs an arbitrary path + body pair against the `es` service.
fn sign_bulk_request(
    host: &str,
    path: &str,
    body: &str,
    region: &str,
    creds: &ResolvedCredentials,
    now: chrono::DateTime<chrono::Utc>,
) -> (String, String, String) {
    const SERVICE: &str = "es";
    const SIGNED_HEADERS: &str = "content-type;host;x-amz-date";

    let amzdate = now.format("%Y%m%dT%H%M%SZ").to_string();
    let datestamp = now.format("%Y%m%d").to_string();

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let payload_hash = hex::encode(hasher.finalize());

    let canonical_headers = format!("content-type:application/x-ndjson\nhost:{host}\nx-amz-date:{amzdate}\n");
    let canonical_request =
        format!("POST\n{path}\n\n{canonical_headers}\n{SIGNED_HEADERS}\n{payload_hash}");

    let credential_scope = format!("{datestamp}/{region}/{SERVICE}/aws4_request");
    let mut hasher = Sha256::new();
    hasher.update(canonical_request.as_bytes());
    let hashed_canonical_request = hex::encode(hasher.finalize());
    let string_to_sign = format!("AWS4-HMAC-SHA256\n{amzdate}\n{credential_scope}\n{hashed_canonical_request}");

    let signing_key = signature_key(&creds.secret_key, &datestamp, region, SERVICE);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        creds.access_key,
    );

    (amzdate, authorization, creds.session_token.clone())
}

pub struct HttpBulkSink {
    client: reqwest::Client,
    endpoint: String,
    region: String,
    credentials: ResolvedCredentials,
}

impl HttpBulkSink {
    pub fn new(endpoint: String, region: String, credentials: ResolvedCredentials) -> Self {
        Self { client: reqwest::Client::new(), endpoint, region, credentials }
    }

    fn request_body(&self, actions: &[BulkAction]) -> anyhow::Result<String> {
        let mut body = String::new();
        for action in actions {
            let (meta, doc) = action.to_ndjson_lines()?;
            body.push_str(&meta);
            body.push('\n');
            body.push_str(&doc);
            body.push('\n');
        }
        Ok(body)
    }

    async fn post_once(&self, body: &str) -> Result<WireBulkResponse, BulkError> {
        let url = format!("{}/_bulk", self.endpoint.trim_end_matches('/'));
        let parsed = reqwest::Url::parse(&url).map_err(|e| BulkError::Transport(e.to_string()))?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let now = chrono::Utc::now();
        let (amzdate, authorization, token) = sign_bulk_request(&host, "/_bulk", body, &self.region, &self.credentials, now);

        let mut request = self
            .client
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .header("x-amz-date", amzdate)
            .header("authorization", authorization)
            .body(body.to_string());
        if !token.is_empty() {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.send().await.map_err(|e| BulkError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| BulkError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(BulkError::Http { status: status.as_u16(), body: text });
        }
        serde_json::from_str(&text).map_err(|e| BulkError::Transport(format!("decode bulk response: {e}")))
    }

    /// Send `actions` (already at most [`ES_BULK_QUERY_SIZE`] long — callers
    /// chunk before calling this) and resolve any resulting failures.
    ///
    /// A first attempt treats every failure as fatal. If `ignore_missing_document`
    /// is set and every failure is a 404 `document_missing_exception`, the
    /// still-failing subset is re-sent on its own, up to
    /// [`INTERNAL_RETRY_LIMIT`] additional attempts, mirroring the original's
    /// `max_retries=3` bulk-helper parameter. A non-missing failure at any
    /// point aborts immediately; a subset still failing after the retry
    /// budget is exhausted is swallowed as ignored, since every surviving
    /// failure has been confirmed to be a missing-document case.
    async fn execute_with_retries(&self, actions: &[BulkAction], ignore_missing_document: bool) -> Result<BulkOutcome, BulkError> {
        let mut pending: Vec<BulkAction> = actions.to_vec();
        let mut ignored_missing_document = 0usize;

        for attempt in 0..=INTERNAL_RETRY_LIMIT {
            if pending.is_empty() {
                break;
            }

            let body = self.request_body(&pending).map_err(|e| BulkError::Transport(e.to_string()))?;
            let response = self.post_once(&body).await?;

            if !response.errors {
                pending.clear();
                break;
            }

            let failed: Vec<usize> = response
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.update.as_ref().map(|u| u.status >= 300).unwrap_or(false))
                .map(|(idx, _)| idx)
                .collect();

            let all_missing =
                ignore_missing_document && !failed.is_empty() && failed.iter().all(|&idx| is_missing_document_error(&response.items[idx]));

            if !all_missing {
                return Err(BulkError::DocumentsFailed(vec![format!("{} document(s) failed", failed.len())]));
            }

            if attempt == INTERNAL_RETRY_LIMIT {
                ignored_missing_document += failed.len();
                pending.clear();
                break;
            }

            pending = failed.into_iter().map(|idx| pending[idx].clone()).collect();
        }

        Ok(BulkOutcome { succeeded: actions.len() - ignored_missing_document, ignored_missing_document })
    }

    async fn execute_chunk_with_backoff(&self, chunk: &[BulkAction], ignore_missing_document: bool) -> Result<BulkOutcome, BulkError> {
        let mut last_err = None;
        for attempt in 0..OUTER_RETRY_LIMIT {
            match self.execute_with_retries(chunk, ignore_missing_document).await {
                Ok(outcome) => return Ok(outcome),
                Err(err @ BulkError::Http { status, .. }) if status >= 500 => {
                    last_err = Some(err);
                }
                Err(BulkError::Transport(msg)) => {
                    last_err = Some(BulkError::Transport(msg));
                }
                Err(other) => return Err(other),
            }
            if attempt + 1 < OUTER_RETRY_LIMIT {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }
        Err(last_err.unwrap_or(BulkError::Transport("exhausted retries".to_string())))
    }
}

#[async_trait]
impl BulkSink for HttpBulkSink {
    /// Paginate `actions` into `_bulk` requests of at most [`ES_BULK_QUERY_SIZE`]
    /// actions each, accumulating the outcome across chunks. A chunk failure
    /// aborts the whole call — the cycle is retried wholesale on the next poll.
    async fn execute(&self, actions: &[BulkAction], ignore_missing_document: bool) -> Result<BulkOutcome, BulkError> {
        let mut total = BulkOutcome::default();
        for chunk in actions.chunks(ES_BULK_QUERY_SIZE) {
            let outcome = self.execute_chunk_with_backoff(chunk, ignore_missing_document).await?;
            total.succeeded += outcome.succeeded;
            total.ignored_missing_document += outcome.ignored_missing_document;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdx_config::HandlerAdditionalParams;
    use cdx_schemas::{EventId, GraphElementType, PropertyGraphPayload, RecordData, TypedValue};
    use cdx_transform::PropertyGraphTransformer;

    fn add_record(id: &str, key: &str, value: &str) -> ChangeRecord {
        ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::PropertyGraph(PropertyGraphPayload {
                id: id.to_string(),
                r#type: GraphElementType::Vp,
                key: key.to_string(),
                value: Some(TypedValue { value: serde_json::json!(value), data_type: "string".to_string() }),
                from: None,
                to: None,
            }),
            commit_timestamp_millis: 0,
        }
    }

    #[test]
    fn add_run_produces_update_action_with_upsert() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let params = HandlerAdditionalParams::default();
        let records = vec![add_record("v1", "name", "Ada")];
        let entries = cdx_aggregate::aggregate_records(&records, cdx_aggregate::AggregationMode::Optimized);

        let actions = build_bulk_actions(&entries, &transformer, &mut registry, &params);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            BulkAction::Update { script_source, upsert, params, .. } => {
                assert_eq!(*script_source, ADD_FIELD_SCRIPT);
                assert!(upsert.is_some());
                assert_eq!(params.len(), 1);
                assert_eq!(params[0].key, "name");
            }
        }
    }

    #[test]
    fn remove_run_uses_drop_script_without_upsert() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let params = HandlerAdditionalParams::default();
        let mut record = add_record("v1", "name", "Ada");
        record.op = Op::Remove;
        let entries = cdx_aggregate::aggregate_records(&[record], cdx_aggregate::AggregationMode::Optimized);

        let actions = build_bulk_actions(&entries, &transformer, &mut registry, &params);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            BulkAction::Update { script_source, upsert, .. } => {
                assert_eq!(*script_source, DROP_FIELD_SCRIPT);
                assert!(upsert.is_none());
            }
        }
    }

    #[test]
    fn missing_document_error_is_detected_by_status_and_type() {
        let item = WireBulkItem {
            update: Some(WireBulkItemResult {
                status: 404,
                error: Some(WireBulkItemError { r#type: "document_missing_exception".to_string() }),
            }),
        };
        assert!(is_missing_document_error(&item));
    }

    #[test]
    fn scripts_are_reproduced_verbatim() {
        assert!(ADD_FIELD_SCRIPT.contains("void add(def object, def key, def value)"));
        assert!(DROP_FIELD_SCRIPT.contains("ctx.op = \"delete\""));
    }

    #[test]
    fn missing_document_error_requires_both_status_and_type() {
        let wrong_type = WireBulkItem {
            update: Some(WireBulkItemResult { status: 404, error: Some(WireBulkItemError { r#type: "mapper_parsing_exception".to_string() }) }),
        };
        assert!(!is_missing_document_error(&wrong_type));

        let wrong_status = WireBulkItem {
            update: Some(WireBulkItemResult { status: 409, error: Some(WireBulkItemError { r#type: "document_missing_exception".to_string() }) }),
        };
        assert!(!is_missing_document_error(&wrong_status));
    }

    #[test]
    fn a_request_paginates_more_than_es_bulk_query_size_actions_into_multiple_chunks() {
        let action = |n: usize| BulkAction::Update {
            document_id: format!("doc-{n}"),
            script_source: ADD_FIELD_SCRIPT,
            params: vec![],
            upsert: None,
        };
        let actions: Vec<BulkAction> = (0..ES_BULK_QUERY_SIZE + 1).map(action).collect();
        let chunks: Vec<&[BulkAction]> = actions.chunks(ES_BULK_QUERY_SIZE).collect();

        assert_eq!(chunks.len(), 2, "one chunk over the limit must spill into a second request");
        assert_eq!(chunks[0].len(), ES_BULK_QUERY_SIZE);
        assert_eq!(chunks[1].len(), 1);
    }
}
