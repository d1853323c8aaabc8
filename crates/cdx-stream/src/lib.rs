//! Change-record stream reader: signed HTTP GET against the source stream
//! endpoint, JSON decode, and gap detection.

use async_trait::async_trait;
use cdx_config::credentials::CredentialSource;
use cdx_config::PipelineConfig;
use cdx_schemas::{
    ChangeRecord, EventId, GraphElementType, Op, PropertyGraphPayload, RdfObject, RdfQuad, RecordData, TypedValue,
};
use cdx_signer::{get_signed_header, HttpMethod};
use std::fmt;

/// Iterator position for the very first read against a lease, mirroring
/// `TRIM_HORIZON` semantics: start of stream, no gap check against a
/// predecessor commit.
pub const FRESH_COMMIT_NUM: i64 = 0;
pub const FRESH_OP_NUM: i64 = 0;

#[derive(Debug)]
pub enum StreamError {
    Transport(String),
    Http { status: u16, body: String },
    Decode(String),
    /// Two consecutive records' commit numbers differ by more than one —
    /// the stream server has already trimmed records we have not seen yet.
    GapDetected { expected: i64 },
    /// A record's commit number went backwards relative to the previous
    /// record in the page — a replay or source reset the aggregator cannot
    /// reason about safely.
    OutOfOrderStream { prev: i64, found: i64 },
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Transport(msg) => write!(f, "stream transport error: {msg}"),
            StreamError::Http { status, body } => {
                write!(f, "stream endpoint returned status {status}: {body}")
            }
            StreamError::Decode(msg) => write!(f, "stream response decode error: {msg}"),
            StreamError::GapDetected { expected } => {
                write!(f, "missing commit {expected} in stream response; expect auto-resolution on next poll")
            }
            StreamError::OutOfOrderStream { prev, found } => {
                write!(f, "stream moved backwards: prior commit {prev}, next record's commit {found}")
            }
        }
    }
}

impl std::error::Error for StreamError {}

/// A page of records read from the stream, plus enough bookkeeping for the
/// caller to advance its lease and compute lag metrics.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub records: Vec<ChangeRecord>,
    pub last_event_id: EventId,
    pub last_trx_timestamp_millis: i64,
    pub total_records: i64,
}

#[async_trait]
pub trait StreamReader: Send + Sync {
    /// Read up to `limit` records after `(commit_num, op_num)`. `(0, 0)`
    /// means read from the beginning of the stream. Returns `None` when the
    /// stream has no more records past this point.
    async fn read_records(
        &self,
        limit: u32,
        commit_num: i64,
        op_num: i64,
    ) -> Result<Option<StreamBatch>, StreamError>;
}

/// Scan records for the first missing commit number, given the commit
/// number immediately preceding the page (`None` when reading from
/// `TRIM_HORIZON`, in which case the first record seeds the comparison).
///
/// Two adjacent records' commit numbers must never differ by more than one;
/// a larger gap means the stream has already discarded records we have not
/// processed.
pub fn find_first_missing_commit(
    commit_nums: &[i64],
    starting_commit_num: Option<i64>,
) -> Option<i64> {
    if commit_nums.is_empty() {
        return None;
    }

    let mut prev = starting_commit_num;
    for &current in commit_nums {
        let p = match prev {
            Some(p) => p,
            None => {
                prev = Some(current);
                continue;
            }
        };

        if current - p > 1 {
            return Some(p + 1);
        }
        prev = Some(current);
    }
    None
}

/// Scan for a commit number that regresses relative to its predecessor.
/// Distinct from [`find_first_missing_commit`]: a gap skips forward too far,
/// this catches the stream moving backward at all.
pub fn find_out_of_order_commit(commit_nums: &[i64], starting_commit_num: Option<i64>) -> Option<(i64, i64)> {
    let mut prev = starting_commit_num;
    for &current in commit_nums {
        if let Some(p) = prev {
            if current < p {
                return Some((p, current));
            }
        }
        prev = Some(current);
    }
    None
}

#[derive(serde::Deserialize)]
struct WireEventId {
    #[serde(rename = "commitNum")]
    commit_num: i64,
    #[serde(rename = "opNum")]
    op_num: i64,
}

#[derive(serde::Deserialize)]
struct WireRecord {
    #[serde(rename = "eventId")]
    event_id: WireEventId,
    op: String,
    data: serde_json::Value,
    #[serde(rename = "commitTimestampInMillis", default)]
    commit_timestamp_millis: i64,
}

#[derive(serde::Deserialize)]
struct WireStreamResponse {
    records: Vec<WireRecord>,
    #[serde(rename = "lastEventId")]
    last_event_id: WireEventId,
    #[serde(rename = "lastTrxTimestamp")]
    last_trx_timestamp: i64,
    #[serde(rename = "totalRecords", default)]
    total_records: i64,
}

fn parse_op(raw: &str) -> Result<Op, StreamError> {
    match raw {
        "ADD" => Ok(Op::Add),
        "REMOVE" => Ok(Op::Remove),
        other => Err(StreamError::Decode(format!("unrecognized op '{other}'"))),
    }
}

fn parse_record_data(value: &serde_json::Value) -> Result<RecordData, StreamError> {
    if let Some(stmt) = value.get("stmt").and_then(|v| v.as_str()) {
        let parsed = parse_nquad_statement(stmt)
            .ok_or_else(|| StreamError::Decode(format!("could not parse n-quad statement '{stmt}'")))?;
        return Ok(RecordData::Rdf {
            stmt: stmt.to_string(),
            parsed,
        });
    }

    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StreamError::Decode("missing property-graph 'id' field".to_string()))?
        .to_string();
    let type_raw = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let element_type = GraphElementType::parse(type_raw)
        .ok_or_else(|| StreamError::Decode(format!("unrecognized property-graph element type '{type_raw}'")))?;
    let key = value
        .get("key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StreamError::Decode("missing property-graph 'key' field".to_string()))?
        .to_string();

    let typed_value = value.get("value").map(|v| TypedValue {
        value: v.clone(),
        data_type: value
            .get("dataType")
            .and_then(|d| d.as_str())
            .unwrap_or("")
            .to_string(),
    });

    Ok(RecordData::PropertyGraph(PropertyGraphPayload {
        id,
        r#type: element_type,
        key,
        value: typed_value,
        from: value.get("from").and_then(|v| v.as_str()).map(|s| s.to_string()),
        to: value.get("to").and_then(|v| v.as_str()).map(|s| s.to_string()),
    }))
}

/// Best-effort n-quad line parser covering the subset emitted by the source
/// stream: `<subject> <predicate> object [<graph>] .` where `object` is
/// either a `<uri>` or a `"literal"[^^<datatype>|@lang]`.
fn parse_nquad_statement(stmt: &str) -> Option<RdfQuad> {
    let stmt = stmt.trim().trim_end_matches('.').trim();
    let mut rest = stmt;

    let (subject, subject_is_blank_node) = take_term(&mut rest)?;
    let (predicate, _) = take_term(&mut rest)?;
    let object_raw = take_object(&mut rest)?;
    let graph = {
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            take_term(&mut rest).map(|(g, _)| g)
        }
    };

    Some(RdfQuad {
        subject,
        subject_is_blank_node,
        predicate,
        object: object_raw,
        graph,
    })
}

fn take_term(rest: &mut &str) -> Option<(String, bool)> {
    let s = rest.trim_start();
    if let Some(tail) = s.strip_prefix('<') {
        let end = tail.find('>')?;
        *rest = &tail[end + 1..];
        Some((tail[..end].to_string(), false))
    } else if let Some(tail) = s.strip_prefix("_:") {
        let end = tail.find(char::is_whitespace).unwrap_or(tail.len());
        *rest = &tail[end..];
        Some((tail[..end].to_string(), true))
    } else {
        None
    }
}

fn take_object(rest: &mut &str) -> Option<RdfObject> {
    let s = rest.trim_start();
    if let Some(tail) = s.strip_prefix('<') {
        let end = tail.find('>')?;
        *rest = &tail[end + 1..];
        return Some(RdfObject {
            value: tail[..end].to_string(),
            is_literal: false,
            datatype: None,
            language: None,
        });
    }

    if let Some(tail) = s.strip_prefix('"') {
        let end = tail.find('"')?;
        let literal = tail[..end].to_string();
        let after = &tail[end + 1..];

        if let Some(lang_tail) = after.strip_prefix('@') {
            let end = lang_tail.find(char::is_whitespace).unwrap_or(lang_tail.len());
            *rest = &lang_tail[end..];
            return Some(RdfObject {
                value: literal,
                is_literal: true,
                datatype: None,
                language: Some(lang_tail[..end].to_string()),
            });
        }

        if let Some(dt_tail) = after.strip_prefix("^^<") {
            let end = dt_tail.find('>')?;
            *rest = &dt_tail[end + 1..];
            return Some(RdfObject {
                value: literal,
                is_literal: true,
                datatype: Some(dt_tail[..end].to_string()),
                language: None,
            });
        }

        *rest = after;
        return Some(RdfObject {
            value: literal,
            is_literal: true,
            datatype: None,
            language: None,
        });
    }

    None
}

/// Signed (or unsigned) HTTP reader against the real stream endpoint.
pub struct HttpStreamReader {
    client: reqwest::Client,
    config: PipelineConfig,
    credentials: Box<dyn CredentialSource>,
}

impl HttpStreamReader {
    pub fn new(config: PipelineConfig, credentials: Box<dyn CredentialSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            credentials,
        }
    }

    fn query_type_tag(&self) -> Result<&'static str, StreamError> {
        match self.config.query_language() {
            Ok(cdx_config::QueryLanguage::PropertyGraph) => Ok("gremlin_stream"),
            Ok(cdx_config::QueryLanguage::Rdf) => Ok("sparql_stream"),
            Err(e) => Err(StreamError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl StreamReader for HttpStreamReader {
    async fn read_records(
        &self,
        limit: u32,
        commit_num: i64,
        op_num: i64,
    ) -> Result<Option<StreamBatch>, StreamError> {
        let fresh = commit_num == FRESH_COMMIT_NUM && op_num == FRESH_OP_NUM;

        let mut payload: Vec<(String, String)> = vec![("limit".to_string(), limit.to_string())];
        if fresh {
            payload.push(("iteratorType".to_string(), "TRIM_HORIZON".to_string()));
        } else {
            payload.push(("commitNum".to_string(), commit_num.to_string()));
            payload.push(("opNum".to_string(), op_num.to_string()));
            payload.push(("iteratorType".to_string(), "AFTER_SEQUENCE_NUMBER".to_string()));
        }

        let mut request = self.client.get(&self.config.stream_endpoint).query(&payload);

        if self.config.iam_auth_enabled {
            let url = reqwest::Url::parse(&self.config.stream_endpoint)
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            let host = url.host_str().unwrap_or_default();
            let creds = self.credentials.resolve();
            let signed = get_signed_header(
                host,
                HttpMethod::Get,
                self.query_type_tag()?,
                &payload,
                &self.config.region,
                &creds,
                chrono::Utc::now(),
            )
            .map_err(|e| StreamError::Transport(e.to_string()))?;

            request = request
                .header("x-amz-date", signed.x_amz_date)
                .header("Authorization", signed.authorization)
                .header("x-amz-security-token", signed.x_amz_security_token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            200 => {}
            404 => return Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(StreamError::Http { status, body });
            }
        }

        let body: WireStreamResponse = response
            .json()
            .await
            .map_err(|e| StreamError::Decode(e.to_string()))?;

        validate_and_convert(body, if fresh { None } else { Some(commit_num) })
    }
}

fn validate_and_convert(
    wire: WireStreamResponse,
    starting_commit_num: Option<i64>,
) -> Result<Option<StreamBatch>, StreamError> {
    if wire.records.is_empty() {
        return Ok(None);
    }

    let commit_nums: Vec<i64> = wire.records.iter().map(|r| r.event_id.commit_num).collect();
    if let Some((prev, found)) = find_out_of_order_commit(&commit_nums, starting_commit_num) {
        return Err(StreamError::OutOfOrderStream { prev, found });
    }
    if let Some(expected) = find_first_missing_commit(&commit_nums, starting_commit_num) {
        return Err(StreamError::GapDetected { expected });
    }

    let mut records = Vec::with_capacity(wire.records.len());
    for r in wire.records {
        records.push(ChangeRecord {
            event_id: EventId {
                commit_num: r.event_id.commit_num,
                op_num: r.event_id.op_num,
            },
            op: parse_op(&r.op)?,
            data: parse_record_data(&r.data)?,
            commit_timestamp_millis: r.commit_timestamp_millis,
        });
    }

    Ok(Some(StreamBatch {
        records,
        last_event_id: EventId {
            commit_num: wire.last_event_id.commit_num,
            op_num: wire.last_event_id.op_num,
        },
        last_trx_timestamp_millis: wire.last_trx_timestamp,
        total_records: wire.total_records,
    }))
}
