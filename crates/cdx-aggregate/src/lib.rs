//! Coalesces change records into ordered, per-document bundles so the bulk
//! executor can emit one scripted update per run instead of one per record.
//!
//! Both add & remove operation orders are retained: a run ends the moment
//! the operation on a key changes, so callers that replay runs in order
//! observe the same add/remove/add sequence the source produced.

use cdx_schemas::{ChangeRecord, GraphElementType, RecordData, EDGE_ID_PREFIX, VERTEX_ID_PREFIX};

/// Bulk requests are capped to this many payloads per scripted action.
pub const AGGREGATE_QUERY_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    /// Coalesce only within the same transaction (`commitNum`). Preserves
    /// cross-document transaction boundaries at the cost of more, smaller
    /// bulk actions.
    Default,
    /// Coalesce across transactions by document id alone. Higher throughput,
    /// but a multi-document transaction's effects may become visible to
    /// different documents out of transaction order.
    Optimized,
}

#[derive(Debug, Clone)]
pub struct AggregateRun {
    pub operation: String,
    /// Full records, not just their payload — downstream bulk-action
    /// building re-derives each field's key/value via the transformer,
    /// which needs the enclosing `ChangeRecord`.
    pub records: Vec<ChangeRecord>,
}

#[derive(Debug, Clone)]
pub struct AggregateEntry {
    pub key: String,
    pub runs: Vec<AggregateRun>,
}

fn document_key(data: &RecordData) -> String {
    match data {
        RecordData::PropertyGraph(p) => {
            let prefix = if p.r#type.is_edge() { EDGE_ID_PREFIX } else { VERTEX_ID_PREFIX };
            cdx_schemas::document_id(prefix, &p.id)
        }
        RecordData::Rdf { parsed, .. } => cdx_schemas::document_id("", &parsed.subject),
    }
}

fn operation_tag(record: &ChangeRecord) -> String {
    match &record.data {
        RecordData::PropertyGraph(p) => format!("{}_{}", record.op.as_str(), p.r#type.as_str()),
        RecordData::Rdf { .. } => record.op.as_str().to_string(),
    }
}

fn aggregation_key(record: &ChangeRecord, mode: AggregationMode) -> String {
    let doc_key = document_key(&record.data);
    match mode {
        AggregationMode::Optimized => doc_key,
        AggregationMode::Default => format!("{}_{}", record.event_id.commit_num, doc_key),
    }
}

/// Aggregate a page of records, preserving first-touch key order and
/// within-key arrival order. Runs longer than [`AGGREGATE_QUERY_SIZE`] are
/// split into equally-ordered sub-runs so no single bulk action grows
/// unbounded.
pub fn aggregate_records(records: &[ChangeRecord], mode: AggregationMode) -> Vec<AggregateEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: std::collections::HashMap<String, Vec<(String, ChangeRecord)>> = std::collections::HashMap::new();

    for record in records {
        let key = aggregation_key(record, mode);
        let op_tag = operation_tag(record);
        let entry = by_key.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Vec::new()
        });
        entry.push((op_tag, record.clone()));
    }

    order
        .into_iter()
        .map(|key| {
            let tagged = by_key.remove(&key).unwrap_or_default();
            AggregateEntry {
                key,
                runs: split_into_runs(tagged),
            }
        })
        .collect()
}

fn split_into_runs(tagged: Vec<(String, ChangeRecord)>) -> Vec<AggregateRun> {
    let mut runs: Vec<AggregateRun> = Vec::new();
    for (op_tag, record) in tagged {
        match runs.last_mut() {
            Some(run) if run.operation == op_tag => run.records.push(record),
            _ => runs.push(AggregateRun {
                operation: op_tag,
                records: vec![record],
            }),
        }
    }

    runs.into_iter().flat_map(split_run_by_chunk_size).collect()
}

fn split_run_by_chunk_size(run: AggregateRun) -> Vec<AggregateRun> {
    if run.records.len() <= AGGREGATE_QUERY_SIZE {
        return vec![run];
    }

    run.records
        .chunks(AGGREGATE_QUERY_SIZE)
        .map(|chunk| AggregateRun {
            operation: run.operation.clone(),
            records: chunk.to_vec(),
        })
        .collect()
}
