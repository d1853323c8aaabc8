//! Postgres-backed scenario exercising a full `run_cycle` against fake
//! stream/bulk/metrics implementations. Gated by `CDX_DATABASE_URL` so the
//! unit-test suite stays hermetic; set the env var and point it at a
//! scratch database to run this.

use cdx_metrics::RecordingMetricsSink;
use cdx_pipeline::{run_cycle, CycleInput, PipelineContext};
use cdx_schemas::{ChangeRecord, EventId, GraphElementType, Op, PropertyGraphPayload, RecordData, TypedValue};
use cdx_stream::StreamBatch;
use cdx_testkit::{sample_config, RecordingBulkSink, ScriptedStreamReader};

macro_rules! require_db {
    () => {
        if std::env::var(cdx_cursor::ENV_DB_URL).is_err() {
            eprintln!("skipping: {} not set", cdx_cursor::ENV_DB_URL);
            return;
        }
    };
}

fn add_record(id: &str, key: &str, value: &str, commit_num: i64, op_num: i64) -> ChangeRecord {
    ChangeRecord {
        event_id: EventId { commit_num, op_num },
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

#[tokio::test]
async fn run_cycle_processes_one_page_then_reports_a_wait_time() {
    require_db!();
    let pool = cdx_cursor::testkit_db_pool().await.unwrap();
    let config = sample_config("scenario-pipeline-cycle-1");

    let page = StreamBatch {
        records: vec![add_record("v1", "name", "Ada", 1, 0), add_record("v1", "age", "30", 1, 1)],
        last_event_id: EventId { commit_num: 1, op_num: 1 },
        last_trx_timestamp_millis: 0,
        total_records: 2,
    };
    let stream_reader = Box::new(ScriptedStreamReader::new(vec![page]));
    let bulk_sink = Box::new(RecordingBulkSink::new());
    let metrics = Box::new(RecordingMetricsSink::new());

    let ctx = PipelineContext::new(pool.clone(), config, stream_reader, bulk_sink, metrics).unwrap();

    let output = run_cycle(&ctx, CycleInput { index: 0, count: 5, wait_time: 0 }).await.unwrap();

    assert_eq!(output.index, 1);
    assert!(output.should_continue);
    assert_eq!(output.wait_time, 1, "end of stream on first empty poll waits 1 second");

    let lease = cdx_cursor::get(&pool, "scenario-pipeline-cycle-1").await.unwrap().unwrap();
    assert_eq!(lease.lease_owner, cdx_schemas::LEASE_OWNER_NOBODY, "lease must be evicted after the cycle");
    assert_eq!(lease.checkpoint, 1);
    assert_eq!(lease.checkpoint_sub_sequence_number, 1);
}
