//! Bounded poll cycle: wires the cursor store, stream reader, transformer,
//! aggregator and bulk executor together behind a single `run_cycle` call.
//!
//! A cycle is driven by an external orchestrator (a step function, a cron,
//! a daemon's own loop) that hands in `{index, count, wait_time}` and gets
//! the same triple back with `index` advanced and `wait_time` recomputed —
//! the orchestrator decides whether and how long to sleep before the next
//! call. The pipeline never sleeps or loops past its own deadline itself.

use cdx_aggregate::AggregationMode;
use cdx_bulk::{BulkError, BulkSink};
use cdx_config::{ConfigError, PipelineConfig};
use cdx_cursor::LeaseError;
use cdx_stream::{StreamError, StreamReader};
use cdx_transform::{mapping::MappingRegistry, Transformer};
use sqlx::PgPool;
use std::fmt;
use tracing::{debug, info};

/// The `{iterator: {...}}` shape an orchestrator passes in and gets back.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct CycleInput {
    pub index: i64,
    pub count: i64,
    pub wait_time: i64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CycleOutput {
    pub index: i64,
    #[serde(rename = "continue")]
    pub should_continue: bool,
    pub count: i64,
    pub wait_time: i64,
}

#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    Lease(LeaseError),
    Stream(StreamError),
    Bulk(BulkError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "configuration error: {e}"),
            PipelineError::Lease(e) => write!(f, "lease error: {e}"),
            PipelineError::Stream(e) => write!(f, "stream error: {e}"),
            PipelineError::Bulk(e) => write!(f, "bulk error: {e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}

impl From<LeaseError> for PipelineError {
    fn from(e: LeaseError) -> Self {
        PipelineError::Lease(e)
    }
}

impl From<StreamError> for PipelineError {
    fn from(e: StreamError) -> Self {
        PipelineError::Stream(e)
    }
}

impl From<BulkError> for PipelineError {
    fn from(e: BulkError) -> Self {
        PipelineError::Bulk(e)
    }
}

/// Everything a cycle needs, built once by the caller (a daemon's startup,
/// a CLI invocation) and threaded through every call by reference. No
/// process-wide singletons live in this crate.
pub struct PipelineContext {
    pool: PgPool,
    config: PipelineConfig,
    transformer: Box<dyn Transformer>,
    stream_reader: Box<dyn StreamReader>,
    bulk_sink: Box<dyn BulkSink>,
    metrics: Box<dyn cdx_metrics::MetricsSink>,
    aggregation_mode: AggregationMode,
}

impl PipelineContext {
    pub fn new(
        pool: PgPool,
        config: PipelineConfig,
        stream_reader: Box<dyn StreamReader>,
        bulk_sink: Box<dyn BulkSink>,
        metrics: Box<dyn cdx_metrics::MetricsSink>,
    ) -> Result<Self, PipelineError> {
        let language = config.query_language()?;
        let transformer =
            cdx_transform::select_transformer(language, config.handler_additional_params.enable_non_string_indexing);
        Ok(Self {
            pool,
            config,
            transformer,
            stream_reader,
            bulk_sink,
            metrics,
            // Transaction semantics (the default mode) are preserved unless
            // a future configuration knob opts into cross-transaction
            // coalescing; this system carries no such knob today.
            aggregation_mode: AggregationMode::Default,
        })
    }

    pub fn application_name(&self) -> &str {
        &self.config.application_name
    }
}

/// Run one bounded poll cycle. Takes the lease, polls the stream until the
/// deadline (90% of `maxPollingInterval`) or an end-of-stream wait is due,
/// and always evicts the lease on the way out — including on error.
pub async fn run_cycle(ctx: &PipelineContext, input: CycleInput) -> Result<CycleOutput, PipelineError> {
    // The lease key and the owner identity are the same string in this
    // system: a pipeline cycle locks out concurrent cycles of the same
    // named application, not a distinct per-replica identity.
    let lease_key = ctx.config.application_name.as_str();
    let owner = lease_key;

    cdx_cursor::create_if_absent(&ctx.pool, lease_key).await?;
    let now_millis = now_millis();
    info!(lease_key, "taking lease");
    let mut lease = cdx_cursor::take(&ctx.pool, lease_key, owner, now_millis).await?;

    let deadline = now_millis + (ctx.config.max_polling_interval_millis() as f64 * 0.9).round() as i64;
    let mut wait_time = input.wait_time;
    let mut last_wait_time: i64 = 0;

    let mut registry = MappingRegistry::new();
    registry.seed_geo_fields(&ctx.config.handler_additional_params.geo_location_fields);

    let cycle_result = run_poll_loop(ctx, &mut lease, owner, deadline, &mut registry, &mut wait_time, &mut last_wait_time).await;

    // Mirrors the original's try/finally: always give up the lease on the
    // way out, even when the poll loop above returned an error.
    info!(lease_key, "evicting lease");
    let _ = cdx_cursor::evict(&ctx.pool, lease_key, owner).await;

    cycle_result?;

    Ok(CycleOutput {
        index: input.index + 1,
        should_continue: input.index + 1 < input.count,
        count: input.count,
        wait_time,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_poll_loop(
    ctx: &PipelineContext,
    lease: &mut cdx_schemas::Lease,
    owner: &str,
    deadline: i64,
    registry: &mut MappingRegistry,
    wait_time: &mut i64,
    last_wait_time: &mut i64,
) -> Result<(), PipelineError> {
    while now_millis() < deadline {
        let batch = ctx
            .stream_reader
            .read_records(
                ctx.config.stream_records_batch_size as u32,
                lease.checkpoint,
                lease.checkpoint_sub_sequence_number,
            )
            .await?;

        let Some(batch) = batch else {
            debug!("no more stream records");
            ctx.metrics.records_processed(&ctx.config.application_name, &ctx.config.stream_endpoint, 0).await;
            ctx.metrics.stream_lag_millis(&ctx.config.application_name, &ctx.config.stream_endpoint, 0).await;

            *wait_time = get_wait_time(ctx.config.max_polling_wait_time_secs, *last_wait_time);
            if *wait_time > 0 {
                info!(wait_time, "waiting before next poll");
                *last_wait_time = *wait_time;
                break;
            }
            continue;
        };

        debug!(records = batch.records.len(), "fetched stream page");
        process_batch(ctx, &batch, registry).await?;

        *lease = cdx_cursor::advance(
            &ctx.pool,
            &ctx.config.application_name,
            owner,
            batch.last_event_id.commit_num,
            batch.last_event_id.op_num,
            now_millis(),
        )
        .await?;

        let processed = batch.records.len() as u64;
        ctx.metrics.records_processed(&ctx.config.application_name, &ctx.config.stream_endpoint, processed).await;
        let lag = now_millis() - batch.last_trx_timestamp_millis;
        ctx.metrics.stream_lag_millis(&ctx.config.application_name, &ctx.config.stream_endpoint, lag).await;

        // Records were found this pass: no wait is owed before the next one.
        *wait_time = 0;
        *last_wait_time = 0;
    }

    Ok(())
}

async fn process_batch(
    ctx: &PipelineContext,
    batch: &cdx_stream::StreamBatch,
    registry: &mut MappingRegistry,
) -> Result<(), PipelineError> {
    let params = &ctx.config.handler_additional_params;

    let kept: Vec<cdx_schemas::ChangeRecord> = batch
        .records
        .iter()
        .filter(|record| ctx.transformer.filter_and_project(record, registry, params).is_some())
        .cloned()
        .collect();

    if kept.is_empty() {
        return Ok(());
    }

    let entries = cdx_aggregate::aggregate_records(&kept, ctx.aggregation_mode);
    let actions = cdx_bulk::build_bulk_actions(&entries, ctx.transformer.as_ref(), registry, params);

    if actions.is_empty() {
        return Ok(());
    }

    ctx.bulk_sink.execute(&actions, params.ignore_missing_document).await?;
    Ok(())
}

/// Exponential backoff for end-of-stream waits: `1s` the first time, then
/// doubling up to `max_wait_time`, capped at it; `0` disables waiting
/// entirely (continuous polling).
pub fn get_wait_time(max_wait_time_secs: i64, last_wait_time_secs: i64) -> i64 {
    if max_wait_time_secs == 0 {
        return 0;
    }
    if last_wait_time_secs == 0 {
        return 1;
    }
    let doubled = 2 * last_wait_time_secs;
    if doubled < max_wait_time_secs {
        doubled
    } else {
        max_wait_time_secs
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
