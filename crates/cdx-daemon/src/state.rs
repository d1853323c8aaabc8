//! Shared runtime state for cdx-daemon.
//!
//! `AppState` is built once at startup (see `main.rs`) and handed to Axum
//! as `State<Arc<AppState>>`; handlers never reach for process-wide
//! singletons.

use std::sync::Arc;

use anyhow::Context;
use cdx_bulk::HttpBulkSink;
use cdx_config::credentials::{CredentialSource, EnvCredentialSource};
use cdx_config::PipelineConfig;
use cdx_metrics::TracingMetricsSink;
use cdx_pipeline::PipelineContext;
use cdx_stream::HttpStreamReader;

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<PipelineContext>,
    pub build: BuildInfo,
}

impl AppState {
    /// Connect, migrate, load configuration from the environment, and wire
    /// the real HTTP-backed stream reader / bulk sink / tracing metrics.
    pub async fn from_env() -> anyhow::Result<Self> {
        let pool = cdx_cursor::connect_from_env().await?;
        cdx_cursor::migrate(&pool).await.context("running cursor store migrations")?;

        let config = PipelineConfig::from_env().context("loading pipeline configuration")?;
        let credentials = EnvCredentialSource;
        let resolved = credentials.resolve();

        let stream_reader: Box<dyn cdx_stream::StreamReader> =
            Box::new(HttpStreamReader::new(config.clone(), Box::new(EnvCredentialSource)));
        let bulk_sink: Box<dyn cdx_bulk::BulkSink> = Box::new(HttpBulkSink::new(
            config.handler_additional_params.search_endpoint.clone(),
            config.region.clone(),
            resolved,
        ));
        let metrics: Box<dyn cdx_metrics::MetricsSink> = Box::new(TracingMetricsSink);

        let ctx = PipelineContext::new(pool, config, stream_reader, bulk_sink, metrics)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("constructing pipeline context")?;

        Ok(Self {
            ctx: Arc::new(ctx),
            build: BuildInfo { service: "cdx-daemon", version: env!("CARGO_PKG_VERSION") },
        })
    }
}
