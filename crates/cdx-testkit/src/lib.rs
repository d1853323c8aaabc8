//! Shared fakes for scenario tests: a scriptable `StreamReader` and a
//! recording `BulkSink`, plus a baseline `PipelineConfig` builder.
//!
//! Each crate under `tests/` previously hand-rolled its own copy of these;
//! this crate consolidates them behind one `[dev-dependencies]` entry.

use std::sync::Mutex;

use async_trait::async_trait;
use cdx_bulk::{BulkAction, BulkError, BulkOutcome, BulkSink};
use cdx_config::{HandlerAdditionalParams, PipelineConfig};
use cdx_stream::{StreamBatch, StreamError, StreamReader};

/// A baseline `PipelineConfig` with sane defaults, overridable via the
/// returned struct's public fields.
pub fn sample_config(application_name: &str) -> PipelineConfig {
    PipelineConfig {
        region: "us-east-1".to_string(),
        application_name: application_name.to_string(),
        lease_table_name: "lease".to_string(),
        stream_endpoint: "https://db.example.com:8182/gremlin/stream".to_string(),
        iam_auth_enabled: false,
        stream_records_batch_size: 100,
        max_polling_wait_time_secs: 10,
        max_polling_interval_secs: 600,
        handler_name: "gremlin".to_string(),
        handler_additional_params: HandlerAdditionalParams::default(),
    }
}

/// A `StreamReader` that serves a fixed script of pages, one per call, then
/// reports end-of-stream forever after the script is exhausted.
pub struct ScriptedStreamReader {
    pages: Mutex<Vec<StreamBatch>>,
}

impl ScriptedStreamReader {
    pub fn new(pages: Vec<StreamBatch>) -> Self {
        Self { pages: Mutex::new(pages) }
    }

    /// A reader with nothing queued up: every call reports end-of-stream.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl StreamReader for ScriptedStreamReader {
    async fn read_records(&self, _limit: u32, _commit_num: i64, _op_num: i64) -> Result<Option<StreamBatch>, StreamError> {
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            return Ok(None);
        }
        Ok(Some(pages.remove(0)))
    }
}

/// A `StreamReader` that always fails with the given error, for exercising
/// cycle-level error propagation.
pub struct FailingStreamReader {
    pub make_error: Box<dyn Fn() -> StreamError + Send + Sync>,
}

#[async_trait]
impl StreamReader for FailingStreamReader {
    async fn read_records(&self, _limit: u32, _commit_num: i64, _op_num: i64) -> Result<Option<StreamBatch>, StreamError> {
        Err((self.make_error)())
    }
}

/// A `BulkSink` that records every batch it was asked to execute and always
/// reports full success.
#[derive(Default)]
pub struct RecordingBulkSink {
    pub calls: Mutex<Vec<Vec<BulkAction>>>,
}

impl RecordingBulkSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl BulkSink for RecordingBulkSink {
    async fn execute(&self, actions: &[BulkAction], _ignore_missing_document: bool) -> Result<BulkOutcome, BulkError> {
        self.calls.lock().unwrap().push(actions.to_vec());
        Ok(BulkOutcome { succeeded: actions.len(), ignored_missing_document: 0 })
    }
}

/// A `BulkSink` that always fails with the given error.
pub struct FailingBulkSink {
    pub make_error: Box<dyn Fn() -> BulkError + Send + Sync>,
}

#[async_trait]
impl BulkSink for FailingBulkSink {
    async fn execute(&self, _actions: &[BulkAction], _ignore_missing_document: bool) -> Result<BulkOutcome, BulkError> {
        Err((self.make_error)())
    }
}
