//! Usage log - one append-only record per authenticated request
//!
//! Handlers hand records to a [`UsageLogger`] and move on. The default logger is a
//! batching actor in front of a [`UsageSink`]:
//! - producers `try_send` into a bounded mpsc channel and never wait
//! - a background task flushes when the batch is full or the interval elapses
//! - when every sender is dropped the remaining records are flushed and the task exits
//!
//! A full channel or a failing sink loses records; neither fails a request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorCode};
use crate::prompt::Category;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageLogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Records accumulated before a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time a record waits in the buffer
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Pending records beyond this are dropped
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_channel_buffer_size() -> usize {
    10_000
}

impl Default for UsageLogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            channel_buffer_size: default_channel_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Endpoint {
    Ask,
    Chat,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub user_id: String,
    pub endpoint: Endpoint,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Absent when the request never reached a model
    pub model: Option<String>,
    pub category: Category,
    pub cached: bool,
    pub latency_ms: u64,
    pub success: bool,
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

/// Fire-and-forget usage recording.
pub trait UsageLogger: Send + Sync {
    fn log(&self, record: UsageRecord);
}

/// Destination for flushed batches.
#[async_trait]
pub trait UsageSink: Send + Sync + 'static {
    async fn write(&self, records: &[UsageRecord]) -> Result<(), Error>;
}

/// Emits every record as a structured `tracing` event on the `usage` target.
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn write(&self, records: &[UsageRecord]) -> Result<(), Error> {
        for record in records {
            info!(
                target: "usage",
                request_id = %record.request_id,
                user_id = %record.user_id,
                endpoint = %record.endpoint,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                model = record.model.as_deref().unwrap_or(""),
                category = %record.category,
                cached = record.cached,
                latency_ms = record.latency_ms,
                success = record.success,
                error_code = %record.error_code.map(<&'static str>::from).unwrap_or(""),
                timestamp = %record.timestamp.to_rfc3339(),
                "usage"
            );
        }
        Ok(())
    }
}

pub struct NoopUsageLogger;

impl UsageLogger for NoopUsageLogger {
    fn log(&self, _record: UsageRecord) {}
}

/// Batching actor in front of a [`UsageSink`].
#[derive(Clone)]
pub struct BatchingUsageLogger {
    tx: mpsc::Sender<UsageRecord>,
}

impl BatchingUsageLogger {
    /// Spawns the background processor. Must be called inside a Tokio runtime.
    pub fn new(sink: Arc<dyn UsageSink>, config: &UsageLogConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer_size.max(1));
        tokio::spawn(Self::batch_processor(
            rx,
            sink,
            config.batch_size.max(1),
            config.flush_interval_ms.max(1),
        ));
        Self { tx }
    }

    async fn batch_processor(
        mut rx: mpsc::Receiver<UsageRecord>,
        sink: Arc<dyn UsageSink>,
        batch_size: usize,
        flush_interval_ms: u64,
    ) {
        let mut buffer: Vec<UsageRecord> = Vec::with_capacity(batch_size);
        let mut flush_timer = interval(Duration::from_millis(flush_interval_ms));

        info!("Usage logger started: batch_size={batch_size}, flush_interval={flush_interval_ms}ms");

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= batch_size {
                                Self::flush_batch(sink.as_ref(), &mut buffer).await;
                            }
                        }
                        None => {
                            info!("Usage logger channel closed, flushing remaining {} records", buffer.len());
                            Self::flush_batch(sink.as_ref(), &mut buffer).await;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    Self::flush_batch(sink.as_ref(), &mut buffer).await;
                }
            }
        }

        info!("Usage logger stopped");
    }

    async fn flush_batch(sink: &dyn UsageSink, buffer: &mut Vec<UsageRecord>) {
        if buffer.is_empty() {
            return;
        }
        let batch_len = buffer.len();
        match sink.write(buffer.as_slice()).await {
            Ok(()) => debug!("Wrote {batch_len} usage records"),
            Err(e) => error!("Failed to write usage batch ({batch_len} records): {e}"),
        }
        buffer.clear();
    }
}

impl UsageLogger for BatchingUsageLogger {
    fn log(&self, record: UsageRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Usage logger channel full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Usage logger channel closed");
            }
        }
    }
}

/// Builds the logger described by `config`, writing to the tracing sink.
pub fn setup_usage_logger(config: &UsageLogConfig) -> Arc<dyn UsageLogger> {
    if config.enabled {
        Arc::new(BatchingUsageLogger::new(Arc::new(TracingUsageSink), config))
    } else {
        info!("Usage logging is disabled");
        Arc::new(NoopUsageLogger)
    }
}
