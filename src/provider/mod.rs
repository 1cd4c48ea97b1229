pub mod polling;
pub mod polling_build;
pub mod streaming;

use crate::record::LogRecord;
use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use polling::{PollingAppLogProvider, PollingAppLogProviderConfig};
pub use polling_build::{PollingBuildLogProvider, PollingBuildLogProviderConfig};
pub use streaming::{StreamingLogProvider, StreamingLogProviderConfig};

/// Consumer-side failure while processing a delivered batch.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("collection cancelled")]
    Cancelled,

    #[error("consumer channel closed")]
    Closed,
}

/// Why a `collect` call ended.
///
/// Natural completion (terminal build status, clean server close) is not
/// an error and surfaces as `Ok(())`. Everything else is distinguishable
/// here so the consumer can report cancellation differently from failure.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("collection cancelled")]
    Cancelled,

    #[error("sink error: {0}")]
    Sink(SinkError),

    #[error("failed to fetch logs: {0}")]
    Fetch(#[from] crate::api::ApiError),

    #[error("max reconnection attempts ({attempts}) exceeded: {source}")]
    ReconnectExhausted {
        attempts: u32,
        source: crate::ws::StreamError,
    },

    #[error("stream error: {0}")]
    Stream(#[from] crate::ws::StreamError),
}

impl CollectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CollectError::Cancelled)
    }
}

/// Receives batches of newly-accepted log records from a provider.
///
/// Never invoked with an empty batch. Returning an error stops collection
/// immediately; no further fetches or reads occur.
#[async_trait]
pub trait BatchSink: Send {
    async fn deliver(&mut self, batch: Vec<LogRecord>) -> Result<(), SinkError>;
}

/// The common contract every transport strategy implements.
///
/// `collect` runs until the cancellation token fires, the sink returns an
/// error, or the source signals natural completion (polling: terminal
/// build status; streaming: clean server close). Only natural completion
/// returns `Ok(())`.
#[async_trait]
pub trait LogProvider: Send {
    async fn collect(
        &mut self,
        cancel: CancellationToken,
        sink: &mut dyn BatchSink,
    ) -> Result<(), CollectError>;
}

/// Hands a non-empty batch to the sink, folding a cancelled sink back
/// into the cancellation return path.
pub(crate) async fn deliver_batch(
    sink: &mut dyn BatchSink,
    batch: Vec<LogRecord>,
) -> Result<(), CollectError> {
    if batch.is_empty() {
        return Ok(());
    }
    sink.deliver(batch).await.map_err(|e| match e {
        SinkError::Cancelled => CollectError::Cancelled,
        other => CollectError::Sink(other),
    })
}

/// Bounded set of already-accepted record IDs.
///
/// Exact dedup over the recent horizon; once the set exceeds its cap it is
/// rebuilt from only the IDs of the triggering batch, so very old IDs may
/// be re-accepted. That approximation is safe because the resumption
/// cursor keeps the server from replaying far into the past.
#[derive(Debug)]
pub(crate) struct SeenIds {
    ids: HashSet<String>,
    max_entries: usize,
}

impl SeenIds {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            ids: HashSet::new(),
            max_entries,
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record a batch of accepted IDs, rebuilding the set from just that
    /// batch when the cap is exceeded.
    pub(crate) fn record_batch(&mut self, batch_ids: &[String]) {
        for id in batch_ids {
            self.ids.insert(id.clone());
        }

        if self.ids.len() > self.max_entries {
            tracing::debug!(
                entries = self.ids.len(),
                max_entries = self.max_entries,
                retained = batch_ids.len(),
                "Rebuilding dedup set from most recent batch"
            );
            self.ids = batch_ids.iter().cloned().collect();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}
