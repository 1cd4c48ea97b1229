use crate::provider::{deliver_batch, BatchSink, CollectError, LogProvider, SeenIds};
use crate::record::{LogRecord, StreamKind};
use crate::sanitize::PayloadCleaner;
use crate::ws::{StreamConnector, StreamMessage, StreamScope, SubscribeParams};
use crate::MAX_RECORDS_IN_MEMORY;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// How far back the subscribe handshake asks for replay, covering
/// messages emitted while the connection was being established.
const DEFAULT_LOOKBACK: Duration = Duration::from_secs(10);

/// Where the streaming provider currently is in its connection life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Connecting,
    Streaming,
    Backoff,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    Connected,
    ConnectionLost,
    BackoffElapsed,
    Cancelled,
}

/// Transition table for the reconnect loop.
///
/// The failure counter covers the whole `collect` call: it never resets
/// on a successful connection, so five lost sessions end collection
/// permanently regardless of what happened in between.
#[derive(Debug)]
pub(crate) struct ReconnectMachine {
    phase: StreamPhase,
    failures: u32,
    max_attempts: u32,
}

impl ReconnectMachine {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self {
            phase: StreamPhase::Connecting,
            failures: 0,
            max_attempts,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn apply(&mut self, event: SessionEvent) -> StreamPhase {
        self.phase = match (self.phase, event) {
            (_, SessionEvent::Cancelled) => StreamPhase::Cancelled,
            (StreamPhase::Connecting, SessionEvent::Connected) => StreamPhase::Streaming,
            (StreamPhase::Connecting | StreamPhase::Streaming, SessionEvent::ConnectionLost) => {
                self.failures += 1;
                if self.failures > self.max_attempts {
                    StreamPhase::Failed
                } else {
                    StreamPhase::Backoff
                }
            }
            (StreamPhase::Backoff, SessionEvent::BackoffElapsed) => StreamPhase::Connecting,
            (phase, _) => phase,
        };
        self.phase
    }
}

/// Configuration for [`StreamingLogProvider`].
pub struct StreamingLogProviderConfig {
    pub connector: Arc<dyn StreamConnector>,
    pub scope: StreamScope,
    pub run_id: Option<String>,
    pub container_id: Option<String>,

    /// Defaults to 10 seconds.
    pub lookback: Option<Duration>,

    /// Defaults to 2 seconds.
    pub reconnect_delay: Option<Duration>,

    /// Defaults to 5.
    pub max_reconnect_attempts: Option<u32>,
}

/// Receives logs pushed over a persistent streaming connection.
///
/// `collect` wraps a bounded reconnect loop around connection sessions;
/// a clean server-side close is natural completion, anything else retries
/// with a fixed delay until the attempt budget is spent. Inbound payloads
/// are cleaned of progress-bar control sequences and split into discrete
/// records before delivery.
pub struct StreamingLogProvider {
    connector: Arc<dyn StreamConnector>,
    scope: StreamScope,
    run_id: Option<String>,
    container_id: Option<String>,
    lookback: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,

    seen: SeenIds,
    cleaner: PayloadCleaner,
}

impl StreamingLogProvider {
    pub fn new(cfg: StreamingLogProviderConfig) -> Self {
        Self {
            connector: cfg.connector,
            scope: cfg.scope,
            run_id: cfg.run_id,
            container_id: cfg.container_id,
            lookback: cfg.lookback.unwrap_or(DEFAULT_LOOKBACK),
            reconnect_delay: cfg.reconnect_delay.unwrap_or(DEFAULT_RECONNECT_DELAY),
            max_reconnect_attempts: cfg
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            seen: SeenIds::new(MAX_RECORDS_IN_MEMORY * 2),
            cleaner: PayloadCleaner::new(),
        }
    }

    /// One connection session: connect, read until clean close, lost
    /// connection, cancellation, or sink error.
    async fn run_session(
        &mut self,
        params: &SubscribeParams,
        cancel: &CancellationToken,
        machine: &mut ReconnectMachine,
        sink: &mut dyn BatchSink,
    ) -> Result<(), CollectError> {
        let mut conn = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            res = self.connector.connect(params) => res.map_err(CollectError::Stream)?,
        };
        machine.apply(SessionEvent::Connected);

        loop {
            let msg = tokio::select! {
                // Check cancellation ahead of an already-ready read, the
                // same order the read loop is expected to observe it.
                biased;
                _ = cancel.cancelled() => {
                    conn.close().await;
                    return Err(CollectError::Cancelled);
                }
                res = conn.next_message() => res.map_err(CollectError::Stream)?,
            };

            let Some(msg) = msg else {
                debug!("Log stream closed cleanly");
                return Ok(());
            };

            let batch = self.records_from_message(&msg);
            deliver_batch(sink, batch).await?;
        }
    }

    /// Turn one inbound message into 0..N records: dedup on the composite
    /// base ID, then clean and split the payload.
    fn records_from_message(&mut self, msg: &StreamMessage) -> Vec<LogRecord> {
        // Build streams have no run id; the line number disambiguates
        // messages sharing a timestamp instead.
        let sub = if msg.sub_id.is_empty() {
            msg.line_number.to_string()
        } else {
            msg.sub_id.clone()
        };
        let base_id = format!(
            "{}-{}-{}",
            msg.entity_id,
            sub,
            msg.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        );

        if self.seen.contains(&base_id) {
            debug!(id = %base_id, "Skipping already-seen stream message");
            return Vec::new();
        }
        self.seen.record_batch(std::slice::from_ref(&base_id));

        let stream = if msg.stream.is_empty() {
            // Runtime log streams report no stream label; pushed output
            // is stdout unless marked otherwise.
            StreamKind::Stdout
        } else {
            StreamKind::parse(&msg.stream)
        };

        let mut metadata = HashMap::new();
        metadata.insert("entityID".to_string(), serde_json::json!(msg.entity_id));
        if !msg.sub_id.is_empty() {
            metadata.insert("runID".to_string(), serde_json::json!(msg.sub_id));
        }
        if !msg.container_name.is_empty() {
            metadata.insert(
                "containerName".to_string(),
                serde_json::json!(msg.container_name),
            );
        }
        if msg.line_number != 0 {
            metadata.insert(
                "lineNumber".to_string(),
                serde_json::json!(msg.line_number),
            );
        }
        if !msg.stage.is_empty() {
            metadata.insert("stage".to_string(), serde_json::json!(msg.stage));
        }

        self.cleaner
            .clean_and_split(&msg.content)
            .into_iter()
            .enumerate()
            .map(|(i, content)| LogRecord {
                id: format!("{base_id}-{i}"),
                timestamp: msg.timestamp,
                content,
                stream,
                metadata: metadata.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl LogProvider for StreamingLogProvider {
    async fn collect(
        &mut self,
        cancel: CancellationToken,
        sink: &mut dyn BatchSink,
    ) -> Result<(), CollectError> {
        let params = SubscribeParams {
            scope: self.scope.clone(),
            since: Some(
                Utc::now()
                    - ChronoDuration::from_std(self.lookback)
                        .unwrap_or_else(|_| ChronoDuration::seconds(10)),
            ),
            run_id: self.run_id.clone(),
            container_id: self.container_id.clone(),
        };

        let mut machine = ReconnectMachine::new(self.max_reconnect_attempts);

        loop {
            match self.run_session(&params, &cancel, &mut machine, sink).await {
                Ok(()) => return Ok(()),
                Err(CollectError::Cancelled) => {
                    machine.apply(SessionEvent::Cancelled);
                    return Err(CollectError::Cancelled);
                }
                Err(CollectError::Stream(e)) => match machine.apply(SessionEvent::ConnectionLost) {
                    StreamPhase::Failed => {
                        return Err(CollectError::ReconnectExhausted {
                            attempts: machine.failures(),
                            source: e,
                        });
                    }
                    _ => {
                        warn!(
                            attempt = machine.failures(),
                            max_attempts = self.max_reconnect_attempts,
                            error = %e,
                            "Log stream connection lost, reconnecting"
                        );

                        tokio::select! {
                            _ = cancel.cancelled() => {
                                machine.apply(SessionEvent::Cancelled);
                                return Err(CollectError::Cancelled);
                            }
                            _ = tokio::time::sleep(self.reconnect_delay) => {
                                machine.apply(SessionEvent::BackoffElapsed);
                            }
                        }
                    }
                },
                // Sink errors stop collection immediately, no retry.
                Err(other) => return Err(other),
            }
        }
    }
}
