use crate::collector::buffer::LogBuffer;
use crate::collector::idle::IdleTracker;
use crate::provider::{BatchSink, CollectError, LogProvider, SinkError};
use crate::record::LogRecord;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded hand-off between the provider task and the consumer loop.
/// Small on purpose: a stalled consumer applies backpressure to the
/// provider instead of buffering unboundedly.
pub const BATCH_CHANNEL_CAPACITY: usize = 10;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Sink handed to the provider task: forwards batches over the bounded
/// channel, bailing out as soon as the session is cancelled so a full
/// channel cannot wedge shutdown.
struct ChannelSink {
    tx: mpsc::Sender<Vec<LogRecord>>,
    cancel: CancellationToken,
}

#[async_trait]
impl BatchSink for ChannelSink {
    async fn deliver(&mut self, batch: Vec<LogRecord>) -> Result<(), SinkError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SinkError::Cancelled),
            res = self.tx.send(batch) => res.map_err(|_| SinkError::Closed),
        }
    }
}

/// How a finished session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The source signalled natural completion.
    Completed,
    /// Cancellation was requested and observed.
    Cancelled,
    Failed(CollectError),
}

/// Consumer-side callbacks invoked from the session event loop.
///
/// All methods run on the loop task and should return quickly; anything
/// slow belongs behind a channel of its own.
pub trait SessionObserver: Send {
    fn on_batch(&mut self, records: &[LogRecord]);

    fn on_idle(&mut self, _message: &'static str) {}
}

/// Runs one provider on a background task and consumes its batches on a
/// single event loop, keeping the retained buffer and idle tracking in
/// one place.
pub struct CollectSession {
    batch_rx: mpsc::Receiver<Vec<LogRecord>>,
    done_rx: oneshot::Receiver<Result<(), CollectError>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,

    buffer: LogBuffer,
    idle: IdleTracker,
    tick_interval: Duration,
}

impl CollectSession {
    /// Start collecting. The provider runs until it finishes, fails, or
    /// `cancel` fires.
    pub fn spawn(mut provider: Box<dyn LogProvider>, cancel: CancellationToken) -> Self {
        let (tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();

        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut sink = ChannelSink {
                tx,
                cancel: task_cancel.clone(),
            };
            let result = provider.collect(task_cancel, &mut sink).await;
            // The receiver only goes away when the whole session is
            // dropped, in which case the result has no audience.
            let _ = done_tx.send(result);
        });

        Self {
            batch_rx,
            done_rx,
            cancel,
            handle,
            buffer: LogBuffer::default(),
            idle: IdleTracker::new(Instant::now()),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    /// Records retained so far, oldest first (bounded).
    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut LogBuffer {
        &mut self.buffer
    }

    /// Request shutdown. `run` returns once the provider has observed it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drive the session to completion, invoking the observer for each
    /// delivered batch and each idle reassurance. Returns the retained
    /// buffer alongside the outcome.
    ///
    /// Remaining in-flight batches are drained after the provider
    /// finishes, so the observer sees every record the provider accepted.
    pub async fn run(mut self, observer: &mut dyn SessionObserver) -> (LogBuffer, SessionOutcome) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut result: Option<Result<(), CollectError>> = None;
        let mut channel_open = true;

        while channel_open || result.is_none() {
            tokio::select! {
                maybe_batch = self.batch_rx.recv(), if channel_open => {
                    match maybe_batch {
                        Some(batch) => {
                            self.idle.record_activity(Instant::now());
                            observer.on_batch(&batch);
                            let evicted = self.buffer.push_batch(batch);
                            if evicted > 0 {
                                debug!(evicted, "Evicted oldest records past retention cap");
                            }
                        }
                        // Provider task dropped its sink; no more batches.
                        None => channel_open = false,
                    }
                }

                res = &mut self.done_rx, if result.is_none() => {
                    result = Some(res.unwrap_or_else(|_| {
                        warn!("Provider task dropped without reporting a result");
                        Err(CollectError::Cancelled)
                    }));
                }

                _ = ticker.tick() => {
                    if let Some(message) = self.idle.poll(Instant::now()) {
                        observer.on_idle(message);
                    }
                }
            }
        }

        self.handle.abort();

        let outcome = match result.unwrap_or(Ok(())) {
            Ok(()) => SessionOutcome::Completed,
            Err(e) if e.is_cancelled() => SessionOutcome::Cancelled,
            Err(e) => SessionOutcome::Failed(e),
        };
        (self.buffer, outcome)
    }

    /// Retained records after the session is over, for callers that want
    /// the final state rather than per-batch callbacks.
    pub async fn run_to_end(self) -> (Vec<LogRecord>, SessionOutcome) {
        struct Recorder {
            records: Vec<LogRecord>,
        }
        impl SessionObserver for Recorder {
            fn on_batch(&mut self, records: &[LogRecord]) {
                self.records.extend_from_slice(records);
            }
        }

        let mut recorder = Recorder {
            records: Vec::new(),
        };
        let (_, outcome) = self.run(&mut recorder).await;
        (recorder.records, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::deliver_batch;
    use crate::record::StreamKind;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn record(id: &str, secs: i64) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            content: format!("line {id}"),
            stream: StreamKind::Stdout,
            metadata: HashMap::new(),
        }
    }

    /// Emits scripted batches with a small pause between them, then
    /// finishes with a scripted result.
    struct ScriptedProvider {
        batches: Vec<Vec<LogRecord>>,
        result: Option<Result<(), CollectError>>,
    }

    #[async_trait]
    impl LogProvider for ScriptedProvider {
        async fn collect(
            &mut self,
            cancel: CancellationToken,
            sink: &mut dyn BatchSink,
        ) -> Result<(), CollectError> {
            for batch in self.batches.drain(..) {
                if cancel.is_cancelled() {
                    return Err(CollectError::Cancelled);
                }
                deliver_batch(sink, batch).await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.result.take().unwrap_or(Ok(()))
        }
    }

    /// Never finishes until cancelled.
    struct HangingProvider;

    #[async_trait]
    impl LogProvider for HangingProvider {
        async fn collect(
            &mut self,
            cancel: CancellationToken,
            _sink: &mut dyn BatchSink,
        ) -> Result<(), CollectError> {
            cancel.cancelled().await;
            Err(CollectError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_batches_delivered_and_retained_in_order() {
        let provider = ScriptedProvider {
            batches: vec![
                vec![record("a", 0), record("b", 1)],
                vec![record("c", 2)],
            ],
            result: Some(Ok(())),
        };

        let session = CollectSession::spawn(Box::new(provider), CancellationToken::new());
        let (records, outcome) = session.run_to_end().await;

        assert!(matches!(outcome, SessionOutcome::Completed));
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_provider_failure_surfaces_after_drain() {
        let provider = ScriptedProvider {
            batches: vec![vec![record("a", 0)]],
            result: Some(Err(CollectError::Stream(
                crate::ws::StreamError::Stalled,
            ))),
        };

        let session = CollectSession::spawn(Box::new(provider), CancellationToken::new());
        let (records, outcome) = session.run_to_end().await;

        // The batch delivered before the failure is not lost.
        assert_eq!(records.len(), 1);
        assert!(matches!(
            outcome,
            SessionOutcome::Failed(CollectError::Stream(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_hanging_provider() {
        let cancel = CancellationToken::new();
        let session = CollectSession::spawn(Box::new(HangingProvider), cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let (records, outcome) = session.run_to_end().await;
        assert!(records.is_empty());
        assert!(matches!(outcome, SessionOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_with_full_channel_does_not_wedge() {
        // More batches than the channel holds, and a consumer that never
        // drains them: the provider must still observe cancellation from
        // inside a blocked deliver.
        let batches: Vec<Vec<LogRecord>> = (0..(BATCH_CHANNEL_CAPACITY + 5) as i64)
            .map(|i| vec![record(&format!("r{i}"), i)])
            .collect();
        let provider = ScriptedProvider {
            batches,
            result: Some(Ok(())),
        };

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = ChannelSink {
            tx,
            cancel: cancel.clone(),
        };

        let task_cancel = cancel.clone();
        let mut provider = provider;
        let collect = tokio::spawn(async move {
            provider.collect(task_cancel, &mut sink).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), collect)
            .await
            .expect("collect must not wedge on a full channel")
            .unwrap();
        assert!(matches!(result, Err(CollectError::Cancelled)));
    }

    #[tokio::test]
    async fn test_buffer_enforces_retention_inside_session() {
        let provider = ScriptedProvider {
            batches: vec![(0..30).map(|i| record(&format!("r{i}"), i)).collect()],
            result: Some(Ok(())),
        };

        let mut session = CollectSession::spawn(Box::new(provider), CancellationToken::new());
        // Shrink the cap so the test does not need 10k records.
        *session.buffer_mut() = LogBuffer::new(10);

        struct Counter {
            seen: usize,
        }
        impl SessionObserver for Counter {
            fn on_batch(&mut self, records: &[LogRecord]) {
                self.seen += records.len();
            }
        }

        let mut counter = Counter { seen: 0 };
        let (buffer, outcome) = session.run(&mut counter).await;

        assert!(matches!(outcome, SessionOutcome::Completed));
        // The observer saw everything even though the buffer only
        // retains the most recent records.
        assert_eq!(counter.seen, 30);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.records().next().unwrap().id, "r20");
    }
}
