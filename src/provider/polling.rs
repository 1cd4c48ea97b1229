use crate::api::{AppLogQuery, FetchApi};
use crate::provider::{deliver_batch, BatchSink, CollectError, LogProvider, SeenIds};
use crate::record::{LogRecord, StreamKind};
use crate::MAX_RECORDS_IN_MEMORY;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for [`PollingAppLogProvider`].
pub struct PollingAppLogProviderConfig {
    pub api: Arc<dyn FetchApi>,
    pub project_id: String,
    pub app_id: String,

    /// If false, fetch exactly once and complete.
    pub follow: bool,

    /// RFC 3339 timestamp to start from. An unparseable value is ignored
    /// and everything is fetched.
    pub since: Option<String>,

    pub run_id: Option<String>,
    pub container_id: Option<String>,
    pub stream: Option<String>,
    pub search_term: Option<String>,
    pub page_size: Option<i32>,

    /// "forward" or "backward". Defaults to "forward" in follow mode.
    pub direction: Option<String>,

    /// Defaults to 5 seconds.
    pub poll_interval: Option<Duration>,
}

/// Fetches app runtime logs by polling the log-fetch service.
///
/// Resumption uses the server-issued page token when one has been seen,
/// falling back to an `afterDate` derived from the highest accepted
/// timestamp. Records already accepted are deduplicated by server ID.
pub struct PollingAppLogProvider {
    api: Arc<dyn FetchApi>,
    project_id: String,
    app_id: String,
    follow: bool,
    run_id: Option<String>,
    container_id: Option<String>,
    stream: Option<String>,
    search_term: Option<String>,
    page_size: Option<i32>,
    direction: Option<String>,
    poll_interval: Duration,

    // Cursor state, one instance per collection.
    next_token: Option<String>,
    last_timestamp: Option<DateTime<Utc>>,
    seen: SeenIds,
}

impl PollingAppLogProvider {
    pub fn new(cfg: PollingAppLogProviderConfig) -> Self {
        // Matches the remote service's default for live tailing.
        let direction = cfg
            .direction
            .or_else(|| cfg.follow.then(|| "forward".to_string()));

        let last_timestamp = cfg
            .since
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Self {
            api: cfg.api,
            project_id: cfg.project_id,
            app_id: cfg.app_id,
            follow: cfg.follow,
            run_id: cfg.run_id,
            container_id: cfg.container_id,
            stream: cfg.stream,
            search_term: cfg.search_term,
            page_size: cfg.page_size,
            direction,
            poll_interval: cfg.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            next_token: None,
            last_timestamp,
            seen: SeenIds::new(MAX_RECORDS_IN_MEMORY * 2),
        }
    }

    fn build_query(&self) -> AppLogQuery {
        // Token-based pagination takes precedence over the timestamp
        // watermark; never send both.
        let after_date = if self.next_token.is_none() {
            self.last_timestamp
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        } else {
            None
        };

        AppLogQuery {
            after_date,
            next_token: self.next_token.clone(),
            page_size: self.page_size,
            direction: self.direction.clone(),
            search_term: self.search_term.clone(),
            stream: self.stream.clone(),
            run_id: self.run_id.clone(),
            container_id: self.container_id.clone(),
        }
    }

    async fn fetch_once(&mut self, sink: &mut dyn BatchSink) -> Result<(), CollectError> {
        let query = self.build_query();

        debug!(
            project_id = %self.project_id,
            app_id = %self.app_id,
            next_token = ?query.next_token,
            after_date = ?query.after_date,
            "Polling app logs"
        );

        let resp = self
            .api
            .fetch_app_logs(&self.project_id, &self.app_id, &query)
            .await?;

        let mut accepted = Vec::with_capacity(resp.logs.len());
        let mut accepted_ids = Vec::with_capacity(resp.logs.len());
        let mut duplicates = 0usize;

        for item in resp.logs {
            if self.seen.contains(&item.log_id) {
                duplicates += 1;
                continue;
            }

            // Unparseable timestamps substitute "now" rather than
            // failing the whole batch.
            let timestamp = DateTime::parse_from_rfc3339(&item.timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            // The watermark only ever advances; out-of-order delivery
            // must not regress the afterDate cursor.
            if self.last_timestamp.map_or(true, |last| timestamp > last) {
                self.last_timestamp = Some(timestamp);
            }

            let mut metadata = HashMap::new();
            metadata.insert("runID".to_string(), serde_json::json!(item.run_id));
            metadata.insert(
                "containerID".to_string(),
                serde_json::json!(item.container_id),
            );
            metadata.insert(
                "containerName".to_string(),
                serde_json::json!(item.container_name),
            );
            metadata.insert(
                "lineNumber".to_string(),
                serde_json::json!(item.line_number),
            );

            accepted_ids.push(item.log_id.clone());
            accepted.push(LogRecord {
                id: item.log_id,
                timestamp,
                content: item.log_line,
                stream: StreamKind::parse(&item.stream),
                metadata,
            });
        }

        self.seen.record_batch(&accepted_ids);

        if let Some(token) = resp.next_page_token {
            self.next_token = Some(token);
        }

        if !accepted.is_empty() || duplicates > 0 {
            debug!(
                accepted = accepted.len(),
                duplicates,
                has_more = resp.has_more,
                "Processed app log fetch"
            );
        }

        deliver_batch(sink, accepted).await
    }
}

#[async_trait]
impl LogProvider for PollingAppLogProvider {
    async fn collect(
        &mut self,
        cancel: CancellationToken,
        sink: &mut dyn BatchSink,
    ) -> Result<(), CollectError> {
        if !self.follow {
            return tokio::select! {
                _ = cancel.cancelled() => Err(CollectError::Cancelled),
                res = self.fetch_once(sink) => res,
            };
        }

        // The first tick completes immediately, so follow mode fetches
        // right away before settling into the poll interval.
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                res = self.fetch_once(sink) => res?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, AppLogItem, AppLogsResponse, BuildLogsResponse};
    use crate::provider::SinkError;
    use std::sync::Mutex;

    /// Scripted fetch API that pops one response per call and records
    /// the queries it was given.
    struct ScriptedApi {
        responses: Mutex<Vec<AppLogsResponse>>,
        queries: Mutex<Vec<AppLogQuery>>,
    }

    impl ScriptedApi {
        fn new(mut responses: Vec<AppLogsResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<AppLogQuery> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FetchApi for ScriptedApi {
        async fn fetch_app_logs(
            &self,
            _project_id: &str,
            _app_id: &str,
            query: &AppLogQuery,
        ) -> crate::api::Result<AppLogsResponse> {
            self.queries.lock().unwrap().push(query.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ApiError::Status {
                    status: 500,
                    message: "script exhausted".to_string(),
                })
        }

        async fn fetch_build_logs(
            &self,
            _project_id: &str,
            _app_name: &str,
            _build_id: &str,
        ) -> crate::api::Result<BuildLogsResponse> {
            unimplemented!("not used by app log tests")
        }
    }

    struct VecSink {
        batches: Vec<Vec<LogRecord>>,
    }

    impl VecSink {
        fn new() -> Self {
            Self {
                batches: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl BatchSink for VecSink {
        async fn deliver(&mut self, batch: Vec<LogRecord>) -> Result<(), SinkError> {
            assert!(!batch.is_empty(), "empty batch must never be delivered");
            self.batches.push(batch);
            Ok(())
        }
    }

    struct FailSink;

    #[async_trait]
    impl BatchSink for FailSink {
        async fn deliver(&mut self, _batch: Vec<LogRecord>) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    fn item(id: &str, timestamp: &str, line: &str) -> AppLogItem {
        AppLogItem {
            log_id: id.to_string(),
            timestamp: timestamp.to_string(),
            log_line: line.to_string(),
            stream: "stdout".to_string(),
            run_id: "run-1".to_string(),
            container_id: "c-1".to_string(),
            container_name: "web-0".to_string(),
            line_number: 1,
        }
    }

    fn response(logs: Vec<AppLogItem>, token: Option<&str>) -> AppLogsResponse {
        AppLogsResponse {
            logs,
            next_page_token: token.map(|t| t.to_string()),
            has_more: false,
        }
    }

    fn provider(api: Arc<ScriptedApi>, follow: bool) -> PollingAppLogProvider {
        PollingAppLogProvider::new(PollingAppLogProviderConfig {
            api,
            project_id: "p-1".to_string(),
            app_id: "a-1".to_string(),
            follow,
            since: None,
            run_id: None,
            container_id: None,
            stream: None,
            search_term: None,
            page_size: None,
            direction: None,
            poll_interval: Some(Duration::from_millis(10)),
        })
    }

    #[tokio::test]
    async fn test_one_shot_fetches_exactly_once() {
        let api = Arc::new(ScriptedApi::new(vec![response(
            vec![item("a", "2024-01-01T10:00:00Z", "hello")],
            None,
        )]));
        let mut provider = provider(api.clone(), false);
        let mut sink = VecSink::new();

        provider
            .collect(CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(api.queries().len(), 1);
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0][0].content, "hello");
        assert_eq!(sink.batches[0][0].stream, StreamKind::Stdout);
        assert_eq!(sink.batches[0][0].metadata_str("runID"), Some("run-1"));
    }

    #[tokio::test]
    async fn test_overlapping_fetches_deduplicate_by_id() {
        let mut script = vec![
            response(vec![item("a", "2024-01-01T10:00:00Z", "first")], None),
            response(
                vec![
                    item("a", "2024-01-01T10:00:00Z", "first"),
                    item("b", "2024-01-01T10:00:01Z", "second"),
                ],
                None,
            ),
        ];
        // Padding so extra poll cycles before the cancel lands fetch
        // empty pages instead of exhausting the script.
        script.extend(std::iter::repeat_with(|| response(vec![], None)).take(50));
        let api = Arc::new(ScriptedApi::new(script));
        let mut provider = provider(api.clone(), true);
        let mut sink = VecSink::new();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        // Scoped so the pinned future (and its borrow of the sink) is
        // gone before the assertions below.
        let result = {
            let collect = provider.collect(cancel, &mut sink);
            tokio::pin!(collect);

            // Let two poll cycles run, then cancel.
            tokio::select! {
                res = &mut collect => res,
                _ = tokio::time::sleep(Duration::from_millis(25)) => {
                    canceller.cancel();
                    collect.await
                }
            }
        };

        assert!(matches!(result, Err(CollectError::Cancelled)));
        // Two distinct IDs across both cycles means two accepted records.
        let total: usize = sink.batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 2);
        assert_eq!(sink.batches[0].len(), 1);
        assert_eq!(sink.batches[1].len(), 1);
        assert_eq!(sink.batches[1][0].id, "b");
    }

    #[tokio::test]
    async fn test_watermark_is_max_of_out_of_order_timestamps() {
        let api = Arc::new(ScriptedApi::new(vec![response(
            vec![
                item("b", "2024-01-01T10:00:02Z", "t2"),
                item("c", "2024-01-01T10:00:03Z", "t3"),
                item("a", "2024-01-01T10:00:01Z", "t1"),
            ],
            None,
        )]));
        let mut provider = provider(api.clone(), false);
        let mut sink = VecSink::new();

        provider
            .collect(CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(
            provider.last_timestamp.unwrap(),
            "2024-01-01T10:00:03Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_next_token_takes_precedence_over_after_date() {
        let api = Arc::new(ScriptedApi::new(vec![
            response(vec![item("a", "2024-01-01T10:00:00Z", "x")], Some("tok-1")),
            response(vec![], None),
        ]));
        let mut provider = provider(api.clone(), true);
        let mut sink = VecSink::new();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::select! {
            _ = provider.collect(cancel, &mut sink) => {}
            _ = async {
                tokio::time::sleep(Duration::from_millis(25)).await;
                canceller.cancel();
            } => {}
        }

        let queries = api.queries();
        assert!(queries.len() >= 2);
        // First fetch has neither cursor form.
        assert!(queries[0].next_token.is_none());
        assert!(queries[0].after_date.is_none());
        // After a token was issued it is used, and afterDate is withheld
        // even though the watermark has advanced.
        assert_eq!(queries[1].next_token.as_deref(), Some("tok-1"));
        assert!(queries[1].after_date.is_none());
    }

    #[tokio::test]
    async fn test_after_date_used_when_no_token() {
        let api = Arc::new(ScriptedApi::new(vec![
            response(vec![item("a", "2024-01-01T10:00:05Z", "x")], None),
            response(vec![], None),
        ]));
        let mut provider = provider(api.clone(), true);
        let mut sink = VecSink::new();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::select! {
            _ = provider.collect(cancel, &mut sink) => {}
            _ = async {
                tokio::time::sleep(Duration::from_millis(25)).await;
                canceller.cancel();
            } => {}
        }

        let queries = api.queries();
        assert!(queries.len() >= 2);
        assert_eq!(queries[1].after_date.as_deref(), Some("2024-01-01T10:00:05Z"));
    }

    #[tokio::test]
    async fn test_unparseable_timestamp_substitutes_now() {
        let before = Utc::now();
        let api = Arc::new(ScriptedApi::new(vec![response(
            vec![item("a", "garbage", "x")],
            None,
        )]));
        let mut provider = provider(api, false);
        let mut sink = VecSink::new();

        provider
            .collect(CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.batches.len(), 1);
        assert!(sink.batches[0][0].timestamp >= before);
    }

    #[tokio::test]
    async fn test_sink_error_stops_collection() {
        let api = Arc::new(ScriptedApi::new(vec![response(
            vec![item("a", "2024-01-01T10:00:00Z", "x")],
            None,
        )]));
        let mut provider = provider(api.clone(), true);

        let result = provider
            .collect(CancellationToken::new(), &mut FailSink)
            .await;

        assert!(matches!(result, Err(CollectError::Sink(_))));
        // No further fetches after the sink error.
        assert_eq!(api.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_since_seeds_the_watermark() {
        let api = Arc::new(ScriptedApi::new(vec![response(vec![], None)]));
        let mut provider = PollingAppLogProvider::new(PollingAppLogProviderConfig {
            api: api.clone(),
            project_id: "p-1".to_string(),
            app_id: "a-1".to_string(),
            follow: false,
            since: Some("2024-01-01T09:00:00Z".to_string()),
            run_id: None,
            container_id: None,
            stream: None,
            search_term: None,
            page_size: None,
            direction: None,
            poll_interval: None,
        });
        let mut sink = VecSink::new();

        provider
            .collect(CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(
            api.queries()[0].after_date.as_deref(),
            Some("2024-01-01T09:00:00Z")
        );
        // Empty fetch: no batch delivered.
        assert!(sink.batches.is_empty());
    }

    #[tokio::test]
    async fn test_follow_defaults_direction_forward() {
        let api = Arc::new(ScriptedApi::new(vec![response(vec![], None)]));
        let provider = provider(api, true);
        assert_eq!(provider.direction.as_deref(), Some("forward"));
    }
}
