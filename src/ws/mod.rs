use crate::auth::{AuthError, TokenProvider};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// How often we send ping frames to keep the connection alive.
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// How long we wait for a response frame past the ping interval before
/// considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("websocket dial failed: {0}")]
    Dial(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("read error: {0}")]
    Read(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("no frame received within the liveness window")]
    Stalled,

    #[error("connection closed abnormally (code {code})")]
    AbnormalClose { code: u16 },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Which log stream to subscribe to.
#[derive(Debug, Clone)]
pub enum StreamScope {
    App { project_id: String, app_id: String },
    Build { project_id: String, build_id: String },
}

impl StreamScope {
    pub fn project_id(&self) -> &str {
        match self {
            StreamScope::App { project_id, .. } | StreamScope::Build { project_id, .. } => {
                project_id
            }
        }
    }

    /// The entity the subscription is keyed on: app id or build id.
    pub fn entity_id(&self) -> &str {
        match self {
            StreamScope::App { app_id, .. } => app_id,
            StreamScope::Build { build_id, .. } => build_id,
        }
    }

    fn endpoint_path(&self) -> &'static str {
        match self {
            StreamScope::App { .. } => "/ws-logs",
            StreamScope::Build { .. } => "/ws-build-logs",
        }
    }

    fn entity_param(&self) -> &'static str {
        match self {
            StreamScope::App { .. } => "appID",
            StreamScope::Build { .. } => "buildID",
        }
    }
}

/// Subscribe handshake parameters for one connection session.
#[derive(Debug, Clone)]
pub struct SubscribeParams {
    pub scope: StreamScope,

    /// Replay boundary sent at connect time; covers the handshake gap.
    pub since: Option<DateTime<Utc>>,

    pub run_id: Option<String>,
    pub container_id: Option<String>,
}

/// One inbound pushed log message, already JSON-decoded.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub entity_id: String,
    pub sub_id: String,
    pub timestamp: DateTime<Utc>,
    pub stream: String,
    pub content: String,
    pub line_number: i64,
    pub stage: String,
    pub container_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStreamMessage {
    #[serde(default, alias = "appID", alias = "buildID")]
    entity_id: String,

    #[serde(default, alias = "runID")]
    sub_id: String,

    #[serde(default)]
    timestamp: String,

    #[serde(default)]
    stream: String,

    #[serde(default, alias = "log")]
    content: String,

    #[serde(default)]
    line_number: i64,

    #[serde(default)]
    stage: String,

    #[serde(default)]
    container_name: String,
}

impl From<RawStreamMessage> for StreamMessage {
    fn from(raw: RawStreamMessage) -> Self {
        // Unparseable timestamps substitute "now" rather than dropping
        // the message.
        let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Self {
            entity_id: raw.entity_id,
            sub_id: raw.sub_id,
            timestamp,
            stream: raw.stream,
            content: raw.content,
            line_number: raw.line_number,
            stage: raw.stage,
            container_name: raw.container_name,
        }
    }
}

/// An established stream session.
#[async_trait]
pub trait StreamConnection: Send {
    /// Read the next pushed message. `Ok(None)` means the server closed
    /// the connection cleanly; any error means connection loss.
    async fn next_message(&mut self) -> Result<Option<StreamMessage>>;

    /// Best-effort clean close frame, sent before abandoning the session.
    async fn close(&mut self);
}

/// Dials one connection session. A trait so the streaming provider's
/// reconnect behavior can be exercised without real sockets.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, params: &SubscribeParams) -> Result<Box<dyn StreamConnection>>;
}

/// WebSocket implementation of [`StreamConnector`] against the remote
/// log-stream service.
pub struct WsConnector {
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            base_url: base_url.into(),
            tokens,
        }
    }

    async fn build_url(&self, params: &SubscribeParams) -> Result<Url> {
        let token = self.tokens.bearer_token().await?;

        let mut url = Url::parse(&self.base_url)?;
        url.set_path(params.scope.endpoint_path());

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("projectID", params.scope.project_id());
            query.append_pair(params.scope.entity_param(), params.scope.entity_id());
            query.append_pair("token", &token);

            if let Some(since) = params.since {
                query.append_pair(
                    "after",
                    &since.to_rfc3339_opts(SecondsFormat::Nanos, true),
                );
            }
            if let Some(run_id) = &params.run_id {
                query.append_pair("runID", run_id);
            }
            if let Some(container_id) = &params.container_id {
                query.append_pair("containerID", container_id);
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, params: &SubscribeParams) -> Result<Box<dyn StreamConnection>> {
        let url = self.build_url(params).await?;

        tracing::debug!(
            endpoint = params.scope.endpoint_path(),
            project_id = params.scope.project_id(),
            entity_id = params.scope.entity_id(),
            "Connecting to log stream"
        );

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(StreamError::Dial)?;

        tracing::info!(
            project_id = params.scope.project_id(),
            entity_id = params.scope.entity_id(),
            "Connected to log stream"
        );

        let mut ping = tokio::time::interval(PING_INTERVAL);
        // The first tick fires immediately; skip it so the read loop
        // does not start with a ping before the server says anything.
        ping.reset();

        Ok(Box::new(WsStreamConnection {
            ws,
            ping,
            liveness_window: PING_INTERVAL + PONG_TIMEOUT,
            last_inbound: tokio::time::Instant::now(),
        }))
    }
}

struct WsStreamConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ping: tokio::time::Interval,
    liveness_window: Duration,
    /// When the last inbound frame of any kind arrived. Outbound pings
    /// must not refresh this; a dead peer would otherwise never be
    /// noticed.
    last_inbound: tokio::time::Instant,
}

#[async_trait]
impl StreamConnection for WsStreamConnection {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        loop {
            tokio::select! {
                _ = self.ping.tick() => {
                    // A failed ping write means the connection is gone.
                    self.ws
                        .send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(StreamError::Read)?;
                }

                _ = tokio::time::sleep_until(self.last_inbound + self.liveness_window) => {
                    return Err(StreamError::Stalled);
                }

                frame = self.ws.next() => {
                    self.last_inbound = tokio::time::Instant::now();

                    match frame {
                        None => return Ok(None),
                        Some(Err(e)) => return Err(StreamError::Read(e)),
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<RawStreamMessage>(text.as_str()) {
                                Ok(raw) => return Ok(Some(raw.into())),
                                Err(e) => {
                                    tracing::warn!(error = %e, "Failed to parse stream message");
                                    continue;
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame
                                .map(|f| u16::from(f.code))
                                .unwrap_or_else(|| CloseCode::Normal.into());
                            return match CloseCode::from(code) {
                                CloseCode::Normal | CloseCode::Away => Ok(None),
                                _ => Err(StreamError::AbnormalClose { code }),
                            };
                        }
                        // Pings are answered by the protocol layer; pongs
                        // count as inbound activity just by arriving.
                        Some(Ok(_)) => continue,
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
