use crate::auth::{AuthError, TokenProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("log service returned status {status}: {message}")]
    Status { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Query parameters for a single app-log fetch.
///
/// `next_token` and `after_date` are the two cursor forms; the provider
/// guarantees at most one is set per request, token taking priority.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppLogQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "search")]
    pub search_term: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "container")]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppLogsResponse {
    #[serde(default)]
    pub logs: Vec<AppLogItem>,

    pub next_page_token: Option<String>,

    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppLogItem {
    pub log_id: String,
    pub timestamp: String,
    pub log_line: String,

    #[serde(default)]
    pub stream: String,

    #[serde(default)]
    pub run_id: String,

    #[serde(default)]
    pub container_id: String,

    #[serde(default)]
    pub container_name: String,

    #[serde(default)]
    pub line_number: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildLogsResponse {
    #[serde(default)]
    pub logs: Vec<BuildLogItem>,

    /// Build life-cycle status at the time of the fetch. Consulted by the
    /// build polling provider to stop once a terminal status is seen.
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildLogItem {
    /// Server-issued ID. Older backends omit it, in which case a stable
    /// ID is synthesized from `created_at` + `log`.
    #[serde(default)]
    pub id: Option<String>,

    pub created_at: String,

    pub log: String,
}

/// Request/response surface of the log-fetch service.
///
/// A trait so polling providers can be exercised against in-memory fakes,
/// the same seam the rest of the crate uses for transports.
#[async_trait]
pub trait FetchApi: Send + Sync {
    async fn fetch_app_logs(
        &self,
        project_id: &str,
        app_id: &str,
        query: &AppLogQuery,
    ) -> Result<AppLogsResponse>;

    async fn fetch_build_logs(
        &self,
        project_id: &str,
        app_name: &str,
        build_id: &str,
    ) -> Result<BuildLogsResponse>;
}

/// HTTP implementation of [`FetchApi`] against the remote log service.
pub struct HttpFetchApi {
    base_url: String,
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpFetchApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            tokens,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        url: &str,
        query: &Q,
    ) -> Result<T> {
        let token = self.tokens.bearer_token().await?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl FetchApi for HttpFetchApi {
    async fn fetch_app_logs(
        &self,
        project_id: &str,
        app_id: &str,
        query: &AppLogQuery,
    ) -> Result<AppLogsResponse> {
        let url = format!(
            "{}/v2/projects/{}/apps/{}/logs",
            self.base_url, project_id, app_id
        );
        self.get_json(&url, query).await
    }

    async fn fetch_build_logs(
        &self,
        project_id: &str,
        app_name: &str,
        build_id: &str,
    ) -> Result<BuildLogsResponse> {
        let url = format!(
            "{}/v2/projects/{}/apps/{}/builds/{}/logs",
            self.base_url, project_id, app_name, build_id
        );
        self.get_json(&url, &()).await
    }
}
