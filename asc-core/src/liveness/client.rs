//! Request/response client for the coordination server

use super::retry::{RetryPolicy, with_retry};
use super::{AgentStatus, Heartbeat, Message, heartbeat_to_status};
use crate::config::ControllerSettings;
use crate::error::{AscError, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::Span;

/// Overall timeout for a single request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling client for messages, statuses and heartbeats
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    span: Span,
}

impl CoordinatorClient {
    /// Create a client with the default timeout and retry policy.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom per-request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::default(),
            span: tracing::info_span!("coordinator_client"),
        })
    }

    /// Create a client tuned by controller settings.
    pub fn from_settings(base_url: impl Into<String>, settings: &ControllerSettings) -> Result<Self> {
        Ok(Self::with_timeout(base_url, settings.request_timeout)?.with_retry_policy(
            RetryPolicy::default()
                .with_max_retries(settings.max_retries)
                .with_base_delay(settings.retry_delay),
        ))
    }

    /// Builder: set retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Builder: set log span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Messages posted since `since`.
    pub async fn get_messages(&self, since: DateTime<Utc>) -> Result<Vec<Message>> {
        let path = format!("/messages?since={}", since.timestamp());
        self.get_json(&path).await
    }

    /// Post a message.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let body = serde_json::to_value(message)?;
        let body = &body;
        with_retry(&self.retry, &self.span, || async move {
            self.execute(Method::POST, "/messages", Some(body)).await?;
            Ok::<_, AscError>(())
        })
        .await
    }

    /// Server-side status of one agent.
    pub async fn get_agent_status(&self, name: &str) -> Result<AgentStatus> {
        let path = format!("/agents/{}/status", urlencoding::encode(name));
        self.get_json(&path).await
    }

    /// Latest heartbeat of every agent.
    pub async fn get_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        self.get_json("/heartbeats").await
    }

    /// Status of every agent with a heartbeat, with staleness applied.
    pub async fn get_all_agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> Result<Vec<AgentStatus>> {
        let heartbeats = self.get_heartbeats().await?;
        let now = Utc::now();
        Ok(heartbeats
            .iter()
            .map(|hb| heartbeat_to_status(hb, now, offline_threshold))
            .collect())
    }

    /// Status of one agent from its heartbeat.
    ///
    /// An agent without a heartbeat is reported offline and never seen; that
    /// is not an error.
    pub async fn track_agent_status(
        &self,
        name: &str,
        offline_threshold: Duration,
    ) -> Result<AgentStatus> {
        let heartbeats = self.get_heartbeats().await?;
        let now = Utc::now();

        Ok(heartbeats
            .iter()
            .find(|hb| hb.agent_name == name)
            .map(|hb| heartbeat_to_status(hb, now, offline_threshold))
            .unwrap_or_else(|| AgentStatus::never_seen(name)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        with_retry(&self.retry, &self.span, || async move {
            let response = self.execute(Method::GET, path, None).await?;
            Ok::<_, AscError>(response.json::<T>().await?)
        })
        .await
        .inspect_err(|e| tracing::warn!(parent: &self.span, path, error = %e, "request failed"))
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AscError::Http { status, body });
        }
        Ok(response)
    }
}
