//! HTTP client for the task CRUD and transcript APIs.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use crate::api::{ContinueRequest, ContinueResponse, StatusReport, TaskApi, TranscriptApi};
use crate::config::RelayConfig;
use crate::error::ApiError;
use crate::task::{SessionId, Task, TaskDraft, TaskId};
use crate::transcript::RawEvent;
use crate::util::parse_base_url;

#[derive(Deserialize)]
struct MessagesEnvelope {
    #[serde(default)]
    messages: Vec<RawEvent>,
}

/// Thin wrapper around the runtime's REST API.
#[derive(Clone)]
pub struct HttpApi {
    pub base_url: Url,
    token: Option<String>,
    http_client: HttpClient,
}

impl HttpApi {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        Ok(HttpApi {
            base_url: parse_base_url(base_url)?,
            token: token.filter(|token| !token.trim().is_empty()),
            http_client: HttpClient::new(),
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Self::new(&config.api_base_url, config.api_token.clone())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base url {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn builder(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http_client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request and return the body of a successful response.
    async fn request(&self, builder: RequestBuilder, what: &str) -> Result<String, ApiError> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("send {what} request"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("read {what} response"))?;
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<T, ApiError> {
        let text = self.request(builder, what).await?;
        let value = serde_json::from_str(&text)
            .with_context(|| format!("decode {what} response"))?;
        Ok(value)
    }
}

#[async_trait]
impl TaskApi for HttpApi {
    async fn list(&self) -> Result<Vec<Task>, ApiError> {
        let url = self.endpoint(&["tasks"])?;
        self.request_json(self.builder(Method::GET, url), "list tasks")
            .await
    }

    async fn create(&self, draft: &TaskDraft) -> Result<Task, ApiError> {
        let url = self.endpoint(&["tasks"])?;
        let builder = self.builder(Method::POST, url).json(draft);
        self.request_json(builder, "create task").await
    }

    async fn update(&self, id: &TaskId, draft: &TaskDraft) -> Result<Task, ApiError> {
        let url = self.endpoint(&["tasks", id.as_str()])?;
        let builder = self.builder(Method::PUT, url).json(draft);
        self.request_json(builder, &format!("update task {id}"))
            .await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), ApiError> {
        let url = self.endpoint(&["tasks", id.as_str()])?;
        self.request(self.builder(Method::DELETE, url), &format!("delete task {id}"))
            .await?;
        Ok(())
    }

    async fn status(&self, id: &TaskId) -> Result<StatusReport, ApiError> {
        let url = self.endpoint(&["tasks", id.as_str(), "status"])?;
        self.request_json(self.builder(Method::GET, url), &format!("status of task {id}"))
            .await
    }

    async fn persist_session(&self, id: &TaskId, session_id: &SessionId) -> Result<(), ApiError> {
        let url = self.endpoint(&["tasks", id.as_str()])?;
        let builder = self
            .builder(Method::PATCH, url)
            .json(&json!({ "sessionId": session_id }));
        self.request(builder, &format!("persist session of task {id}"))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TranscriptApi for HttpApi {
    async fn messages(
        &self,
        container_path: &str,
        session_id: &SessionId,
    ) -> Result<Vec<RawEvent>, ApiError> {
        let mut url = self.endpoint(&["sessions", session_id.as_str(), "messages"])?;
        url.query_pairs_mut()
            .append_pair("containerPath", container_path);
        let envelope: MessagesEnvelope = self
            .request_json(
                self.builder(Method::GET, url),
                &format!("messages of session {session_id}"),
            )
            .await?;
        Ok(envelope.messages)
    }

    async fn continue_session(
        &self,
        session_id: &SessionId,
        request: &ContinueRequest,
    ) -> Result<ContinueResponse, ApiError> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "continue"])?;
        let builder = self.builder(Method::POST, url).json(request);
        self.request_json(builder, &format!("continue session {session_id}"))
            .await
    }
}
