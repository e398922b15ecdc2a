//! Typed HTTP client for one agent subprocess.
//!
//! Paths are illustrative per the agent's documented contract; the behaviour
//! (health probe, session CRUD, pending permissions/questions, message
//! send/respond) is what callers depend on.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent returned HTTP {0}")]
    Http(StatusCode),

    #[error("agent request timed out")]
    Timeout,

    #[error("failed to decode agent response: {0}")]
    Decode(#[from] reqwest::Error),

    /// The session or request id the caller referenced no longer exists
    /// agent-side (HTTP 400/404 on a known id) — callers scrub local state.
    #[error("session or request {0} is gone")]
    Gone(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Busy,
    Idle,
    Question,
}

#[derive(Debug, Clone, Serialize)]
struct ModelSelector<'a> {
    #[serde(rename = "providerID")]
    provider_id: &'a str,
    #[serde(rename = "modelID")]
    model_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct MessagePart<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct SendMessageRequest<'a> {
    parts: Vec<MessagePart<'a>>,
    model: ModelSelector<'a>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageErrorData {
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageErrorEnvelope {
    data: MessageErrorData,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    error: Option<MessageErrorEnvelope>,
}

#[derive(Debug, Clone, Deserialize)]
struct SendMessageResponse {
    info: MessageInfo,
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

/// The outcome of `send_message`: concatenated text from the returned
/// parts, plus the agent-reported error message if any.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub text: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PendingPermission {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PendingQuestion {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

pub struct AgentClient {
    http: Client,
    base_url: String,
}

impl AgentClient {
    pub fn new(port: u16) -> Self {
        Self::with_timeout(port, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(port: u16, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is static and valid");
        Self {
            http,
            base_url: format!("http://127.0.0.1:{port}"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Liveness probe; a 200 response promotes the instance STARTING->RUNNING.
    /// `path` is the factory-specific health-check path (spec §4.4).
    pub async fn health(&self, path: &str) -> Result<(), AgentError> {
        let response = self.http.get(self.url(path)).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::Http(response.status()))
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, AgentError> {
        let response = self.http.get(self.url("/session")).send().await?;
        respond_json(response).await
    }

    pub async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<Session, AgentError> {
        #[derive(Serialize)]
        struct Body<'a> {
            #[serde(rename = "parentID", skip_serializing_if = "Option::is_none")]
            parent_id: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            title: Option<&'a str>,
        }
        let response = self
            .http
            .post(self.url("/session"))
            .json(&Body { parent_id, title })
            .send()
            .await?;
        respond_json(response).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        let response = self
            .http
            .delete(self.url(&format!("/session/{session_id}")))
            .send()
            .await?;
        respond_empty(response, session_id).await
    }

    pub async fn session_status(
        &self,
    ) -> Result<std::collections::HashMap<String, SessionStatus>, AgentError> {
        let response = self.http.get(self.url("/session/status")).send().await?;
        respond_json(response).await
    }

    pub async fn list_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ResponsePart>, AgentError> {
        let response = self
            .http
            .get(self.url(&format!("/session/{session_id}/message?limit={limit}")))
            .send()
            .await?;
        respond_json(response).await
    }

    /// Sends a prompt and blocks for the agent's response (subject to the
    /// client's configured timeout). Session id is preserved by the caller
    /// on a timeout; this method surfaces the timeout as an error only.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        provider_id: &str,
        model_id: &str,
    ) -> Result<AgentReply, AgentError> {
        let body = SendMessageRequest {
            parts: vec![MessagePart {
                kind: "text",
                text,
            }],
            model: ModelSelector {
                provider_id,
                model_id,
            },
        };
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/message")))
            .json(&body)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { AgentError::Timeout } else { e.into() })?;

        if response.status() == StatusCode::BAD_REQUEST || response.status() == StatusCode::NOT_FOUND
        {
            return Err(AgentError::Gone(session_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(AgentError::Http(response.status()));
        }

        let parsed: SendMessageResponse = response.json().await?;
        let text = parsed
            .parts
            .iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        Ok(AgentReply {
            text,
            error: parsed.info.error.map(|e| e.data.message),
        })
    }

    pub async fn list_pending_permissions(&self) -> Result<Vec<PendingPermission>, AgentError> {
        let response = self
            .http
            .get(self.url("/session/pending-permissions"))
            .send()
            .await?;
        respond_json(response).await
    }

    pub async fn list_pending_questions(&self) -> Result<Vec<PendingQuestion>, AgentError> {
        let response = self
            .http
            .get(self.url("/session/pending-questions"))
            .send()
            .await?;
        respond_json(response).await
    }

    pub async fn reply_permission(&self, request_id: &str, reply: &str) -> Result<(), AgentError> {
        #[derive(Serialize)]
        struct Body<'a> {
            reply: &'a str,
        }
        let response = self
            .http
            .post(self.url(&format!("/permission/{request_id}/reply")))
            .json(&Body { reply })
            .send()
            .await?;
        respond_empty(response, request_id).await
    }

    pub async fn respond_question(
        &self,
        request_id: &str,
        answers: Vec<Vec<String>>,
    ) -> Result<(), AgentError> {
        #[derive(Serialize)]
        struct Body {
            answers: Vec<Vec<String>>,
        }
        let response = self
            .http
            .post(self.url(&format!("/question/{request_id}/respond")))
            .json(&Body { answers })
            .send()
            .await?;
        respond_empty(response, request_id).await
    }
}

async fn respond_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AgentError> {
    if !response.status().is_success() {
        return Err(AgentError::Http(response.status()));
    }
    Ok(response.json().await?)
}

async fn respond_empty(response: reqwest::Response, gone_id: &str) -> Result<(), AgentError> {
    match response.status() {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Err(AgentError::Gone(gone_id.to_string())),
        status if status.is_success() => Ok(()),
        status => Err(AgentError::Http(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> AgentClient {
        let port: u16 = server.uri().rsplit(':').next().unwrap().parse().unwrap();
        AgentClient::new(port)
    }

    #[tokio::test]
    async fn health_ok_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/global/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.health("/global/health").await.is_ok());
    }

    #[tokio::test]
    async fn health_errors_on_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/global/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.health("/global/health").await.unwrap_err();
        assert!(matches!(err, AgentError::Http(StatusCode::SERVICE_UNAVAILABLE)));
    }

    #[tokio::test]
    async fn send_message_concatenates_text_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/s1/message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "info": {},
                "parts": [
                    {"type": "text", "text": "hello "},
                    {"type": "text", "text": "world"},
                    {"type": "tool", "text": "ignored"},
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let reply = client
            .send_message("s1", "hi", "deepseek", "deepseek-reasoner")
            .await
            .unwrap();
        assert_eq!(reply.text, "hello world");
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn send_message_on_404_reports_session_gone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/stale/message"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .send_message("stale", "hi", "deepseek", "deepseek-reasoner")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Gone(id) if id == "stale"));
    }

    #[tokio::test]
    async fn list_pending_permissions_decodes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/pending-permissions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "r1", "sessionID": "s1", "permission": "bash", "patterns": ["rm -rf /"]}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let pending = client.list_pending_permissions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "r1");
        assert_eq!(pending[0].patterns, vec!["rm -rf /"]);
    }

    #[tokio::test]
    async fn reply_permission_posts_reply_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/permission/r1/reply"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.reply_permission("r1", "always").await.is_ok());
    }
}
