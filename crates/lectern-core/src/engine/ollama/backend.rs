use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::runtime::backend::protocol::{
    BackendAdapter, BackendFailure, BackendOutput, BackendRequest, BackendResult,
};
use crate::runtime::types::{JobInput, JobKind};

/// Longest response-body excerpt kept in failure messages.
const BODY_EXCERPT: usize = 512;

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Server root, e.g. `http://localhost:11434`.
    pub base_url: String,
    pub model: String,
    pub connect_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            model: "mistral".to_owned(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationBackendError {
    #[error("invalid Ollama base URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// [`BackendAdapter`] calling Ollama's non-streaming `/api/generate`.
#[derive(Debug, Clone)]
pub struct RemoteGenerationBackend {
    client: Client,
    endpoint: Url,
    model: String,
}

impl RemoteGenerationBackend {
    pub fn init(config: OllamaConfig) -> Result<Self, GenerationBackendError> {
        let invalid = |reason: String| GenerationBackendError::InvalidUrl {
            url: config.base_url.clone(),
            reason,
        };
        let mut base = Url::parse(&config.base_url).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("not a base URL".into()));
        }
        // Keep any path prefix (a reverse proxy mount) when joining.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("api/generate")
            .map_err(|e| invalid(e.to_string()))?;

        let client = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .build()?;

        info!(endpoint = %endpoint, model = %config.model, "ollama backend ready");
        Ok(Self {
            client,
            endpoint,
            model: config.model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn excerpt(body: &str) -> &str {
    let mut end = body.len().min(BODY_EXCERPT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].trim()
}

fn transport_failure(err: reqwest::Error) -> BackendFailure {
    if err.is_timeout() {
        BackendFailure::timeout(format!("ollama request timed out: {err}"))
    } else if err.is_connect() {
        BackendFailure::unavailable(format!("ollama unreachable: {err}"))
    } else {
        BackendFailure::unavailable(format!("ollama request failed: {err}"))
    }
}

fn status_failure(status: StatusCode, body: &str) -> BackendFailure {
    let message = format!("ollama returned {status}: {}", excerpt(body));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackendFailure::unavailable(message)
    } else if status.is_client_error() {
        BackendFailure::invalid_input(message)
    } else {
        BackendFailure::internal(message)
    }
}

#[async_trait]
impl BackendAdapter for RemoteGenerationBackend {
    fn name(&self) -> &str {
        "ollama.generate"
    }

    fn capability(&self) -> JobKind {
        JobKind::Generation
    }

    async fn invoke(&self, request: BackendRequest) -> BackendResult {
        let prompt = match &request.input {
            JobInput::Prompt(prompt) if prompt.trim().is_empty() => {
                return Err(BackendFailure::invalid_input("prompt is empty"));
            }
            JobInput::Prompt(prompt) => prompt.as_str(),
            other => {
                return Err(BackendFailure::invalid_input(format!(
                    "generation needs a prompt, got {} input",
                    other.kind()
                )));
            }
        };

        debug!(
            job_id = %request.job_id,
            attempt = request.attempt,
            model = %self.model,
            prompt_len = prompt.len(),
            "calling ollama"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(request.timeout)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_failure)?;
        if !status.is_success() {
            return Err(status_failure(status, &body));
        }

        let decoded: GenerateResponse = serde_json::from_str(&body).map_err(|e| {
            BackendFailure::internal(format!("undecodable ollama response: {e}"))
        })?;
        Ok(BackendOutput::Text(decoded.response))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::runtime::backend::protocol::FailureKind;
    use crate::runtime::types::{JobId, MediaRef};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn backend(base_url: String) -> RemoteGenerationBackend {
        RemoteGenerationBackend::init(OllamaConfig {
            base_url,
            model: "mistral".into(),
            connect_timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    fn prompt(text: &str, timeout: Duration) -> BackendRequest {
        BackendRequest {
            job_id: JobId::new(),
            input: JobInput::Prompt(text.into()),
            timeout,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn returns_response_field() {
        let router = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "mistral");
                assert_eq!(body["stream"], false);
                let echoed = format!("Sure! {{\"prompt\": \"{}\"}}", body["prompt"].as_str().unwrap_or(""));
                Json(json!({ "model": "mistral", "response": echoed, "done": true }))
            }),
        );
        let backend = backend(serve(router).await);

        let output = backend
            .invoke(prompt("hello", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(
            output,
            BackendOutput::Text("Sure! {\"prompt\": \"hello\"}".into())
        );
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let router = Router::new().route(
            "/api/generate",
            post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "loading model") }),
        );
        let err = backend(serve(router).await)
            .invoke(prompt("hello", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Unavailable);
        assert!(err.message.contains("loading model"));
    }

    #[tokio::test]
    async fn client_error_is_invalid_input() {
        let router = Router::new().route(
            "/api/generate",
            post(|| async { (AxumStatus::NOT_FOUND, "{\"error\":\"model 'mistral' not found\"}") }),
        );
        let err = backend(serve(router).await)
            .invoke(prompt("hello", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);
    }

    #[tokio::test]
    async fn undecodable_body_is_internal() {
        let router = Router::new().route("/api/generate", post(|| async { "not json" }));
        let err = backend(serve(router).await)
            .invoke(prompt("hello", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Internal);
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let router = Router::new().route(
            "/api/generate",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "response": "late" }))
            }),
        );
        let err = backend(serve(router).await)
            .invoke(prompt("hello", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = backend(format!("http://{addr}"))
            .invoke(prompt("hello", Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Unavailable);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_locally() {
        let backend = backend("http://127.0.0.1:9".into());
        let err = backend
            .invoke(prompt("   ", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);

        let err = backend
            .invoke(BackendRequest {
                job_id: JobId::new(),
                input: JobInput::Media(MediaRef::from("a.mp4")),
                timeout: Duration::from_secs(1),
                attempt: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);
    }

    #[tokio::test]
    async fn base_url_path_prefix_is_kept() {
        let router = Router::new().route(
            "/ollama/api/generate",
            post(|| async { Json(json!({ "response": "{}" })) }),
        );
        let base = serve(router).await;
        for base_url in [format!("{base}/ollama"), format!("{base}/ollama/")] {
            let backend = backend(base_url);
            assert_eq!(backend.endpoint.path(), "/ollama/api/generate");
            let output = backend
                .invoke(prompt("hello", Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(output, BackendOutput::Text("{}".into()));
        }
        assert_eq!(
            backend("http://localhost:11434".into()).endpoint.as_str(),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn rejects_unparsable_base_url() {
        let err = RemoteGenerationBackend::init(OllamaConfig {
            base_url: "not a url".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, GenerationBackendError::InvalidUrl { .. }));
    }
}
