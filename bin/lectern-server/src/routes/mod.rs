//! Axum router construction.
//!
//! [`build`] assembles the application router:
//! - Middleware layers (CORS, per-request trace id)
//! - Optional OpenAPI document (disable with `LECTERN_ENABLE_DOCS=false`)
//! - Health / heartbeat route
//! - Job API under `/v1`

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Json, Router};

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router());

    if state.config.enable_docs {
        let api_doc = doc::get_docs();
        app = app.route(
            "/api-docs/openapi.json",
            get(move || {
                let api_doc = api_doc.clone();
                async move { Json(api_doc) }
            }),
        );
    }

    app.layer(cors::cors_layer(&state))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::response::Response;
    use lectern_core::{
        BackendAdapter, BackendOutput, BackendRequest, BackendResult, Dispatcher, JobInput,
        JobKind, PoolConfig, Segment, Transcript,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::{Config, GENERATION_CLASS, TRANSCRIPTION_CLASS};

    const MCQ_REPLY: &str = r#"Here are your questions:
{"mcqs": [{"question": "What is 2+2?", "options": ["1", "2", "3", "4"], "answer": "4"}]}"#;

    struct FakeWhisper;

    #[async_trait]
    impl BackendAdapter for FakeWhisper {
        fn name(&self) -> &str {
            "fake.whisper"
        }

        fn capability(&self) -> JobKind {
            JobKind::Transcription
        }

        async fn invoke(&self, _request: BackendRequest) -> BackendResult {
            Ok(BackendOutput::Transcript(Transcript {
                text: "hello".into(),
                segments: vec![Segment {
                    start: 0.0,
                    end: 1.0,
                    text: "hello".into(),
                }],
            }))
        }
    }

    /// Replies with an MCQ set, or hangs for prompts containing `hang`.
    struct FakeOllama;

    #[async_trait]
    impl BackendAdapter for FakeOllama {
        fn name(&self) -> &str {
            "fake.ollama"
        }

        fn capability(&self) -> JobKind {
            JobKind::Generation
        }

        async fn invoke(&self, request: BackendRequest) -> BackendResult {
            if let JobInput::Prompt(prompt) = &request.input {
                if prompt.contains("hang") {
                    std::future::pending::<()>().await;
                }
            }
            Ok(BackendOutput::Text(MCQ_REPLY.into()))
        }
    }

    fn app_with(generation_pool: PoolConfig) -> Router {
        let dispatcher = Dispatcher::builder()
            .backend(
                TRANSCRIPTION_CLASS,
                PoolConfig::local_compute(),
                Arc::new(FakeWhisper),
            )
            .backend(GENERATION_CLASS, generation_pool, Arc::new(FakeOllama))
            .start()
            .unwrap();
        build(Arc::new(AppState {
            config: Arc::new(Config::default()),
            dispatcher,
        }))
    }

    fn app() -> Router {
        app_with(PoolConfig::network())
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_for_status(app: &Router, id: &str, wanted: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let response = send(app, Method::GET, &format!("/v1/jobs/{id}"), None).await;
                assert_eq!(response.status(), StatusCode::OK);
                let job = json_body(response).await;
                if job["status"] == wanted {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach the expected status")
    }

    #[tokio::test]
    async fn health_route_reports_ok_and_echoes_trace_id() {
        let app = app();
        let response = send(&app, Method::GET, "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(trace::X_TRACE_ID));
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let app = app();
        let response = send(&app, Method::GET, "/api-docs/openapi.json", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let doc = json_body(response).await;
        assert!(doc["paths"]["/v1/jobs/{id}"].is_object());
    }

    #[tokio::test]
    async fn transcription_round_trip() {
        let app = app();
        let media = std::env::temp_dir().join("lectern-route-test.mp4");
        let response = send(
            &app,
            Method::POST,
            "/v1/transcriptions",
            Some(json!({ "media_path": PathBuf::from(&media) })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let id = json_body(response).await["id"].as_str().unwrap().to_owned();

        let job = wait_for_status(&app, &id, "succeeded").await;
        assert_eq!(job["kind"], "transcription");
        assert_eq!(job["attempt_count"], 1);
        assert_eq!(job["result"]["type"], "transcript");
        assert_eq!(job["result"]["value"]["text"], "hello");
        assert_eq!(job["result"]["value"]["segments"][0]["end"], 1.0);
    }

    #[tokio::test]
    async fn generation_result_is_extracted_json() {
        let app = app();
        let response = send(
            &app,
            Method::POST,
            "/v1/generations",
            Some(json!({ "prompt": "Write a quiz", "max_attempts": 2 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let id = json_body(response).await["id"].as_str().unwrap().to_owned();

        let job = wait_for_status(&app, &id, "succeeded").await;
        assert_eq!(job["max_attempts"], 2);
        assert_eq!(job["result"]["value"]["mcqs"][0]["answer"], "4");
    }

    #[tokio::test]
    async fn mcq_request_submits_one_job_per_segment() {
        let app = app();
        let transcript = (0..25).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let response = send(
            &app,
            Method::POST,
            "/v1/generations/mcq",
            Some(json!({ "transcript": transcript, "words_per_segment": 10 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let ids = json_body(response).await["ids"].as_array().unwrap().clone();
        assert_eq!(ids.len(), 3);

        for id in &ids {
            let job = wait_for_status(&app, id.as_str().unwrap(), "succeeded").await;
            assert_eq!(job["result"]["value"]["mcqs"].as_array().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn rejected_mcq_batch_cancels_admitted_segments() {
        // Room for two jobs; the third segment is turned away.
        let app = app_with(PoolConfig::new(1, 1));
        let transcript = (0..25).map(|i| format!("hang{i}")).collect::<Vec<_>>().join(" ");
        let response = send(
            &app,
            Method::POST,
            "/v1/generations/mcq",
            Some(json!({ "transcript": transcript, "words_per_segment": 10 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = send(&app, Method::GET, "/v1/jobs", None).await;
        let jobs = json_body(response).await;
        let jobs = jobs.as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job["status"] == "cancelled"));

        // The slots are free again once the cancelled attempts wind down.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let response =
                    send(&app, Method::POST, "/v1/generations", Some(json!({ "prompt": "hang" })))
                        .await;
                if response.status() == StatusCode::ACCEPTED {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("admission slots were not released");
    }

    #[tokio::test]
    async fn invalid_bodies_are_bad_requests() {
        let app = app();
        let response = send(&app, Method::POST, "/v1/generations", Some(json!({ "prompt": "" }))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            Method::POST,
            "/v1/generations",
            Some(json!({ "prompt": "hi", "max_attempts": 0 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            Method::POST,
            "/v1/generations/mcq",
            Some(json!({ "transcript": "   " })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app, Method::GET, "/v1/jobs/not-a-uuid", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app, Method::GET, "/v1/jobs?status=sleeping", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let app = app();
        let uri = format!("/v1/jobs/{}", lectern_core::JobId::new());
        let response = send(&app, Method::GET, &uri, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn overloaded_generation_class_returns_503() {
        let app = app_with(PoolConfig::new(1, 0));
        let hang = json!({ "prompt": "please hang" });

        let response = send(&app, Method::POST, "/v1/generations", Some(hang.clone())).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let response = send(&app, Method::POST, "/v1/generations", Some(hang)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn cancel_then_acknowledge() {
        let app = app();
        let response = send(
            &app,
            Method::POST,
            "/v1/generations",
            Some(json!({ "prompt": "hang forever" })),
        )
        .await;
        let id = json_body(response).await["id"].as_str().unwrap().to_owned();
        wait_for_status(&app, &id, "running").await;

        let response = send(&app, Method::DELETE, &format!("/v1/jobs/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&app, Method::POST, &format!("/v1/jobs/{id}/cancel"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "cancelled");

        let response = send(&app, Method::GET, "/v1/jobs?status=cancelled", None).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

        let response = send(&app, Method::DELETE, &format!("/v1/jobs/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&app, Method::GET, &format!("/v1/jobs/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
