#![allow(dead_code)]

use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::{net::TcpListener, task::JoinHandle};

pub const MOCK_API_KEY: &str = "sk-mock";

/// Local stand-in for the hosted embedding APIs so tests never leave the
/// machine.
///
/// - `POST /v1/embeddings` answers in the OpenAI/Mistral shape.
/// - `POST /v1/embedding/text` answers in the Nomic shape.
/// - `POST /broken/v1/embeddings` always fails with 500.
///
/// Vectors are `[input length, 0.5, 0.25]`. Requests without the mock bearer
/// token get 401.
pub struct MockEmbeddingServer {
    pub base_url: String,
    _task: JoinHandle<()>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", MOCK_API_KEY))
}

fn vector_for(text: &str) -> Value {
    json!([text.chars().count() as f32, 0.5, 0.25])
}

impl MockEmbeddingServer {
    pub async fn start() -> Self {
        async fn openai(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
            if !authorized(&headers) {
                return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
            }
            let data: Vec<Value> = body["input"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .enumerate()
                .map(|(index, input)| {
                    json!({
                        "object": "embedding",
                        "index": index,
                        "embedding": vector_for(input.as_str().unwrap_or_default())
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({"object": "list", "model": body["model"], "data": data})),
            )
        }

        async fn nomic(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
            if !authorized(&headers) {
                return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "bad key"})));
            }
            let embeddings: Vec<Value> = body["texts"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .map(|t| vector_for(t.as_str().unwrap_or_default()))
                .collect();
            (
                StatusCode::OK,
                Json(json!({"embeddings": embeddings, "usage": {}})),
            )
        }

        async fn broken() -> impl IntoResponse {
            (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded")
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let addr: SocketAddr = listener
            .local_addr()
            .expect("failed to get mock server addr");
        let base_url = format!("http://{}", addr);

        let app = Router::new()
            .route("/v1/embeddings", post(openai))
            .route("/v1/embedding/text", post(nomic))
            .route("/broken/v1/embeddings", post(broken));

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url,
            _task: task,
        }
    }
}
