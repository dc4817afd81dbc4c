use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use eventsource_stream::Eventsource;
use futures::stream::{self, StreamExt};
use orchestrator::{
    BackendConfig, DeltaStream, DescribeRequest, FileDelta, FileRequest, ModelClient, ModelError,
    ReplyRequest, TextStream,
};
use serde_json::{json, Value};
use server::{create_router, state::AppState};

/// Model double answering instantly from canned responses.
struct CannedModel {
    reply: Vec<&'static str>,
    description: String,
    files: HashMap<String, Vec<&'static str>>,
    stall_reply: bool,
}

impl CannedModel {
    fn new(files: &[(&str, Vec<&'static str>)]) -> Self {
        let names: Vec<&str> = files.iter().map(|(path, _)| *path).collect();
        Self {
            reply: vec!["Sure, ", "here is the change."],
            description: json!({"madePlan": true, "files": names}).to_string(),
            files: files
                .iter()
                .map(|(path, parts)| (path.to_string(), parts.clone()))
                .collect(),
            stall_reply: false,
        }
    }

    fn without_plan() -> Self {
        let mut model = Self::new(&[]);
        model.description = json!({"madePlan": false, "files": []}).to_string();
        model
    }

    fn stalling() -> Self {
        let mut model = Self::new(&[]);
        model.stall_reply = true;
        model
    }
}

#[async_trait]
impl ModelClient for CannedModel {
    async fn stream_reply(&self, _request: ReplyRequest) -> Result<TextStream, ModelError> {
        let parts: Vec<Result<String, ModelError>> =
            self.reply.iter().map(|p| Ok(p.to_string())).collect();
        if self.stall_reply {
            return Ok(stream::iter(parts).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(parts).boxed())
    }

    async fn describe_plan(&self, _request: DescribeRequest) -> Result<String, ModelError> {
        Ok(self.description.clone())
    }

    async fn stream_file(&self, request: FileRequest) -> Result<DeltaStream, ModelError> {
        let mut deltas: Vec<Result<FileDelta, ModelError>> = self
            .files
            .get(&request.path)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|part| Ok(FileDelta::Content(part.to_string())))
            .collect();
        deltas.push(Ok(FileDelta::Complete));
        Ok(stream::iter(deltas).boxed())
    }
}

fn setup_test_server(model: CannedModel) -> (TestServer, AppState) {
    let state = AppState::new(Arc::new(model), &BackendConfig::default());
    let app = create_router(state.clone());
    let server = TestServer::new(app).expect("Failed to create test server");
    (server, state)
}

/// Decode an SSE body into `(event, data)` pairs.
async fn sse_events(body: String) -> Vec<(String, String)> {
    stream::once(async move { Ok::<_, std::io::Error>(body) })
        .eventsource()
        .filter_map(|event| async move { event.ok() })
        .map(|event| (event.event, event.data))
        .collect()
        .await
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (server, _state) = setup_test_server(CannedModel::new(&[]));

        let response = server.get("/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["proposals"], 0);
    }

    #[tokio::test]
    async fn test_openapi_document_lists_proposal_routes() {
        let (server, _state) = setup_test_server(CannedModel::new(&[]));

        let response = server.get("/api/openapi.json").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["paths"]["/api/proposals"].is_object());
        assert!(body["paths"]["/api/proposals/{id}/abort"].is_object());
    }
}

mod proposals {
    use super::*;

    #[tokio::test]
    async fn test_create_proposal_streams_every_phase() {
        let model = CannedModel::new(&[
            ("src/a.rs", vec!["fn a() {", "}"]),
            ("src/b.rs", vec!["fn b() {}"]),
        ]);
        let (server, _state) = setup_test_server(model);

        let response = server
            .post("/api/proposals")
            .json(&json!({"prompt": "add two functions"}))
            .await;

        response.assert_status_ok();
        let events = sse_events(response.text()).await;

        assert_eq!(events[0].0, "proposal");
        let proposal_id = events[0].1.clone();
        assert_eq!(events[1], ("replying".to_string(), "Sure, ".to_string()));
        assert_eq!(
            events[2],
            ("replying".to_string(), "here is the change.".to_string())
        );
        assert_eq!(
            events[3],
            ("describing".to_string(), "@@describing@@".to_string())
        );
        let description: Value = serde_json::from_str(&events[4].1).unwrap();
        assert_eq!(description["madePlan"], true);
        assert_eq!(description["files"], json!(["src/a.rs", "src/b.rs"]));
        assert_eq!(events[5], ("building".to_string(), "@@building@@".to_string()));
        assert!(events
            .iter()
            .any(|(event, data)| event == "finished" && data == "@@finished@@"));

        let a_content: String = events
            .iter()
            .filter(|(event, _)| event == "building")
            .filter_map(|(_, data)| serde_json::from_str::<Value>(data).ok())
            .filter(|v| v["path"] == "src/a.rs" && v["content"].is_string())
            .map(|v| v["content"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(a_content, "fn a() {}");

        let statuses: Vec<Value> = events
            .iter()
            .filter_map(|(_, data)| serde_json::from_str::<Value>(data).ok())
            .filter(|v| v["status"].is_string())
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|v| v["status"] == "finished"));

        let plan: Value = server
            .get(&format!("/api/proposals/{}/plan", proposal_id))
            .await
            .json();
        assert_eq!(plan["status"], "finished");
        assert_eq!(plan["contents"]["src/b.rs"], "fn b() {}");
        assert_eq!(plan["finished"], json!(["src/a.rs", "src/b.rs"]));

        let proposal: Value = server
            .get(&format!("/api/proposals/{}", proposal_id))
            .await
            .json();
        assert_eq!(proposal["status"], "finished");
        assert_eq!(proposal["reply"], "Sure, here is the change.");
    }

    #[tokio::test]
    async fn test_revision_is_tagged_revising() {
        let (server, _state) = setup_test_server(CannedModel::new(&[("a.txt", vec!["v2"])]));

        let response = server
            .post("/api/proposals")
            .json(&json!({
                "prompt": "make it shorter",
                "parentProposalId": "previous",
                "currentPlan": {"a.txt": "v1"}
            }))
            .await;

        response.assert_status_ok();
        let events = sse_events(response.text()).await;
        assert!(events.iter().any(|(event, _)| event == "revising"));
        assert!(!events.iter().any(|(event, _)| event == "replying"));
    }

    #[tokio::test]
    async fn test_no_plan_finishes_without_building() {
        let (server, _state) = setup_test_server(CannedModel::without_plan());

        let response = server
            .post("/api/proposals")
            .json(&json!({"prompt": "just explain"}))
            .await;

        let events = sse_events(response.text()).await;
        let proposal_id = events[0].1.clone();
        assert!(!events.iter().any(|(event, _)| event == "building"));
        assert_eq!(events.last().map(|(event, _)| event.as_str()), Some("finished"));

        server
            .get(&format!("/api/proposals/{}/plan", proposal_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let proposal: Value = server
            .get(&format!("/api/proposals/{}", proposal_id))
            .await
            .json();
        assert_eq!(proposal["status"], "finished");
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let (server, _state) = setup_test_server(CannedModel::new(&[]));

        let response = server
            .post("/api/proposals")
            .json(&json!({"prompt": "   "}))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_unknown_proposal_returns_404() {
        let (server, _state) = setup_test_server(CannedModel::new(&[]));

        server
            .get("/api/proposals/missing")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .post("/api/proposals/missing/abort")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .delete("/api/proposals/missing")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_abort_and_drain_lifecycle() {
        let (server, state) = setup_test_server(CannedModel::stalling());
        let mut rx = state.event_bus.subscribe();

        let stream_request = async {
            server
                .post("/api/proposals")
                .json(&json!({"prompt": "never ends"}))
                .await
        };

        let control = async {
            let proposal_id = loop {
                let envelope = rx.recv().await.expect("event bus closed");
                if let events::Event::ProposalStarted { proposal_id, .. } = envelope.event {
                    break proposal_id;
                }
            };

            server
                .delete(&format!("/api/proposals/{}", proposal_id))
                .await
                .assert_status(StatusCode::CONFLICT);

            server
                .post(&format!("/api/proposals/{}/abort", proposal_id))
                .await
                .assert_status(StatusCode::NO_CONTENT);

            proposal_id
        };

        let (response, proposal_id) = tokio::join!(stream_request, control);

        let events = sse_events(response.text()).await;
        assert_eq!(events[0], ("proposal".to_string(), proposal_id.clone()));
        assert!(!events.iter().any(|(event, _)| event == "finished"));

        let proposal: Value = server
            .get(&format!("/api/proposals/{}", proposal_id))
            .await
            .json();
        assert_eq!(proposal["status"], "aborted");

        server
            .post(&format!("/api/proposals/{}/abort", proposal_id))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        server
            .delete(&format!("/api/proposals/{}", proposal_id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .get(&format!("/api/proposals/{}", proposal_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
