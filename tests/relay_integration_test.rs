//! 中继 HTTP 接口集成测试

#[cfg(test)]
mod tests {
    #[cfg(feature = "server")]
    use std::sync::Arc;
    #[cfg(feature = "server")]
    use std::time::Duration;

    #[cfg(feature = "server")]
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    #[cfg(feature = "server")]
    use serde_json::{json, Value};
    #[cfg(feature = "server")]
    use sl_relay::core::DispatchError;
    #[cfg(feature = "server")]
    use sl_relay::gateway::{
        create_router, AppState, HubConfig, MemorySessionStore, RelayHub, ResponderReply,
        RouterConfig, SessionState,
    };
    #[cfg(feature = "server")]
    use sl_relay::responder::{MockResponder, ResponderAck};
    #[cfg(feature = "server")]
    use tower::ServiceExt;

    #[cfg(feature = "server")]
    const AGENT: &str = "http://agent.example/c1";

    #[cfg(feature = "server")]
    fn relay(
        script: Vec<Result<ResponderAck, DispatchError>>,
        shared_token: Option<&str>,
    ) -> (Router, Arc<RelayHub>, Arc<MockResponder>) {
        let responder = Arc::new(MockResponder::with_script(script));
        let config = HubConfig {
            router: RouterConfig::new("http://primary/chat").with_fallback("http://fallback/chat"),
            ..HubConfig::default()
        };
        let (hub, _events) = RelayHub::new(
            config,
            responder.clone(),
            Arc::new(MemorySessionStore::new()),
        );
        let app = create_router(AppState::new(
            Arc::clone(&hub),
            shared_token.map(str::to_string),
        ));
        (app, hub, responder)
    }

    #[cfg(feature = "server")]
    async fn post(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        send(app, path, body.to_string(), None).await
    }

    #[cfg(feature = "server")]
    async fn send(app: &Router, path: &str, body: String, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("x-sl-token", token);
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[cfg(feature = "server")]
    async fn wait_for_calls(responder: &MockResponder, count: usize) {
        for _ in 0..200 {
            if responder.call_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} responder calls, saw {}", count, responder.call_count());
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_health() {
        let (app, _hub, _responder) = relay(vec![], None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_dispatch_then_callback_round_trip() {
        let (app, hub, responder) = relay(vec![], None);

        let (status, registered) = post(&app, "/register", json!({ "endpoint": AGENT })).await;
        assert_eq!(status, StatusCode::OK);
        let token = registered["token"].as_str().unwrap().to_string();
        assert_eq!(registered["generation"], 1);

        let (status, accepted) = post(
            &app,
            "/dispatch",
            json!({
                "conversant_id": "c1",
                "display_name": "Avatar One",
                "endpoint": AGENT,
                "message": "one",
                "callback_token": token,
                "npc_id": "npc_7"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted["status"], "dispatched");
        let request_id = accepted["request_id"].as_str().unwrap().to_string();

        let (status, queued) = post(
            &app,
            "/dispatch",
            json!({ "conversant_id": "c1", "endpoint": AGENT, "message": "two" }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(queued["status"], "queued");

        wait_for_calls(&responder, 1).await;
        let first = &responder.calls()[0];
        assert_eq!(first.request.message, "one");
        assert_eq!(first.request.metadata.npc_id.as_deref(), Some("npc_7"));

        let (status, ack) = post(
            &app,
            "/callback",
            json!({
                "kind": "package",
                "v": 1,
                "request_id": request_id,
                "conversant_id": "c1",
                "reply_text": "hi there",
                "action_tags": [],
                "token": token
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], true);

        wait_for_calls(&responder, 2).await;
        assert_eq!(responder.calls()[1].request.message, "two");
        assert_eq!(hub.sessions().state("c1").await, SessionState::AwaitingReply);
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_malformed_callback_is_400_without_state_change() {
        let (app, hub, _responder) = relay(vec![], None);
        let (status, _) = send(&app, "/callback", "kind=package|c1|hi".to_string(), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(&app, "/callback", json!({ "kind": "pipe" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(hub.snapshot().await.outstanding, 0);
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_callback_for_unknown_request_is_ignored() {
        let (app, _hub, _responder) = relay(vec![], None);
        let (status, ack) = post(
            &app,
            "/callback",
            json!({
                "kind": "package",
                "request_id": "req_unknown",
                "conversant_id": "c1",
                "reply_text": "late",
                "token": "whatever"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], false);
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_chat_falls_back_and_replies_inline() {
        let (app, hub, responder) = relay(
            vec![
                Err(DispatchError::Upstream { status: 502 }),
                Ok(ResponderAck::Replied(ResponderReply::text("hi there"))),
            ],
            None,
        );

        let (status, body) = post(
            &app,
            "/chat",
            json!({ "conversant_id": "c1", "message": "hello" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["reply"], "hi there");
        assert_eq!(body["reply_chars"], 8);
        assert_eq!(responder.call_count(), 2);
        assert_eq!(hub.sessions().state("c1").await, SessionState::Active);
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_chat_terminal_failure_is_502_with_generic_reply() {
        let (app, _hub, _responder) = relay(
            vec![
                Err(DispatchError::Transport("refused".into())),
                Err(DispatchError::Transport("refused".into())),
            ],
            None,
        );
        let (status, body) = post(
            &app,
            "/chat",
            json!({ "conversant_id": "c1", "message": "hello" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["ok"], false);
        assert_eq!(body["reply"], "Sorry, I glitched. Try again.");
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_chat_refused_when_callback_channel_registered() {
        let (app, _hub, _responder) = relay(vec![], None);
        post(&app, "/register", json!({ "endpoint": AGENT })).await;
        let (status, body) = post(
            &app,
            "/chat",
            json!({ "conversant_id": "c1", "endpoint": AGENT, "message": "hello" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "callback_channel_registered");
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_shared_token_required() {
        let (app, _hub, _responder) = relay(vec![], Some("s3cret"));
        let body = json!({ "conversant_id": "c1" }).to_string();

        let (status, denied) = send(&app, "/session/start", body.clone(), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(denied["error"], "unauthorized");

        let (status, started) = send(&app, "/session/start", body, Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["state"], "active");
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_shared_token_must_match_exactly() {
        let (app, _hub, _responder) = relay(vec![], Some("s3cret"));
        let body = json!({ "conversant_id": "c1" }).to_string();

        for presented in ["s3cre", "s3cret!", "S3CRET", ""] {
            let (status, _) = send(&app, "/session/start", body.clone(), Some(presented)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "token {:?}", presented);
        }
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_dispatch_without_name_keeps_started_name() {
        let (app, hub, responder) = relay(vec![], None);
        post(
            &app,
            "/session/start",
            json!({ "conversant_id": "c1", "display_name": "Avatar One", "endpoint": AGENT }),
        )
        .await;
        post(&app, "/register", json!({ "endpoint": AGENT })).await;

        let (status, _) = post(
            &app,
            "/dispatch",
            json!({ "conversant_id": "c1", "message": "hello" }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        wait_for_calls(&responder, 1).await;
        assert_eq!(responder.calls()[0].request.display_name, "Avatar One");
        let conversant = hub.sessions().conversant("c1").await.unwrap();
        assert_eq!(conversant.display_name, "Avatar One");
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_session_end_and_status() {
        let (app, _hub, _responder) = relay(vec![], None);
        post(&app, "/session/start", json!({ "conversant_id": "c1" })).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let snapshot: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot["sessions"], 1);

        let (status, ended) = post(&app, "/session/end", json!({ "conversant_id": "c1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["ended"], true);
        let (_, again) = post(&app, "/session/end", json!({ "conversant_id": "c1" })).await;
        assert_eq!(again["ended"], false);
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_retired_agent_token_on_dispatch_is_409() {
        let (app, _hub, _responder) = relay(vec![], None);
        let (_, first) = post(&app, "/register", json!({ "endpoint": AGENT })).await;
        post(&app, "/register", json!({ "endpoint": AGENT })).await;

        let (status, body) = post(
            &app,
            "/dispatch",
            json!({
                "conversant_id": "c1",
                "endpoint": AGENT,
                "message": "hello",
                "callback_token": first["token"]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "token_mismatch");
    }
}
