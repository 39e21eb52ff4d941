use super::*;
use axum::{body, body::Body, http::Request};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tower::ServiceExt;

async fn test_state() -> Arc<AppState> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let hub = Hub::new(
        storage.clone(),
        ExecutorConfig {
            interpreter: "sh".into(),
            timeout: Duration::from_secs(5),
        },
        64 * 1024,
    );
    Arc::new(AppState {
        api: ApiContext { storage },
        hub,
    })
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn post_json(uri: &str, value: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = build_router(test_state().await);
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn class_and_section_routes_work() {
    let app = build_router(test_state().await);

    let response = app
        .clone()
        .oneshot(post_json(
            "/classes",
            serde_json::json!({ "name": "CS 101", "description": "Intro" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let class: ClassSummary = json_body(response).await;

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/classes/{}/sections", class.id),
            serde_json::json!({ "name": "Section 1", "semester": "Fall" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/classes/{}/sections", class.id))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let sections: Vec<SectionSummary> = json_body(response).await;
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0].semester, "Fall");

    let response = app
        .oneshot(
            Request::delete(format!("/classes/{}", class.id))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn validation_and_missing_rows_map_to_status_codes() {
    let app = build_router(test_state().await);

    let response = app
        .clone()
        .oneshot(post_json("/problems", serde_json::json!({ "title": "  " })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ApiError = json_body(response).await;
    assert_eq!(err.code, ErrorCode::Validation);

    let response = app
        .oneshot(
            Request::delete("/problems/77")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_history_filters_by_status() {
    let state = test_state().await;
    let first = state
        .api
        .storage
        .create_session("HIS001", None, "")
        .await
        .expect("session");
    state
        .api
        .storage
        .create_session("HIS002", None, "")
        .await
        .expect("session");
    state
        .api
        .storage
        .end_session(first.session_id)
        .await
        .expect("end");
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(
            Request::get("/sessions?status=completed")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let sessions: Vec<SessionSummary> = json_body(response).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].join_code, "HIS001");

    let response = app
        .oneshot(Request::get("/sessions").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let sessions: Vec<SessionSummary> = json_body(response).await;
    assert_eq!(sessions.len(), 2);
}

#[tokio::test]
async fn revisions_route_filters_by_student() {
    let state = test_state().await;
    let session = state
        .api
        .storage
        .create_session("REV001", None, "")
        .await
        .expect("session");
    for (student, code) in [(1, "a"), (2, "b"), (1, "c")] {
        state
            .api
            .storage
            .insert_revision(session.session_id, StudentId(student), "s", code)
            .await
            .expect("revision");
    }
    let app = build_router(state);

    let response = app
        .oneshot(
            Request::get(format!(
                "/sessions/{}/revisions?student_id=1",
                session.session_id
            ))
            .body(Body::empty())
            .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let revisions: Vec<CodeRevision> = json_body(response).await;
    let codes: Vec<_> = revisions.iter().map(|r| r.code.as_str()).collect();
    assert_eq!(codes, vec!["a", "c"]);
}

#[tokio::test]
async fn websocket_create_session_round_trip() {
    let app = build_router(test_state().await);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    socket
        .send(WsMessage::Text(r#"{"type":"CREATE_SESSION"}"#.to_string()))
        .await
        .expect("send");
    socket
        .send(WsMessage::Text("not json".to_string()))
        .await
        .expect("send");

    let mut events = Vec::new();
    while events.len() < 2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame");
        if let WsMessage::Text(text) = frame {
            events.push(serde_json::from_str::<ServerEvent>(&text).expect("event"));
        }
    }

    assert!(matches!(events[0], ServerEvent::SessionCreated { .. }));
    assert!(matches!(
        &events[1],
        ServerEvent::Error { error } if error.starts_with("invalid command")
    ));
}
