//! HTTP surface tests, driving the router in-process.

use axum::{
    body::{Body, BodyDataStream},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chatrooms::{config::Config, entity::User, queue::RetryPolicy, store::Store};
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const BOUNDARY: &str = "chatrooms-test-boundary";

struct TestApp {
    router: Router,
    store: Store,
}

async fn spawn_app() -> TestApp {
    let store = Store::in_memory().await.unwrap();
    for (name, token) in [("alice", "token-alice"), ("bob", "token-bob")] {
        store.create_user(&User::new(name, token)).await.unwrap();
    }

    let mut config = Config::from_lookup(|_| None).unwrap();
    config.storage_dir = std::env::temp_dir().join(format!("chatrooms-api-{}", Uuid::new_v4()));
    config.retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));

    let service = chatrooms::build(store.clone(), &config);
    tokio::spawn(service.worker.run(service.tasks));

    TestApp {
        router: chatrooms::api::router(service.state),
        store,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn create_room(&self, name: &str, max_members: i64) -> String {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/chatrooms",
                Some("token-alice"),
                Some(json!({ "name": name, "max_members": max_members })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    async fn post_message(&self, room: &str, token: &str, parts: &[Part<'_>]) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/chatrooms/{}/messages", room))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        self.send(request).await
    }
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        file_name: &'a str,
        content_type: &'a str,
        bytes: &'a [u8],
    },
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                file_name,
                content_type,
                bytes,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, file_name, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn wait_for_messages(store: &Store, room: &str, expected: i64) {
    for _ in 0..100 {
        if store.count_messages(room).await.unwrap() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {} messages", expected);
}

/// Reads SSE frames into `buffer` until `needle` shows up.
async fn read_until(stream: &mut BodyDataStream, buffer: &mut String, needle: &str) {
    let found = tokio::time::timeout(Duration::from_secs(2), async {
        while !buffer.contains(needle) {
            let chunk = stream.next().await.expect("event stream ended").unwrap();
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await;
    assert!(found.is_ok(), "no {:?} in event stream: {}", needle, buffer);
}

#[tokio::test]
async fn requests_without_a_known_token_are_rejected() {
    let app = spawn_app().await;

    let (status, body) = app.call(Method::GET, "/api/user", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthenticated");

    let (status, _) = app.call(Method::GET, "/api/user", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app.call(Method::GET, "/api/user", Some("token-alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "alice");
    assert!(body.get("api_token").is_none());
}

#[tokio::test]
async fn chatrooms_are_created_and_listed() {
    let app = spawn_app().await;
    let id = app.create_room("General Chat", 50).await;

    let (status, body) = app.call(Method::GET, "/api/chatrooms", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], id.as_str());
    assert_eq!(body[0]["max_members"], 50);

    let (status, _) = app
        .call(
            Method::POST,
            "/api/chatrooms",
            Some("token-alice"),
            Some(json!({ "name": "  ", "max_members": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .call(
            Method::POST,
            "/api/chatrooms",
            Some("token-alice"),
            Some(json!({ "name": "zero", "max_members": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn malformed_request_bodies_get_json_errors() {
    let app = spawn_app().await;

    let (status, body) = app
        .call(Method::POST, "/api/chatrooms", Some("token-alice"), Some(json!({ "name": "x" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("max_members"));

    let (status, body) = app
        .call(
            Method::POST,
            "/api/chatrooms",
            Some("token-alice"),
            Some(json!({ "name": "x", "max_members": "5" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/chatrooms")
        .header(header::AUTHORIZATION, "Bearer token-alice")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let room = app.create_room("general", 10).await;
    let uri = format!("/api/chatrooms/{}/messages", room);
    let (status, body) = app
        .call(Method::POST, &uri, Some("token-alice"), Some(json!({ "message": "hi" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn single_seat_chatroom_admits_one_member_at_a_time() {
    let app = spawn_app().await;
    let room = app.create_room("duo", 1).await;
    let enter = format!("/api/chatrooms/{}/enter", room);
    let leave = format!("/api/chatrooms/{}/leave", room);

    let (status, body) = app.call(Method::POST, &enter, Some("token-alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Joined chatroom");

    let (status, body) = app.call(Method::POST, &enter, Some("token-bob"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Chatroom is full");

    let (status, body) = app.call(Method::POST, &leave, Some("token-alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Left chatroom");

    let (status, _) = app.call(Method::POST, &enter, Some("token-bob"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.call(Method::GET, "/api/chatrooms/my", Some("token-bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], room.as_str());
}

#[tokio::test]
async fn duplicate_join_conflicts_and_leave_is_idempotent() {
    let app = spawn_app().await;
    let room = app.create_room("general", 10).await;
    let enter = format!("/api/chatrooms/{}/enter", room);

    let (status, _) = app.call(Method::POST, &enter, Some("token-alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.call(Method::POST, &enter, Some("token-alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "User already in chatroom");

    let leave = format!("/api/chatrooms/{}/leave", room);
    let (status, _) = app.call(Method::POST, &leave, Some("token-bob"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .call(Method::POST, "/api/chatrooms/missing/enter", Some("token-alice"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn text_message_is_accepted_then_persisted() {
    let app = spawn_app().await;
    let room = app.create_room("general", 10).await;

    let (status, body) = app
        .post_message(&room, "token-alice", &[Part::Text("message", "hello")])
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["message"], "Message queued for processing");
    assert!(body["ticket"]["id"].is_string());

    wait_for_messages(&app.store, &room, 1).await;

    let uri = format!("/api/chatrooms/{}/messages", room);
    let (status, body) = app.call(Method::GET, &uri, Some("token-bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["text"], "hello");
    assert_eq!(body[0]["user"]["name"], "alice");
}

#[tokio::test]
async fn empty_or_unsupported_submissions_are_rejected() {
    let app = spawn_app().await;
    let room = app.create_room("general", 10).await;

    let (status, body) = app
        .post_message(&room, "token-alice", &[Part::Text("message", "")])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Message or attachment is required");

    let (status, body) = app
        .post_message(
            &room,
            "token-alice",
            &[Part::File {
                name: "attachment",
                file_name: "notes.pdf",
                content_type: "application/pdf",
                bytes: b"%PDF-1.4",
            }],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid file type");

    let (status, _) = app
        .post_message("missing", "token-alice", &[Part::Text("message", "hi")])
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.store.count_messages(&room).await.unwrap(), 0);
}

#[tokio::test]
async fn image_attachment_is_stored_and_linked() {
    let app = spawn_app().await;
    let room = app.create_room("general", 10).await;

    let (status, _) = app
        .post_message(
            &room,
            "token-alice",
            &[Part::File {
                name: "attachment",
                file_name: "cat.png",
                content_type: "image/png",
                bytes: b"\x89PNG",
            }],
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    wait_for_messages(&app.store, &room, 1).await;
    let messages = app.store.list_messages(&room).await.unwrap();
    let path = messages[0].message.attachment_path.clone().unwrap();
    assert!(path.starts_with("/storage/picture/"));
    assert!(messages[0].message.text.is_none());

    let (status, _) = app.call(Method::GET, &path, None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn event_stream_is_for_members_only() {
    let app = spawn_app().await;
    let room = app.create_room("general", 10).await;
    let events = format!("/api/chatrooms/{}/events", room);

    let (status, _) = app.call(Method::GET, &events, Some("token-bob"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call(Method::GET, "/api/chatrooms/missing/events", Some("token-bob"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let enter = format!("/api/chatrooms/{}/enter", room);
    app.call(Method::POST, &enter, Some("token-bob"), None).await;

    let request = Request::builder()
        .uri(&events)
        .header(header::AUTHORIZATION, "Bearer token-bob")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
}

#[tokio::test]
async fn members_receive_named_events_over_sse() {
    let app = spawn_app().await;
    let room = app.create_room("general", 10).await;
    let enter = format!("/api/chatrooms/{}/enter", room);
    app.call(Method::POST, &enter, Some("token-bob"), None).await;

    let request = Request::builder()
        .uri(format!("/api/chatrooms/{}/events", room))
        .header(header::AUTHORIZATION, "Bearer token-bob")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.into_body().into_data_stream();
    let mut buffer = String::new();
    read_until(&mut stream, &mut buffer, "event: subscribed").await;
    assert!(buffer.contains(&format!("chatroom.{}", room)));

    let (status, _) = app.call(Method::POST, &enter, Some("token-alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    read_until(&mut stream, &mut buffer, "event: UserJoined").await;
    read_until(&mut stream, &mut buffer, "\"name\":\"alice\"").await;

    let (status, _) = app
        .post_message(&room, "token-alice", &[Part::Text("message", "hello")])
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    read_until(&mut stream, &mut buffer, "event: MessageCreated").await;

    wait_for_messages(&app.store, &room, 1).await;
    let messages = app.store.list_messages(&room).await.unwrap();
    read_until(&mut stream, &mut buffer, &messages[0].message.id).await;
    assert!(buffer.contains("\"type\":\"MessageCreated\""));
}
