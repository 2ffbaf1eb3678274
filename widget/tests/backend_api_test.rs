//! Backend API Integration Tests
//!
//! Runs the reqwest clients and a full chat session against an in-process
//! axum mock of the conversation and report endpoints.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use grantbot_widget::api::ConversationApi;
use grantbot_widget::conversation::SEND_ERROR_TEXT;
use grantbot_widget::identity::ConversationIdentity;
use grantbot_widget::poller::PollPolicy;
use grantbot_widget::{
    ApiError, ChatError, ChatSession, HttpConversationApi, MemoryStore, ReportClient,
    ReportOutcome, SessionOptions,
};
use shared_types::{ReactionRequest, Sender, TaskStatus};

// ============================================================================
// Mock backend
// ============================================================================

#[derive(Default)]
struct Backend {
    conversations: u32,
    messages: Vec<Value>,
    statuses: HashMap<String, VecDeque<&'static str>>,
    next_task: u32,
    omit_task_id: bool,
    fail_email: bool,
    reactions: Vec<(String, String, Value)>,
    /// (path, X-User-Email, X-Session-ID)
    seen: Vec<(String, Option<String>, Option<String>)>,
}

type Mock = Arc<Mutex<Backend>>;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn record(mock: &Mock, path: String, headers: &HeaderMap) {
    mock.lock().await.seen.push((
        path,
        header(headers, "X-User-Email"),
        header(headers, "X-Session-ID"),
    ));
}

async fn create_conversation(
    State(mock): State<Mock>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    record(&mock, "create".into(), &headers).await;
    let mut backend = mock.lock().await;
    backend.conversations += 1;
    let n = backend.conversations;
    let session_id = header(&headers, "X-User-Email")
        .is_none()
        .then(|| format!("s-{n}"));
    (
        StatusCode::CREATED,
        Json(json!({
            "id": 40 + n,
            "session_id": session_id,
            "greeting_message": "Hi! What are you raising money for?",
        })),
    )
}

async fn fetch_conversation(
    State(mock): State<Mock>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Json<Value> {
    record(&mock, format!("fetch {id}"), &headers).await;
    Json(json!({ "messages": mock.lock().await.messages }))
}

async fn send_message(
    State(mock): State<Mock>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&mock, format!("send {id}"), &headers).await;
    let mut backend = mock.lock().await;
    if backend.omit_task_id {
        return Json(json!({ "data": {} }));
    }
    let text = body["text"].as_str().unwrap_or_default().to_string();
    let n = backend.messages.len();
    backend.messages.push(json!({
        "id": n + 1,
        "role": "user",
        "text": text,
        "created_at": "2025-03-02T10:15:00.123456",
    }));
    backend.messages.push(json!({
        "id": n + 2,
        "role": "assistant",
        "text": "The Community Arts Fund closes April 30.",
        "created_at": "2025-03-02T10:15:04Z",
        "url": "https://grants.example.org/community-arts",
        "query_type": "search",
        "query_count": 3,
    }));
    backend.next_task += 1;
    Json(json!({ "data": { "task_id": format!("task-{}", backend.next_task) } }))
}

async fn task_status(
    State(mock): State<Mock>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let task_id = query.get("task_id").cloned().unwrap_or_default();
    let status = mock
        .lock()
        .await
        .statuses
        .get_mut(&task_id)
        .and_then(VecDeque::pop_front)
        .unwrap_or("SUCCESS");
    Json(json!({ "data": { "status": status } }))
}

async fn send_reaction(
    State(mock): State<Mock>,
    Path((id, message_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    mock.lock().await.reactions.push((id, message_id, body));
    StatusCode::OK
}

async fn email_conversation(State(mock): State<Mock>, headers: HeaderMap) -> StatusCode {
    record(&mock, "email".into(), &headers).await;
    if mock.lock().await.fail_email {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    }
}

async fn grant_report(
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    match query.get("report_id").map(String::as_str) {
        Some("r-1") => (
            StatusCode::OK,
            Json(json!({
                "data": {
                    "customer_email": header(&headers, "X-User-Email"),
                    "created_at": "2025-03-02T10:15:00Z",
                    "report": [{
                        "id": 7,
                        "url": "https://grants.example.org/7",
                        "opportunity_title": "Rural Libraries Initiative",
                        "interests": ["libraries", "literacy"],
                        "eligibilities": null,
                        "deadline": "2025-06-30",
                        "amount_low": 5000,
                        "amount_high": "25000",
                    }],
                }
            })),
        ),
        Some("empty") => (StatusCode::OK, Json(json!({ "data": null }))),
        _ => (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." }))),
    }
}

async fn spawn_backend() -> (String, Mock) {
    let mock: Mock = Arc::default();
    let app = Router::new()
        .route("/api/v1/conversations/", post(create_conversation))
        .route(
            "/api/v1/conversations/ai-response-receiver/",
            get(task_status),
        )
        .route("/api/v1/conversations/{id}/", get(fetch_conversation))
        .route("/api/v1/conversations/{id}/send-message/", post(send_message))
        .route(
            "/api/v1/conversations/{id}/send-reaction/{message_id}/",
            post(send_reaction),
        )
        .route(
            "/api/v1/conversations/{id}/email-conversation/",
            post(email_conversation),
        )
        .route("/api/v1/core-utils/grant-report", get(grant_report))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock backend");
    let addr = listener.local_addr().expect("No local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Mock backend failed");
    });
    (format!("http://{addr}"), mock)
}

fn client(base: &str) -> HttpConversationApi {
    HttpConversationApi::new(format!("{base}/api/v1/"), Duration::from_secs(5))
        .expect("Failed to build client")
}

fn fast_options() -> SessionOptions {
    SessionOptions {
        poll: PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 50,
            max_consecutive_errors: 3,
        },
        greeting_delay: Duration::from_millis(1),
        notice_ttl: Duration::from_millis(50),
    }
}

// ============================================================================
// Client
// ============================================================================

#[tokio::test]
async fn test_client_round_trip_with_identity_headers() {
    let (base, mock) = spawn_backend().await;
    let api = client(&base);
    assert_eq!(api.base_url(), format!("{base}/api/v1"));

    let anonymous = ConversationIdentity::default();
    let created = api.create_conversation(&anonymous).await.unwrap();
    assert_eq!(created.id, "41");
    assert_eq!(created.session_id.as_deref(), Some("s-1"));

    let who = ConversationIdentity {
        email: None,
        session_id: created.session_id.clone(),
        conversation_id: Some(created.id.clone()),
    };
    let task_id = api.send_message(&who, &created.id, "hello").await.unwrap();
    assert_eq!(task_id, "task-1");
    assert_eq!(api.task_status(&who, &task_id).await.unwrap(), TaskStatus::Success);

    let messages = api.fetch_messages(&who, &created.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "1");
    assert_eq!(messages[1].query_count, Some(3));

    let seen = mock.lock().await.seen.clone();
    assert_eq!(seen[0], ("create".to_string(), None, None));
    assert_eq!(
        seen[1],
        ("send 41".to_string(), None, Some("s-1".to_string()))
    );
}

#[tokio::test]
async fn test_missing_task_id_is_an_error() {
    let (base, mock) = spawn_backend().await;
    mock.lock().await.omit_task_id = true;
    let api = client(&base);

    let err = api
        .send_message(&ConversationIdentity::default(), "41", "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::MissingField("data.task_id")));
}

#[tokio::test]
async fn test_reaction_body_shape() {
    let (base, mock) = spawn_backend().await;
    let api = client(&base);
    let who = ConversationIdentity::default();

    let like = ReactionRequest {
        liked: true,
        reason_to_dislike: None,
    };
    let dislike = ReactionRequest {
        liked: false,
        reason_to_dislike: Some("wrong state".into()),
    };
    let (a, b) = futures::future::join(
        api.send_reaction(&who, "41", "2", &like),
        api.send_reaction(&who, "41", "4", &dislike),
    )
    .await;
    a.unwrap();
    b.unwrap();

    let mut reactions = mock.lock().await.reactions.clone();
    reactions.sort_by(|x, y| x.1.cmp(&y.1));
    assert_eq!(reactions[0].1, "2");
    assert_eq!(reactions[0].2, json!({ "liked": true }));
    assert_eq!(
        reactions[1].2,
        json!({ "liked": false, "reason_to_dislike": "wrong state" })
    );
}

#[tokio::test]
async fn test_unreachable_backend_is_network_error() {
    // Port 9 (discard) is closed on test hosts.
    let api = HttpConversationApi::new("http://127.0.0.1:9/api/v1", Duration::from_secs(2)).unwrap();
    let err = api
        .create_conversation(&ConversationIdentity::default())
        .await
        .unwrap_err();
    assert!(err.is_network());
}

// ============================================================================
// Session over HTTP
// ============================================================================

#[tokio::test]
async fn test_session_send_poll_refetch_over_http() {
    let (base, mock) = spawn_backend().await;
    mock.lock()
        .await
        .statuses
        .insert("task-1".into(), VecDeque::from(["PENDING", "STARTED", "PENDING"]));

    let session = ChatSession::new(client(&base), MemoryStore::new(), fast_options());
    session.restore(None).await.unwrap();
    session.open_chat().await.unwrap();
    session.send("Find me a grant").await.unwrap();

    let snapshot = session.snapshot();
    assert!(!snapshot.typing);
    assert_eq!(snapshot.messages.len(), 3);
    assert_eq!(snapshot.messages[0].text, "Hi! What are you raising money for?");

    let user = &snapshot.messages[1];
    assert_eq!(user.sender, Sender::User);
    assert_eq!(user.text, "Find me a grant");
    assert_eq!(user.time.len(), 5);

    let reply = &snapshot.messages[2];
    assert_eq!(reply.url.as_deref(), Some("https://grants.example.org/community-arts"));
    assert_eq!(session.active_task().await, None);

    session.like(2).await.unwrap();
    assert!(session.snapshot().messages[2].like);
    let reactions = mock.lock().await.reactions.clone();
    assert_eq!(reactions, vec![("41".to_string(), "2".to_string(), json!({ "liked": true }))]);
}

#[tokio::test]
async fn test_session_send_without_task_id_shows_error_row() {
    let (base, mock) = spawn_backend().await;
    let session = ChatSession::new(client(&base), MemoryStore::new(), fast_options());
    session.restore(None).await.unwrap();
    session.open_chat().await.unwrap();

    mock.lock().await.omit_task_id = true;
    let err = session.send("hello").await.unwrap_err();
    assert!(matches!(err, ChatError::Api(ApiError::MissingField(_))));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.last().unwrap().text, SEND_ERROR_TEXT);
    assert!(!snapshot.typing);
}

#[tokio::test]
async fn test_email_session_sends_email_header_and_transcript() {
    let (base, mock) = spawn_backend().await;
    let session = ChatSession::new(client(&base), MemoryStore::new(), fast_options());
    session.restore(Some("ada@example.org")).await.unwrap();
    session.open_chat().await.unwrap();
    assert!(session.snapshot().email_mode);

    session.email_transcript().await.unwrap();
    assert!(session.snapshot().notice.is_some());

    mock.lock().await.fail_email = true;
    assert!(session.email_transcript().await.is_err());
    assert_eq!(
        session.snapshot().notice.map(|n| n.text),
        Some("An error occurred. Please try again.".to_string())
    );

    let seen = mock.lock().await.seen.clone();
    assert!(seen
        .iter()
        .all(|(_, email, session_id)| email.as_deref() == Some("ada@example.org")
            && session_id.is_none()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.snapshot().notice, None);
}

// ============================================================================
// Reports
// ============================================================================

#[tokio::test]
async fn test_report_found_and_not_found() {
    let (base, _mock) = spawn_backend().await;
    let reports = ReportClient::new(
        format!("{base}/api/v1/core-utils/grant-report"),
        Duration::from_secs(5),
    )
    .unwrap();

    let ReportOutcome::Found(report) = reports
        .fetch_report(Some("r-1"), Some("ada@example.org"))
        .await
    else {
        panic!("expected a report");
    };
    assert_eq!(report.customer_email.as_deref(), Some("ada@example.org"));
    assert_eq!(report.report.len(), 1);
    assert_eq!(report.report[0].id, "7");
    assert!(report.report[0].eligibilities.is_empty());

    assert_eq!(reports.fetch_report(Some("missing"), None).await, ReportOutcome::NotFound);
    assert_eq!(reports.fetch_report(Some("empty"), None).await, ReportOutcome::NotFound);
    assert_eq!(reports.fetch_report(None, None).await, ReportOutcome::NotFound);
}
