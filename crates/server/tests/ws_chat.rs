//! End-to-end turn scenarios over a real WebSocket, with a scripted LLM.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tabula_agent::provider::mock::MockProvider;
use tabula_agent::provider::{AssistantTurn, LlmProvider};
use tabula_agent::tool::ToolCall;
use tabula_server::auth::Claims;
use tabula_server::router::build_router;
use tabula_server::state::AppState;

const SECRET: &str = "test-secret";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestApp {
    addr: std::net::SocketAddr,
    state: Arc<AppState>,
    _data_dir: tempfile::TempDir,
}

impl TestApp {
    async fn spawn(provider: Arc<MockProvider>, max_iterations: usize) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = tabula_core::Config::from_env();
        config.storage.data_dir = data_dir.path().to_path_buf();
        config.auth.secret_key = SECRET.into();
        config.limits.max_iterations = max_iterations;

        let provider: Arc<dyn LlmProvider> = provider;
        let state = Arc::new(AppState::new(config, Some(provider)).unwrap());
        let app = build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            _data_dir: data_dir,
        }
    }

    /// Register a ready session with a small CSV, the way the upload
    /// collaborator hands one over.
    async fn seed_session(&self, session_id: &str, user_id: &str) {
        let session_dir = self.state.config.storage.data_dir.join(session_id);
        std::fs::create_dir_all(&session_dir).unwrap();
        let file = session_dir.join("original.csv");
        let mut out = std::fs::File::create(&file).unwrap();
        let mut csv = String::from("id,name,age\n");
        for i in 0..1000 {
            csv.push_str(&format!("{i},person_{i},{}\n", 18 + (i % 60)));
        }
        out.write_all(csv.as_bytes()).unwrap();

        let profile = tabula_engine::profile_dataset(&file, 500).await.unwrap();
        let store = self.state.store.write().await;
        store
            .register(session_id, user_id, &file, "people.csv", profile)
            .unwrap();
    }

    async fn connect(&self, session_id: &str, token: &str) -> WsClient {
        let url = format!("ws://{}/sessions/{}/ws?token={}", self.addr, session_id, token);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn mint_token(user_id: &str) -> String {
    let claims = Claims {
        sub: user_id.into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn tool_call(id: &str, name: &str, input: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        input,
    }
}

async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_event(client: &mut WsClient) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("event is not JSON");
        }
    }
}

/// Read events until (and including) `done`.
async fn collect_turn(client: &mut WsClient) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let event = next_event(client).await;
        let is_done = event["event"] == "done";
        events.push(event);
        if is_done {
            return events;
        }
    }
}

fn events_of(events: &[Value], kind: &str) -> Vec<Value> {
    events
        .iter()
        .filter(|e| e["event"] == kind)
        .cloned()
        .collect()
}

// ── Scenario: auto-analysis after upload ─────────────────────────

#[tokio::test]
async fn auto_analyze_streams_query_results_text_and_done() {
    let provider = Arc::new(MockProvider::new());
    provider.queue(AssistantTurn::tool_use(
        Some("exploring".into()),
        vec![tool_call(
            "t1",
            "sql_query",
            json!({"sql": "SELECT count(*) AS n FROM data", "description": "Counting rows..."}),
        )],
    ));
    provider.queue(AssistantTurn::tool_use(
        None,
        vec![
            tool_call(
                "t2",
                "output_text",
                json!({"text": "**1000 rows** across 3 columns."}),
            ),
            tool_call("t3", "finalize", json!({"session_title": "People Dataset"})),
        ],
    ));

    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;
    let mut client = app.connect("s1", &mint_token("u1")).await;

    send_json(&mut client, json!({"type": "auto_analyze"})).await;
    let events = collect_turn(&mut client).await;

    assert!(!events_of(&events, "status").is_empty());

    let query_results = events_of(&events, "query_result");
    assert_eq!(query_results.len(), 1);
    assert_eq!(query_results[0]["data"]["is_error"], false);
    assert_eq!(query_results[0]["data"]["rows"][0][0], 1000);

    let texts = events_of(&events, "text");
    assert_eq!(texts.len(), 1);
    assert!(texts[0]["data"]["text"].as_str().unwrap().contains("1000"));

    assert_eq!(events_of(&events, "session_update").len(), 1);

    let done = events.last().unwrap();
    assert_eq!(done["event"], "done");
    assert!(done["data"]["aborted"].as_bool() != Some(true));
}

// ── Scenario: forbidden SQL self-correction ──────────────────────

#[tokio::test]
async fn forbidden_sql_surfaces_error_result_then_recovers() {
    let provider = Arc::new(MockProvider::new());
    provider.queue(AssistantTurn::tool_use(
        None,
        vec![tool_call(
            "t1",
            "sql_query",
            json!({"sql": "DELETE FROM data", "description": "Removing rows..."}),
        )],
    ));
    provider.queue(AssistantTurn::tool_use(
        None,
        vec![
            tool_call(
                "t2",
                "output_text",
                json!({"text": "I can only run read-only SELECT queries on this dataset."}),
            ),
            tool_call("t3", "finalize", json!({})),
        ],
    ));

    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;
    let mut client = app.connect("s1", &mint_token("u1")).await;

    send_json(&mut client, json!({"type": "message", "text": "delete all rows"})).await;
    let events = collect_turn(&mut client).await;

    let query_results = events_of(&events, "query_result");
    assert_eq!(query_results.len(), 1);
    assert_eq!(query_results[0]["data"]["is_error"], true);

    assert_eq!(events_of(&events, "text").len(), 1);
    assert_eq!(events.last().unwrap()["event"], "done");
}

// ── Scenario: stop mid-turn ──────────────────────────────────────

#[tokio::test]
async fn stop_aborts_the_turn_without_further_output() {
    let provider = Arc::new(MockProvider::new());
    provider.set_delay(Duration::from_secs(2));
    provider.queue_text("this reply must never reach the client");

    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;
    let mut client = app.connect("s1", &mint_token("u1")).await;

    send_json(&mut client, json!({"type": "message", "text": "slow question"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send_json(&mut client, json!({"type": "stop"})).await;

    let events = collect_turn(&mut client).await;
    assert!(events_of(&events, "text").is_empty());
    assert!(events_of(&events, "table").is_empty());
    assert!(events_of(&events, "plot").is_empty());

    let done = events.last().unwrap();
    assert_eq!(done["data"]["aborted"], true);
}

#[tokio::test]
async fn stop_with_no_active_turn_is_a_no_op() {
    let provider = Arc::new(MockProvider::new());
    provider.queue_text("later");

    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;
    let mut client = app.connect("s1", &mint_token("u1")).await;

    send_json(&mut client, json!({"type": "stop"})).await;

    // The session stays usable: a normal turn still runs to done.
    send_json(&mut client, json!({"type": "message", "text": "hi"})).await;
    let events = collect_turn(&mut client).await;
    assert_eq!(events.last().unwrap()["event"], "done");
}

// ── Scenario: hard iteration cap ─────────────────────────────────

#[tokio::test]
async fn iteration_cap_yields_exactly_that_many_query_results() {
    let provider = Arc::new(MockProvider::new());
    provider.set_fallback(AssistantTurn::tool_use(
        None,
        vec![tool_call(
            "t",
            "sql_query",
            json!({"sql": "SELECT id FROM data LIMIT 1", "description": "Looking again..."}),
        )],
    ));

    let app = TestApp::spawn(provider, 2).await;
    app.seed_session("s1", "u1").await;
    let mut client = app.connect("s1", &mint_token("u1")).await;

    send_json(&mut client, json!({"type": "message", "text": "loop"})).await;
    let events = collect_turn(&mut client).await;

    assert_eq!(events_of(&events, "query_result").len(), 2);
    let done = events.last().unwrap();
    assert_eq!(done["data"]["incomplete"], true);
    assert!(done["data"]["aborted"].as_bool() != Some(true));
}

// ── Scenario: concurrent duplicate send ──────────────────────────

#[tokio::test]
async fn second_message_during_a_turn_is_rejected() {
    let provider = Arc::new(MockProvider::new());
    provider.set_delay(Duration::from_millis(500));
    provider.queue(AssistantTurn::tool_use(
        None,
        vec![
            tool_call("t1", "output_text", json!({"text": "answer to a"})),
            tool_call("t2", "finalize", json!({})),
        ],
    ));

    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;
    let mut client = app.connect("s1", &mint_token("u1")).await;

    send_json(&mut client, json!({"type": "message", "text": "a"})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send_json(&mut client, json!({"type": "message", "text": "b"})).await;

    let events = collect_turn(&mut client).await;

    let errors = events_of(&events, "error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["data"]["message"]
        .as_str()
        .unwrap()
        .contains("in progress"));

    // The turn for "a" still completed normally, exactly once.
    assert_eq!(events_of(&events, "done").len(), 1);
    assert_eq!(events_of(&events, "text").len(), 1);
}

// ── Protocol errors ──────────────────────────────────────────────

#[tokio::test]
async fn malformed_and_unknown_messages_get_error_events() {
    let provider = Arc::new(MockProvider::new());
    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;
    let mut client = app.connect("s1", &mint_token("u1")).await;

    client
        .send(Message::Text("not json{{".to_string().into()))
        .await
        .unwrap();
    let event = next_event(&mut client).await;
    assert_eq!(event["event"], "error");

    send_json(&mut client, json!({"type": "reboot"})).await;
    let event = next_event(&mut client).await;
    assert_eq!(event["event"], "error");
    assert!(event["data"]["message"].as_str().unwrap().contains("reboot"));
}

#[tokio::test]
async fn invalid_token_closes_without_events() {
    let provider = Arc::new(MockProvider::new());
    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;

    let url = format!("ws://{}/sessions/s1/ws?token=bogus", app.addr);
    let (mut client, _) = connect_async(url).await.unwrap();

    let message = timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match message {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn foreign_session_closes_without_events() {
    let provider = Arc::new(MockProvider::new());
    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;

    let url = format!(
        "ws://{}/sessions/s1/ws?token={}",
        app.addr,
        mint_token("intruder")
    );
    let (mut client, _) = connect_async(url).await.unwrap();
    let message = timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(message, Message::Close(Some(_))));
}

// ── REST: restore and delete ─────────────────────────────────────

#[tokio::test]
async fn restore_excludes_query_results_and_reasoning() {
    let provider = Arc::new(MockProvider::new());
    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;

    {
        use tabula_session::{MessageKind, Role};
        let store = app.state.store.write().await;
        store
            .append("s1", Role::User, MessageKind::Text, "hi", None)
            .unwrap();
        store
            .append("s1", Role::Assistant, MessageKind::Text, "hello", None)
            .unwrap();
        store
            .append(
                "s1",
                Role::Assistant,
                MessageKind::QueryResult,
                "Checking...",
                Some(json!({"query": "SELECT 1", "rows": [[1]]})),
            )
            .unwrap();
        store
            .append("s1", Role::Assistant, MessageKind::Internal, "hmm", None)
            .unwrap();
    }

    let http = reqwest::Client::new();
    let body: Value = http
        .get(app.http_url("/sessions/s1"))
        .bearer_auth(mint_token("u1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["text"], "hi");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["text"], "hello");
    // Strictly ordered by monotonic id.
    assert!(messages[0]["id"].as_u64().unwrap() < messages[1]["id"].as_u64().unwrap());

    assert_eq!(body["file"]["row_count"], 1000);
    assert_eq!(body["file"]["columns"], json!(["id", "name", "age"]));
    assert!(body["file"]["preview"].as_array().unwrap().len() <= 500);
}

#[tokio::test]
async fn sessions_are_scoped_to_their_owner() {
    let provider = Arc::new(MockProvider::new());
    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("mine", "u1").await;
    app.seed_session("theirs", "u2").await;

    let http = reqwest::Client::new();

    let listed: Value = http
        .get(app.http_url("/sessions"))
        .bearer_auth(mint_token("u1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["mine"]);

    let status = http
        .get(app.http_url("/sessions/theirs"))
        .bearer_auth(mint_token("u1"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 404);

    let status = http
        .get(app.http_url("/sessions/mine"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 401);
}

#[tokio::test]
async fn delete_cascades_and_repeats_as_404() {
    let provider = Arc::new(MockProvider::new());
    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;

    let session_dir = app.state.config.storage.data_dir.join("s1");
    assert!(session_dir.exists());

    let http = reqwest::Client::new();
    let status = http
        .delete(app.http_url("/sessions/s1"))
        .bearer_auth(mint_token("u1"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 204);
    assert!(!session_dir.exists());

    let status = http
        .delete(app.http_url("/sessions/s1"))
        .bearer_auth(mint_token("u1"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 404);
}

// ── Reconnect: events flow to the newest socket ──────────────────

#[tokio::test]
async fn reconnect_redirects_events_to_the_new_socket() {
    let provider = Arc::new(MockProvider::new());
    provider.set_delay(Duration::from_millis(600));
    provider.queue(AssistantTurn::tool_use(
        None,
        vec![
            tool_call("t1", "output_text", json!({"text": "made it"})),
            tool_call("t2", "finalize", json!({})),
        ],
    ));

    let app = TestApp::spawn(provider, 15).await;
    app.seed_session("s1", "u1").await;
    let token = mint_token("u1");

    let mut first = app.connect("s1", &token).await;
    send_json(&mut first, json!({"type": "message", "text": "slow"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.close(None).await.unwrap();

    // Same session, same user, new socket while the turn is in flight.
    let mut second = app.connect("s1", &token).await;
    let events = collect_turn(&mut second).await;

    assert_eq!(events_of(&events, "text").len(), 1);
    assert_eq!(events.last().unwrap()["event"], "done");
}
