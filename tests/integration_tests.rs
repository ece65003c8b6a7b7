use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use rusqlite::Connection;
use tower::ServiceExt;

use servicebook::config::AppConfig;
use servicebook::db::{self, queries};
use servicebook::handlers;
use servicebook::models::Catalog;
use servicebook::services::ai::{LlmProvider, Message};
use servicebook::services::messaging::MessagingProvider;
use servicebook::state::AppState;
use servicebook::store::{ContextStore, SqliteStore};

// ── Mock Providers ──

struct MockLlm;

#[async_trait]
impl LlmProvider for MockLlm {
    async fn chat(&self, _system_prompt: &str, messages: &[Message]) -> anyhow::Result<String> {
        let last = messages
            .last()
            .map(|m| m.content.to_lowercase())
            .unwrap_or_default();

        // Deterministic extractions keyed off the user message content
        if last.contains("jeddah") && last.contains("tuesday") {
            Ok(r#"{"intent":"book","confidence":0.9,"city":"Jeddah","center":null,"date":"2025-07-15","time":"11:00","correction_target":null}"#.to_string())
        } else if last.contains("jeddah") {
            Ok(r#"{"intent":"book","confidence":0.9,"city":"Jeddah","center":null,"date":null,"time":null,"correction_target":null}"#.to_string())
        } else if last.contains("riyadh") {
            Ok(r#"{"intent":"book","confidence":0.9,"city":"Riyadh","center":null,"date":null,"time":null,"correction_target":null}"#.to_string())
        } else if last.contains("yes") {
            Ok(r#"{"intent":"confirm","confidence":0.9,"city":null,"center":null,"date":null,"time":null,"correction_target":null}"#.to_string())
        } else if last.contains("book") || last.contains("service") {
            Ok(r#"{"intent":"book","confidence":0.8,"city":null,"center":null,"date":null,"time":null,"correction_target":null}"#.to_string())
        } else {
            Ok(r#"{"intent":"unknown","confidence":0.2,"city":null,"center":null,"date":null,"time":null,"correction_target":null}"#.to_string())
        }
    }
}

/// LLM backend that is down; every call errors.
struct BrokenLlm;

#[async_trait]
impl LlmProvider for BrokenLlm {
    async fn chat(&self, _system_prompt: &str, _messages: &[Message]) -> anyhow::Result<String> {
        anyhow::bail!("connection refused")
    }
}

/// LLM backend that hangs far past any reasonable extraction timeout.
struct StallingLlm;

#[async_trait]
impl LlmProvider for StallingLlm {
    async fn chat(&self, _system_prompt: &str, _messages: &[Message]) -> anyhow::Result<String> {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok("{}".to_string())
    }
}

struct MockMessaging {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl MessagingProvider for MockMessaging {
    async fn send_message(&self, to: &str, body: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

// ── Helpers ──

fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        database_url: ":memory:".to_string(),
        catalog_path: "data/catalog.json".to_string(),
        admin_token: "test-token".to_string(),
        ollama_url: "http://localhost:11434".to_string(),
        ollama_model: "llama3.2".to_string(),
        twilio_account_sid: "".to_string(),
        twilio_auth_token: "".to_string(), // empty = skip signature validation
        twilio_whatsapp_number: "+14155238886".to_string(),
        confidence_threshold: 0.5,
        extract_timeout_secs: 5,
        context_ttl_days: 7,
        history_limit: 50,
        sweep_interval_secs: 3600,
    }
}

fn test_catalog() -> Catalog {
    Catalog::from_json(include_str!("../data/catalog.json")).unwrap()
}

struct TestHarness {
    state: Arc<AppState>,
    conn: Arc<Mutex<Connection>>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

fn harness() -> TestHarness {
    harness_with_config(test_config())
}

fn harness_with_config(config: AppConfig) -> TestHarness {
    harness_with_llm(config, Box::new(MockLlm))
}

fn harness_with_llm(config: AppConfig, llm: Box<dyn LlmProvider>) -> TestHarness {
    let conn = Arc::new(Mutex::new(db::init_db(":memory:").unwrap()));
    let sent = Arc::new(Mutex::new(vec![]));
    let messaging = MockMessaging {
        sent: Arc::clone(&sent),
    };
    let state = Arc::new(AppState::new(
        config,
        Arc::new(SqliteStore::new(Arc::clone(&conn))),
        test_catalog(),
        llm,
        Box::new(messaging),
    ));
    TestHarness { state, conn, sent }
}

fn test_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/webhook/whatsapp", post(handlers::webhook::whatsapp_webhook))
        .route("/api/chat", post(handlers::chat::chat))
        .route("/api/context/:user_id", get(handlers::chat::get_context))
        .route(
            "/api/context/:user_id/reset",
            post(handlers::chat::reset_context),
        )
        .route("/api/admin/cleanup", post(handlers::admin::cleanup))
        .with_state(state)
}

fn webhook_request(body: &str, message_sid: &str) -> Request<Body> {
    let encoded = body.replace('+', "%2B").replace(' ', "+");
    Request::builder()
        .method("POST")
        .uri("/webhook/whatsapp")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(Body::from(format!(
            "From=whatsapp%3A%2B966500000001&To=whatsapp%3A%2B14155238886&Body={encoded}&MessageSid={message_sid}"
        )))
        .unwrap()
}

async fn json_body(res: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ── Health ──

#[tokio::test]
async fn test_health() {
    let h = harness();
    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = json_body(res).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "servicebook");
}

// ── Webhook Conversation Flow ──

#[tokio::test]
async fn test_webhook_booking_flow() {
    let h = harness();

    // Turn 1: everything in one message. Jeddah has a single center, so the
    // flow auto-selects it and jumps straight to confirmation.
    let res = test_app(h.state.clone())
        .oneshot(webhook_request(
            "I want to book a service in Jeddah on tuesday at 11am",
            "SM1",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "whatsapp:+966500000001");
        assert!(sent[0].1.contains("Please confirm"), "got: {}", sent[0].1);
        assert!(sent[0].1.contains("2025-07-15"));
        assert!(sent[0].1.contains("11:00"));
    }

    // Turn 2: confirm.
    let res = test_app(h.state.clone())
        .oneshot(webhook_request("yes", "SM2"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.contains("confirmed"), "got: {}", sent[1].1);
    }

    let conn = h.conn.lock().unwrap();
    let count = queries::count_appointments_for_user(&conn, "+966500000001").unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_webhook_city_only_lists_centers() {
    let h = harness();

    let res = test_app(h.state.clone())
        .oneshot(webhook_request("I need a service in Riyadh", "SM1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let sent = h.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    // Riyadh has several centers: the user must pick one.
    assert!(sent[0].1.contains("service centers in Riyadh"), "got: {}", sent[0].1);
}

#[tokio::test]
async fn test_webhook_duplicate_sid_is_idempotent() {
    let h = harness();

    test_app(h.state.clone())
        .oneshot(webhook_request(
            "book a service in Jeddah on tuesday at 11am",
            "SM1",
        ))
        .await
        .unwrap();

    // The confirmation arrives twice with the same MessageSid.
    test_app(h.state.clone())
        .oneshot(webhook_request("yes", "SM2"))
        .await
        .unwrap();
    test_app(h.state.clone())
        .oneshot(webhook_request("yes", "SM2"))
        .await
        .unwrap();

    // Replay sends the cached response but books nothing new.
    {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].1, sent[2].1);
    }

    let conn = h.conn.lock().unwrap();
    let count = queries::count_appointments_for_user(&conn, "+966500000001").unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_webhook_rejects_missing_signature_when_token_set() {
    let mut config = test_config();
    config.twilio_auth_token = "real-token".to_string();
    let h = harness_with_config(config);

    let res = test_app(h.state)
        .oneshot(webhook_request("hello", "SM1"))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

// ── Failure Degradation ──

/// Store wrapper whose writes can be switched off, for driving the
/// persistence failure path end to end.
struct FlakyStore {
    inner: SqliteStore,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl FlakyStore {
    fn writes_broken(&self) -> bool {
        self.fail_writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl ContextStore for FlakyStore {
    fn load(&self, user_id: &str) -> anyhow::Result<servicebook::models::ConversationContext> {
        self.inner.load(user_id)
    }

    fn get(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Option<servicebook::models::ConversationContext>> {
        self.inner.get(user_id)
    }

    fn save(&self, ctx: &servicebook::models::ConversationContext) -> anyhow::Result<()> {
        if self.writes_broken() {
            anyhow::bail!("disk full");
        }
        self.inner.save(ctx)
    }

    fn save_booking(
        &self,
        ctx: &servicebook::models::ConversationContext,
        appointment: &servicebook::models::Appointment,
    ) -> anyhow::Result<()> {
        if self.writes_broken() {
            anyhow::bail!("disk full");
        }
        self.inner.save_booking(ctx, appointment)
    }

    fn reset(&self, user_id: &str, keep_history: bool) -> anyhow::Result<bool> {
        self.inner.reset(user_id, keep_history)
    }

    fn sweep(&self, older_than: chrono::NaiveDateTime) -> anyhow::Result<usize> {
        self.inner.sweep(older_than)
    }

    fn delivery_response(&self, delivery_id: &str) -> anyhow::Result<Option<String>> {
        self.inner.delivery_response(delivery_id)
    }

    fn record_delivery(
        &self,
        delivery_id: &str,
        user_id: &str,
        response: &str,
    ) -> anyhow::Result<()> {
        self.inner.record_delivery(delivery_id, user_id, response)
    }
}

#[tokio::test]
async fn test_keyword_fallback_books_when_llm_is_down() {
    let h = harness_with_llm(test_config(), Box::new(BrokenLlm));

    // The keyword analyzer picks up the city, weekday and time on its own.
    let res = test_app(h.state.clone())
        .oneshot(webhook_request(
            "book a service in jeddah next tuesday at 11 am",
            "SM1",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Please confirm"), "got: {}", sent[0].1);
    }

    let res = test_app(h.state.clone())
        .oneshot(webhook_request("yes", "SM2"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.contains("confirmed"), "got: {}", sent[1].1);
    }

    let conn = h.conn.lock().unwrap();
    let count = queries::count_appointments_for_user(&conn, "+966500000001").unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_stalled_llm_degrades_to_keyword_fallback() {
    let mut config = test_config();
    config.extract_timeout_secs = 1;
    let h = harness_with_llm(config, Box::new(StallingLlm));

    let res = test_app(h.state)
        .oneshot(webhook_request("hello", "SM1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // The turn answers within the timeout budget instead of hanging.
    let sent = h.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("Welcome"), "got: {}", sent[0].1);
}

#[tokio::test]
async fn test_save_failure_sends_transient_error_and_persists_nothing() {
    let conn = Arc::new(Mutex::new(db::init_db(":memory:").unwrap()));
    let sent = Arc::new(Mutex::new(vec![]));
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::new(Arc::clone(&conn)),
        fail_writes: std::sync::atomic::AtomicBool::new(true),
    });
    let state = Arc::new(AppState::new(
        test_config(),
        store,
        test_catalog(),
        Box::new(MockLlm),
        Box::new(MockMessaging {
            sent: Arc::clone(&sent),
        }),
    ));

    let res = test_app(state)
        .oneshot(webhook_request("book a service in Jeddah", "SM1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    {
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(
            sent[0].1.starts_with("Sorry, I'm having trouble"),
            "got: {}",
            sent[0].1
        );
    }

    // Nothing from the failed turn is durable; the retry starts clean.
    let conn = conn.lock().unwrap();
    assert!(queries::get_context(&conn, "+966500000001").unwrap().is_none());
    assert!(queries::get_delivery_response(&conn, "SM1").unwrap().is_none());
}

// ── Chat API ──

#[tokio::test]
async fn test_chat_endpoint() {
    let h = harness();

    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{"user_id":"web-user-1","message":"I want to book a service in Jeddah"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = json_body(res).await;
    assert_eq!(json["user_id"], "web-user-1");
    assert_eq!(json["context"]["slots"]["city"], "Jeddah");
    // Single Jeddah center auto-selects, so the bot asks for a time.
    assert_eq!(json["context"]["stage"], "awaiting_time");
}

#[tokio::test]
async fn test_chat_rejects_empty_message() {
    let h = harness();

    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"user_id":"web-user-1","message":"  "}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_context_unknown_user_404() {
    let h = harness();

    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .uri("/api/context/nobody")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset_endpoint() {
    let h = harness();

    // Seed a conversation.
    test_app(h.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{"user_id":"web-user-2","message":"book a service in Riyadh"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    let res = test_app(h.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/context/web-user-2/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Booking progress is gone, history survives.
    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .uri("/api/context/web-user-2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = json_body(res).await;
    assert_eq!(json["stage"], "greeting");
    assert!(json["slots"]["city"].is_null());
    assert_eq!(json["history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_reset_unknown_user_404() {
    let h = harness();

    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/context/nobody/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

// ── Admin ──

#[tokio::test]
async fn test_cleanup_requires_auth() {
    let h = harness();

    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/admin/cleanup")
                .header("Content-Type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_cleanup_purges_idle_contexts() {
    let h = harness();

    // One active conversation, one long idle.
    test_app(h.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{"user_id":"active","message":"book a service"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    {
        let mut stale = servicebook::models::ConversationContext::new("stale");
        stale.last_active = chrono::Utc::now().naive_utc() - chrono::Duration::days(30);
        let conn = h.conn.lock().unwrap();
        queries::upsert_context(&conn, &stale).unwrap();
    }

    let res = test_app(h.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/admin/cleanup")
                .header("Authorization", "Bearer test-token")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"days":7}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = json_body(res).await;
    assert_eq!(json["purged"], 1);
    assert_eq!(json["days"], 7);

    let conn = h.conn.lock().unwrap();
    assert!(queries::get_context(&conn, "stale").unwrap().is_none());
    assert!(queries::get_context(&conn, "active").unwrap().is_some());
}

#[tokio::test]
async fn test_cleanup_rejects_nonpositive_days() {
    let h = harness();

    let res = test_app(h.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/admin/cleanup")
                .header("Authorization", "Bearer test-token")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"days":0}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
