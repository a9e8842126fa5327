//! Integration tests for the trigger HTTP surface.
//!
//! Each test spins up the Axum server on a random port and drives it with
//! reqwest. Most tests use the in-memory mailbox; `graph_backed_rule_run`
//! points the engine at a stub Graph API instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use clean_mail::engine::{EngineConfig, Orchestrator};
use clean_mail::mailbox::{FolderId, GraphMailbox, MailboxService, MemoryMailbox, StaticTokenSource};
use clean_mail::notify::{MemoryNotifier, Severity};
use clean_mail::rules::NewRule;
use clean_mail::server::routes;
use clean_mail::store::{LibSqlBackend, LogStatus, LogStore, RuleStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const SECRET: &str = "integration-secret";

/// Serve `app` on a random port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Running {
    base: String,
    store: Arc<LibSqlBackend>,
    notifier: MemoryNotifier,
}

async fn start_server(mailbox: Arc<dyn MailboxService>, graph_token: &str) -> Running {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let notifier = MemoryNotifier::new();
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        mailbox,
        Arc::new(StaticTokenSource::new(Some(SecretString::from(
            graph_token.to_string(),
        )))),
        Arc::new(notifier.clone()),
        EngineConfig::default(),
    );
    let app = routes(
        Arc::new(orchestrator),
        Some(SecretString::from(SECRET.to_string())),
    );
    Running {
        base: serve(app).await,
        store,
        notifier,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

// ── Memory mailbox ──────────────────────────────────────────────────────

#[tokio::test]
async fn cron_moves_mail_and_reports_per_rule() {
    timeout(TEST_TIMEOUT, async {
        let mailbox = Arc::new(MemoryMailbox::new());
        mailbox.add_inbox_message("Hoàn tiền Visa", "promo@vib.com.vn", Utc::now());
        mailbox.add_inbox_message("Team lunch", "colleague@corp.com", Utc::now());
        let server = start_server(mailbox.clone(), "token").await;
        server
            .store
            .insert_rule(
                &NewRule::new("Cashback", "Cards/Cashback")
                    .with_keywords(["HOAN TIEN"])
                    .with_categories(["Promo"])
                    .into_rule(),
            )
            .await
            .unwrap();

        let resp = client()
            .get(format!("{}/api/cron", server.base))
            .bearer_auth(SECRET)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["results"][0]["rule"], "Cashback");
        assert_eq!(body["results"][0]["moved"], 1);
        assert_eq!(body["results"][0]["failed"], 0);

        let dest = mailbox.folder_by_path("Cards/Cashback").unwrap();
        let moved = mailbox.messages_in(&dest);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].categories, vec!["Promo"]);
        assert_eq!(mailbox.messages_in(&FolderId::new("inbox")).len(), 1);

        let logs = server.store.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Moved);

        let sent = server.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Severity::Success);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn trigger_requires_bearer() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(Arc::new(MemoryMailbox::new()), "token").await;

        let resp = client()
            .get(format!("{}/api/cron", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let resp = client()
            .post(format!("{}/api/rules/sync", server.base))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let health = client()
            .get(format!("{}/health", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn organize_over_http_groups_by_destination() {
    timeout(TEST_TIMEOUT, async {
        let mailbox = Arc::new(MemoryMailbox::new());
        mailbox.add_inbox_message("OTP 998877", "otp@bank.vn", Utc::now());
        mailbox.add_inbox_message("Invoice #12", "billing@shop.com", Utc::now());
        let server = start_server(mailbox.clone(), "token").await;
        for rule in [
            NewRule::new("OTP", "Security/OTP").with_keywords(["OTP"]),
            NewRule::new("Bills", "Bills").with_keywords(["INVOICE"]),
        ] {
            server.store.insert_rule(&rule.into_rule()).await.unwrap();
        }

        let resp = client()
            .post(format!("{}/api/organize", server.base))
            .bearer_auth(SECRET)
            .json(&json!({ "source": "inbox", "from_year": 2000 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["matched"], 2);
        assert_eq!(body["moved"], 2);
        assert_eq!(body["groups"].as_array().unwrap().len(), 2);
        assert!(mailbox.folder_by_path("Security/OTP").is_some());
        assert!(mailbox.folder_by_path("Bills").is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rules_created_over_http_drive_a_run() {
    timeout(TEST_TIMEOUT, async {
        let mailbox = Arc::new(MemoryMailbox::new());
        mailbox.add_inbox_message("Sao kê tháng 6", "info@vcb.com.vn", Utc::now());
        let server = start_server(mailbox.clone(), "token").await;

        let created = client()
            .post(format!("{}/api/rules", server.base))
            .bearer_auth(SECRET)
            .json(&json!({
                "name": "Statements",
                "target_folder": "Banking/Statements",
                "conditions": { "keywords": ["sao ke"] }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), reqwest::StatusCode::CREATED);
        let rule: Value = created.json().await.unwrap();
        let id = rule["rule"]["id"].as_str().unwrap().to_string();

        let run = client()
            .post(format!("{}/api/rules/{id}/run", server.base))
            .bearer_auth(SECRET)
            .send()
            .await
            .unwrap();
        assert_eq!(run.status(), reqwest::StatusCode::OK);
        let body: Value = run.json().await.unwrap();
        assert_eq!(body["moved"], 1);

        let logs: Value = client()
            .get(format!("{}/api/logs", server.base))
            .bearer_auth(SECRET)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(logs["logs"][0]["target_folder"], "Banking/Statements");
        assert!(mailbox.folder_by_path("Banking/Statements").is_some());
    })
    .await
    .expect("test timed out");
}

// ── Stub Graph API ──────────────────────────────────────────────────────

#[derive(Default)]
struct GraphLog {
    folders: Vec<(String, String, String)>,
    moves: Vec<(String, String, String)>,
    patches: Vec<(String, Vec<String>)>,
}

type Shared = Arc<Mutex<GraphLog>>;

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer graph-token")
}

async fn list_messages(Path(folder): Path<String>, headers: HeaderMap) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let value = if folder == "inbox" {
        json!([
            {
                "id": "m1",
                "subject": "Sao kê tài khoản tháng 5",
                "sender": { "emailAddress": { "address": "info@vcb.com.vn", "name": "Vietcombank" } },
                "receivedDateTime": "2025-05-02T08:00:00Z",
                "isRead": false,
                "parentFolderId": "inbox",
                "categories": []
            },
            {
                "id": "m2",
                "subject": "Hello",
                "sender": { "emailAddress": { "address": "friend@mail.com", "name": "Friend" } },
                "receivedDateTime": "2025-05-01T08:00:00Z",
                "isRead": true,
                "parentFolderId": "inbox",
                "categories": []
            }
        ])
    } else {
        json!([])
    };
    Json(json!({ "value": value })).into_response()
}

async fn list_children(State(log): State<Shared>, Path(parent): Path<String>) -> Json<Value> {
    let log = log.lock().unwrap();
    let children: Vec<Value> = log
        .folders
        .iter()
        .filter(|(_, p, _)| *p == parent)
        .map(|(id, _, name)| json!({ "id": id, "displayName": name, "childFolderCount": 0 }))
        .collect();
    Json(json!({ "value": children }))
}

async fn create_child(
    State(log): State<Shared>,
    Path(parent): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut log = log.lock().unwrap();
    let id = format!("folder-{}", log.folders.len() + 1);
    let name = body["displayName"].as_str().unwrap_or_default().to_string();
    log.folders.push((id.clone(), parent, name.clone()));
    Json(json!({ "id": id, "displayName": name, "childFolderCount": 0 }))
}

async fn move_message(
    State(log): State<Shared>,
    Path((source, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let destination = body["destinationId"].as_str().unwrap_or_default().to_string();
    log.lock()
        .unwrap()
        .moves
        .push((id.clone(), source, destination));
    Json(json!({ "id": format!("{id}-moved") }))
}

async fn get_message(Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "id": id, "categories": [] }))
}

async fn patch_message(
    State(log): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let categories: Vec<String> = serde_json::from_value(body["categories"].clone()).unwrap();
    log.lock().unwrap().patches.push((id, categories));
    Json(json!({}))
}

fn stub_graph(log: Shared) -> Router {
    Router::new()
        .route("/v1.0/me/mailFolders/{folder}/messages", get(list_messages))
        .route(
            "/v1.0/me/mailFolders/{folder}/childFolders",
            get(list_children).post(create_child),
        )
        .route(
            "/v1.0/me/mailFolders/{folder}/messages/{id}/move",
            post(move_message),
        )
        .route("/v1.0/me/messages/{id}", get(get_message).patch(patch_message))
        .with_state(log)
}

#[tokio::test]
async fn graph_backed_rule_run() {
    timeout(TEST_TIMEOUT, async {
        let log: Shared = Arc::default();
        let graph_base = format!("{}/v1.0", serve(stub_graph(Arc::clone(&log))).await);
        let server = start_server(Arc::new(GraphMailbox::new(graph_base)), "graph-token").await;

        let rule = NewRule::new("VCB", "Banking/VCB")
            .with_senders(["vcb.com.vn"])
            .with_keywords(["SAO KE"])
            .with_categories(["Bank"])
            .into_rule();
        server.store.insert_rule(&rule).await.unwrap();

        let resp = client()
            .post(format!("{}/api/rules/{}/run?from_year=2025", server.base, rule.id))
            .bearer_auth(SECRET)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true, "{body}");
        assert_eq!(body["matched"], 1);
        assert_eq!(body["moved"], 1);

        let log = log.lock().unwrap();
        let created: Vec<&str> = log.folders.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(created, ["Banking", "VCB"]);
        assert_eq!(log.folders[0].1, "msgfolderroot");

        assert_eq!(log.moves.len(), 1);
        let (id, source, destination) = &log.moves[0];
        assert_eq!(id, "m1");
        assert_eq!(source, "inbox");
        assert_eq!(destination, &log.folders[1].0);

        assert_eq!(log.patches, vec![("m1-moved".to_string(), vec!["Bank".to_string()])]);
    })
    .await
    .expect("test timed out");
}
