//! Microsoft Graph implementation of [`MailboxService`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::MailboxError;
use crate::mailbox::{
    AccessToken, FolderId, FolderScope, MailFolder, MailMessage, MailboxService, MessagePage,
    ProviderRule, ResumeToken,
};

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;
const REDACTED_BODY_MAX_LEN: usize = 200;
const FOLDER_PAGE_SIZE: u32 = 100;
/// Per-request deadline; a run holds the engine's run lock while it waits.
pub const GRAPH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MESSAGE_SELECT_FIELDS: &str =
    "id,subject,sender,receivedDateTime,isRead,parentFolderId,categories";

/// Graph REST client bound to one mailbox (`/me`).
#[derive(Debug, Clone)]
pub struct GraphMailbox {
    client: Client,
    base: String,
}

impl Default for GraphMailbox {
    fn default() -> Self {
        Self::new(GRAPH_API_BASE)
    }
}

impl GraphMailbox {
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_timeout(base, GRAPH_REQUEST_TIMEOUT)
    }

    /// Client whose every request gives up after `timeout`.
    pub fn with_timeout(base: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self::with_client(client, base)
    }

    pub fn with_client(client: Client, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { client, base }
    }

    fn url(&self, path: &str) -> Result<Url, MailboxError> {
        let raw = format!("{}{path}", self.base);
        Url::parse(&raw).map_err(|e| MailboxError::Request {
            operation: "build url".into(),
            reason: format!("{raw}: {e}"),
        })
    }

    fn messages_url(&self, scope: &FolderScope, page_size: u32) -> Result<Url, MailboxError> {
        let mut url = match scope {
            FolderScope::Folder(id) => self.url(&format!("/me/mailFolders/{id}/messages"))?,
            FolderScope::AllMessages => self.url("/me/messages")?,
        };
        url.query_pairs_mut()
            .append_pair("$top", &page_size.to_string())
            .append_pair("$select", MESSAGE_SELECT_FIELDS)
            .append_pair("$orderby", "receivedDateTime desc");
        Ok(url)
    }

    fn child_folders_url(
        &self,
        parent: &FolderId,
        display_name: Option<&str>,
    ) -> Result<Url, MailboxError> {
        let mut url = self.url(&format!("/me/mailFolders/{parent}/childFolders"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("$top", &FOLDER_PAGE_SIZE.to_string());
            if let Some(name) = display_name {
                query.append_pair("$filter", &format!("displayName eq '{}'", odata_quote(name)));
            }
        }
        Ok(url)
    }

    /// Send a request, retrying on HTTP 429, and return the raw body.
    ///
    /// `build` is called once per attempt since a `RequestBuilder` is consumed
    /// by `send`.
    async fn send_with_retry<F>(
        &self,
        operation: &str,
        token: &AccessToken,
        build: F,
    ) -> Result<String, MailboxError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut backoff_seconds = 1u64;
        let mut waited = Duration::ZERO;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = build(&self.client)
                .bearer_auth(token.secret())
                .header("accept", "application/json")
                .send()
                .await
                .map_err(|e| MailboxError::Request {
                    operation: operation.to_string(),
                    reason: e.to_string(),
                })?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    return Err(MailboxError::RateLimited {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        waited,
                    });
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                warn!(
                    operation,
                    attempt = attempt + 1,
                    retry_after_seconds,
                    "Graph throttled request, backing off"
                );
                let pause = Duration::from_secs(retry_after_seconds);
                sleep(pause).await;
                waited += pause;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                continue;
            }

            let status = response.status();
            let body = response.text().await.map_err(|e| MailboxError::Request {
                operation: operation.to_string(),
                reason: format!("read body: {e}"),
            })?;

            if !status.is_success() {
                return Err(MailboxError::Status {
                    operation: operation.to_string(),
                    status: status.as_u16(),
                    body: redact_response_body(&body),
                });
            }

            return Ok(body);
        }

        Err(MailboxError::Request {
            operation: operation.to_string(),
            reason: "no response".into(),
        })
    }

    async fn fetch_json<T, F>(
        &self,
        operation: &str,
        token: &AccessToken,
        build: F,
    ) -> Result<T, MailboxError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let body = self.send_with_retry(operation, token, build).await?;
        decode(operation, &body)
    }

    async fn fetch_message_page(
        &self,
        token: &AccessToken,
        url: &str,
    ) -> Result<MessagePage, MailboxError> {
        let page: GraphMessagesPage = self
            .fetch_json("list messages", token, |c| c.get(url))
            .await?;

        let mut messages = Vec::with_capacity(page.value.len());
        for raw in page.value {
            messages.push(raw.into_message()?);
        }
        debug!(count = messages.len(), has_next = page.next_link.is_some(), "Fetched message page");

        Ok(MessagePage {
            messages,
            next: page.next_link.map(ResumeToken::new),
        })
    }
}

#[async_trait]
impl MailboxService for GraphMailbox {
    async fn list_child_folders(
        &self,
        token: &AccessToken,
        parent: &FolderId,
        display_name: Option<&str>,
    ) -> Result<Vec<MailFolder>, MailboxError> {
        let mut url = self.child_folders_url(parent, display_name)?.to_string();
        let mut folders = Vec::new();

        loop {
            let page: GraphFolderPage = self
                .fetch_json("list child folders", token, |c| c.get(&url))
                .await?;
            folders.extend(page.value.into_iter().map(GraphFolder::into_folder));

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(folders)
    }

    async fn create_child_folder(
        &self,
        token: &AccessToken,
        parent: &FolderId,
        display_name: &str,
    ) -> Result<MailFolder, MailboxError> {
        let url = self.url(&format!("/me/mailFolders/{parent}/childFolders"))?;
        let body = serde_json::json!({ "displayName": display_name });
        let folder: GraphFolder = self
            .fetch_json("create folder", token, |c| c.post(url.clone()).json(&body))
            .await?;
        Ok(folder.into_folder())
    }

    async fn get_folder(
        &self,
        token: &AccessToken,
        id: &FolderId,
    ) -> Result<MailFolder, MailboxError> {
        let url = self.url(&format!("/me/mailFolders/{id}"))?;
        let folder: GraphFolder = self
            .fetch_json("get folder", token, |c| c.get(url.clone()))
            .await?;
        Ok(folder.into_folder())
    }

    async fn list_messages(
        &self,
        token: &AccessToken,
        scope: &FolderScope,
        page_size: u32,
    ) -> Result<MessagePage, MailboxError> {
        let url = self.messages_url(scope, page_size)?;
        self.fetch_message_page(token, url.as_str()).await
    }

    async fn next_messages(
        &self,
        token: &AccessToken,
        resume: &ResumeToken,
    ) -> Result<MessagePage, MailboxError> {
        self.fetch_message_page(token, resume.as_str()).await
    }

    async fn move_message(
        &self,
        token: &AccessToken,
        message_id: &str,
        destination: &FolderId,
        source: Option<&FolderId>,
    ) -> Result<String, MailboxError> {
        let url = match source {
            Some(src) => self.url(&format!("/me/mailFolders/{src}/messages/{message_id}/move"))?,
            None => self.url(&format!("/me/messages/{message_id}/move"))?,
        };
        let body = serde_json::json!({ "destinationId": destination.as_str() });
        let moved: GraphMessageRef = self
            .fetch_json("move message", token, |c| c.post(url.clone()).json(&body))
            .await?;
        Ok(moved.id.unwrap_or_else(|| message_id.to_string()))
    }

    async fn get_categories(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<Vec<String>, MailboxError> {
        let mut url = self.url(&format!("/me/messages/{message_id}"))?;
        url.query_pairs_mut().append_pair("$select", "categories");
        let message: GraphMessageRef = self
            .fetch_json("get categories", token, |c| c.get(url.clone()))
            .await?;
        Ok(message.categories.unwrap_or_default())
    }

    async fn set_categories(
        &self,
        token: &AccessToken,
        message_id: &str,
        categories: &[String],
    ) -> Result<(), MailboxError> {
        let url = self.url(&format!("/me/messages/{message_id}"))?;
        let body = serde_json::json!({ "categories": categories });
        self.send_with_retry("set categories", token, |c| c.patch(url.clone()).json(&body))
            .await?;
        Ok(())
    }

    async fn list_provider_rules(
        &self,
        token: &AccessToken,
    ) -> Result<Vec<ProviderRule>, MailboxError> {
        let url = self.url("/me/mailFolders/inbox/messageRules")?;
        let page: GraphRulePage = self
            .fetch_json("list message rules", token, |c| c.get(url.clone()))
            .await?;
        Ok(page.value.into_iter().map(GraphMessageRule::into_rule).collect())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Escape a literal for use inside a single-quoted OData string.
pub(crate) fn odata_quote(value: &str) -> String {
    value.replace('\'', "''")
}

fn decode<T: DeserializeOwned>(operation: &str, body: &str) -> Result<T, MailboxError> {
    serde_json::from_str(body).map_err(|e| MailboxError::Decode {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GraphMessagesPage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    sender: Option<GraphRecipient>,
    received_date_time: Option<String>,
    is_read: Option<bool>,
    parent_folder_id: Option<String>,
    categories: Option<Vec<String>>,
}

impl GraphMessage {
    fn into_message(self) -> Result<MailMessage, MailboxError> {
        let id = self.id.ok_or_else(|| MailboxError::Decode {
            operation: "list messages".into(),
            reason: "message without id".into(),
        })?;

        let (sender_name, sender_address) = self
            .sender
            .and_then(|s| s.email_address)
            .map(|e| (e.name.unwrap_or_default(), e.address.unwrap_or_default()))
            .unwrap_or_default();

        // Missing timestamps sort as newest so they never trip the year cutoff.
        let received_at = self
            .received_date_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(MailMessage {
            id,
            subject: self.subject.unwrap_or_default(),
            sender_address,
            sender_name,
            received_at,
            is_read: self.is_read.unwrap_or(false),
            parent_folder_id: self.parent_folder_id.map(FolderId::new),
            categories: self.categories.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GraphMessageRef {
    id: Option<String>,
    categories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphFolderPage {
    #[serde(default)]
    value: Vec<GraphFolder>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
    child_folder_count: Option<u32>,
    unread_item_count: Option<u32>,
}

impl GraphFolder {
    fn into_folder(self) -> MailFolder {
        MailFolder {
            id: FolderId::new(self.id),
            display_name: self.display_name,
            child_folder_count: self.child_folder_count.unwrap_or(0),
            unread_item_count: self.unread_item_count.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphRulePage {
    #[serde(default)]
    value: Vec<GraphMessageRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessageRule {
    display_name: Option<String>,
    is_enabled: Option<bool>,
    conditions: Option<GraphRuleConditions>,
    actions: Option<GraphRuleActions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRuleConditions {
    #[serde(default)]
    sender_contains: Vec<String>,
    #[serde(default)]
    from_addresses: Vec<GraphRecipient>,
    #[serde(default)]
    subject_contains: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRuleActions {
    move_to_folder: Option<String>,
}

impl GraphMessageRule {
    fn into_rule(self) -> ProviderRule {
        let conditions = self.conditions.unwrap_or_default();
        let actions = self.actions.unwrap_or_default();
        ProviderRule {
            display_name: self.display_name,
            is_enabled: self.is_enabled.unwrap_or(true),
            sender_contains: conditions.sender_contains,
            from_addresses: conditions
                .from_addresses
                .into_iter()
                .filter_map(|r| r.email_address.and_then(|e| e.address))
                .collect(),
            subject_contains: conditions.subject_contains,
            move_to_folder: actions.move_to_folder.map(FolderId::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use serde_json::json;

    use super::*;

    #[test]
    fn graph_message_maps_to_mail_message() {
        let payload = json!({
            "id": "AAMk-1",
            "subject": "Thông báo hoàn tiền",
            "sender": { "emailAddress": { "name": "Vietcombank", "address": "info@vietcombank.com.vn" } },
            "receivedDateTime": "2025-03-14T08:30:00Z",
            "isRead": true,
            "parentFolderId": "inbox-id",
            "categories": ["VIP"]
        });
        let raw: GraphMessage = serde_json::from_value(payload).unwrap();
        let msg = raw.into_message().unwrap();
        assert_eq!(msg.id, "AAMk-1");
        assert_eq!(msg.sender_address, "info@vietcombank.com.vn");
        assert_eq!(msg.sender_name, "Vietcombank");
        assert!(msg.is_read);
        assert_eq!(msg.parent_folder_id, Some(FolderId::new("inbox-id")));
        assert_eq!(msg.categories, vec!["VIP"]);
        assert_eq!(msg.received_at.to_rfc3339(), "2025-03-14T08:30:00+00:00");
    }

    #[test]
    fn sparse_graph_message_uses_defaults() {
        let raw: GraphMessage = serde_json::from_value(json!({ "id": "m" })).unwrap();
        let msg = raw.into_message().unwrap();
        assert_eq!(msg.subject, "");
        assert_eq!(msg.sender_address, "");
        assert!(!msg.is_read);
        assert!(msg.categories.is_empty());
    }

    #[test]
    fn message_without_id_is_a_decode_error() {
        let raw: GraphMessage = serde_json::from_value(json!({ "subject": "x" })).unwrap();
        assert!(matches!(raw.into_message(), Err(MailboxError::Decode { .. })));
    }

    #[test]
    fn page_keeps_next_link_verbatim() {
        let body = r#"{"value":[],"@odata.nextLink":"https://graph.microsoft.com/v1.0/me/messages?%24skiptoken=abc"}"#;
        let page: GraphMessagesPage = decode("list messages", body).unwrap();
        assert_eq!(
            page.next_link.as_deref(),
            Some("https://graph.microsoft.com/v1.0/me/messages?%24skiptoken=abc")
        );
    }

    #[test]
    fn odata_quotes_are_doubled() {
        assert_eq!(odata_quote("Bob's mail"), "Bob''s mail");
        assert_eq!(odata_quote("plain"), "plain");
    }

    #[test]
    fn messages_url_is_scoped_and_ordered() {
        let graph = GraphMailbox::default();
        let url = graph
            .messages_url(&FolderScope::Folder(FolderId::new("inbox")), 50)
            .unwrap()
            .to_string();
        assert!(url.starts_with("https://graph.microsoft.com/v1.0/me/mailFolders/inbox/messages?"));
        assert!(url.contains("%24top=50"));
        assert!(url.contains("receivedDateTime+desc"));

        let all = graph
            .messages_url(&FolderScope::AllMessages, 10)
            .unwrap()
            .to_string();
        assert!(all.starts_with("https://graph.microsoft.com/v1.0/me/messages?"));
    }

    #[test]
    fn child_folder_filter_is_escaped() {
        let graph = GraphMailbox::new("https://graph.example/v1.0/");
        let url = graph
            .child_folders_url(&FolderId::root(), Some("Bob's"))
            .unwrap();
        let filter = url
            .query_pairs()
            .find(|(k, _)| k == "$filter")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(filter, "displayName eq 'Bob''s'");
        assert!(url.as_str().starts_with("https://graph.example/v1.0/me/mailFolders/msgfolderroot/childFolders"));
    }

    #[test]
    fn provider_rule_mapping() {
        let payload = json!({
            "value": [{
                "displayName": "VIB statements",
                "isEnabled": true,
                "conditions": {
                    "fromAddresses": [{ "emailAddress": { "address": "estatement@vib.com.vn" } }],
                    "subjectContains": ["SAO KE"]
                },
                "actions": { "moveToFolder": "folder-123" }
            }, {
                "isEnabled": false
            }, {
                "displayName": "No flag"
            }]
        });
        let page: GraphRulePage = serde_json::from_value(payload).unwrap();
        let rules: Vec<ProviderRule> = page.value.into_iter().map(GraphMessageRule::into_rule).collect();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].display_name.as_deref(), Some("VIB statements"));
        assert_eq!(rules[0].from_addresses, vec!["estatement@vib.com.vn"]);
        assert_eq!(rules[0].subject_contains, vec!["SAO KE"]);
        assert_eq!(rules[0].move_to_folder, Some(FolderId::new("folder-123")));
        assert!(!rules[1].is_enabled);
        assert!(rules[1].display_name.is_none());
        assert!(rules[2].is_enabled);
        assert!(rules[2].move_to_folder.is_none());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "é".repeat(300);
        let redacted = redact_response_body(&body);
        assert!(redacted.contains("[truncated 600 bytes]"));
    }

    // ── HTTP behaviour against a local stub ─────────────────────────

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn throttled_once(State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap) -> Response {
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer tok")
        );
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", "0")],
                "slow down",
            )
                .into_response();
        }
        axum::Json(json!({
            "value": [{ "id": "m1", "subject": "hi", "receivedDateTime": "2025-01-01T00:00:00Z" }]
        }))
        .into_response()
    }

    #[tokio::test]
    async fn retries_after_throttling() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/me/messages", get(throttled_once))
            .with_state(hits.clone());
        let base = serve(app).await;

        let graph = GraphMailbox::new(base);
        let page = graph
            .list_messages(&AccessToken::new("tok"), &FolderScope::AllMessages, 5)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.next.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let app = Router::new().route(
            "/me/mailFolders/{id}",
            get(|| async { (StatusCode::NOT_FOUND, "no such folder") }),
        );
        let base = serve(app).await;

        let graph = GraphMailbox::new(base);
        let err = graph
            .get_folder(&AccessToken::new("tok"), &FolderId::new("nope"))
            .await
            .unwrap_err();
        match err {
            MailboxError::Status { status, body, .. } => {
                assert_eq!(status, 404);
                assert_eq!(body, "no such folder");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hung_request_times_out() {
        let app = Router::new().route(
            "/me/mailFolders/{id}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "never"
            }),
        );
        let base = serve(app).await;

        let graph = GraphMailbox::with_timeout(base, Duration::from_millis(200));
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            graph.get_folder(&AccessToken::new("tok"), &FolderId::new("slow")),
        )
        .await
        .expect("request was not bounded")
        .unwrap_err();
        assert!(matches!(err, MailboxError::Request { .. }), "{err:?}");
    }
}
