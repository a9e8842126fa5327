//! Remote mailbox abstraction.
//!
//! The engine only ever talks to the provider through [`MailboxService`].
//! Every call takes the resolved [`AccessToken`] explicitly; nothing in the
//! engine reaches for ambient session state.

pub mod folders;
pub mod graph;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, MailboxError};

pub use folders::{FOLDER_TREE_MAX_DEPTH, FolderNode, FolderResolver, list_folder_tree};
pub use graph::GraphMailbox;
pub use memory::MemoryMailbox;

/// Well-known id of the top of the folder tree.
pub const ROOT_FOLDER: &str = "msgfolderroot";

// ── Identifiers ─────────────────────────────────────────────────────

/// Provider-specific folder identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(String);

impl FolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The root sentinel folder resolution starts from.
    pub fn root() -> Self {
        Self(ROOT_FOLDER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque pagination cursor handed back by the provider.
///
/// Passed through verbatim; never parsed or constructed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Where a scan reads messages from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderScope {
    /// One folder, by id or well-known name (`inbox`, `archive`, ...).
    Folder(FolderId),
    /// The virtual "all messages" scope.
    AllMessages,
}

impl FolderScope {
    /// Parse a user-facing source name. `all` (any case) selects every message.
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        if source.is_empty() || source.eq_ignore_ascii_case("all") {
            Self::AllMessages
        } else {
            Self::Folder(FolderId::new(source))
        }
    }

    /// Folder id for logs and scoped moves, if this is a single folder.
    pub fn folder_id(&self) -> Option<&FolderId> {
        match self {
            Self::Folder(id) => Some(id),
            Self::AllMessages => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Folder(id) => id.as_str(),
            Self::AllMessages => "all",
        }
    }
}

// ── Credentials ─────────────────────────────────────────────────────

/// Resolved bearer token for the provider.
#[derive(Clone)]
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<SecretString> for AccessToken {
    fn from(secret: SecretString) -> Self {
        Self(secret)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Supplies access tokens. Token storage and refresh live behind this seam.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<AccessToken, AuthError>;
}

/// A fixed token from configuration; `None` always fails with `MissingToken`.
pub struct StaticTokenSource {
    token: Option<SecretString>,
}

impl StaticTokenSource {
    pub fn new(token: Option<SecretString>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<AccessToken, AuthError> {
        match &self.token {
            Some(t) if !t.expose_secret().trim().is_empty() => Ok(AccessToken::from(t.clone())),
            _ => Err(AuthError::MissingToken),
        }
    }
}

// ── Remote entities ─────────────────────────────────────────────────

/// A message as projected by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub subject: String,
    pub sender_address: String,
    pub sender_name: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub parent_folder_id: Option<FolderId>,
    pub categories: Vec<String>,
}

/// One page of a message listing.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<MailMessage>,
    /// Cursor for the next page; `None` on the last page.
    pub next: Option<ResumeToken>,
}

/// A mail folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailFolder {
    pub id: FolderId,
    pub display_name: String,
    pub child_folder_count: u32,
    pub unread_item_count: u32,
}

/// A rule stored natively by the provider (e.g. an Outlook inbox rule).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRule {
    pub display_name: Option<String>,
    pub is_enabled: bool,
    pub sender_contains: Vec<String>,
    pub from_addresses: Vec<String>,
    pub subject_contains: Vec<String>,
    pub move_to_folder: Option<FolderId>,
}

// ── Service trait ───────────────────────────────────────────────────

/// Paginated collection + command API of the remote mailbox.
///
/// Implementations perform exactly one logical remote operation per call;
/// transport-level retries (e.g. on throttling) are their own business.
#[async_trait]
pub trait MailboxService: Send + Sync {
    /// List child folders of `parent`, optionally filtered by exact display name.
    async fn list_child_folders(
        &self,
        token: &AccessToken,
        parent: &FolderId,
        display_name: Option<&str>,
    ) -> Result<Vec<MailFolder>, MailboxError>;

    /// Create a child folder under `parent`.
    async fn create_child_folder(
        &self,
        token: &AccessToken,
        parent: &FolderId,
        display_name: &str,
    ) -> Result<MailFolder, MailboxError>;

    /// Fetch a single folder.
    async fn get_folder(&self, token: &AccessToken, id: &FolderId)
    -> Result<MailFolder, MailboxError>;

    /// First page of messages in `scope`, newest first.
    async fn list_messages(
        &self,
        token: &AccessToken,
        scope: &FolderScope,
        page_size: u32,
    ) -> Result<MessagePage, MailboxError>;

    /// Follow a cursor from a previous page.
    async fn next_messages(
        &self,
        token: &AccessToken,
        resume: &ResumeToken,
    ) -> Result<MessagePage, MailboxError>;

    /// Move a message. With `source` set the move is folder-scoped.
    ///
    /// Returns the message's id after the move.
    async fn move_message(
        &self,
        token: &AccessToken,
        message_id: &str,
        destination: &FolderId,
        source: Option<&FolderId>,
    ) -> Result<String, MailboxError>;

    /// Current categories of a message.
    async fn get_categories(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<Vec<String>, MailboxError>;

    /// Overwrite the categories of a message.
    async fn set_categories(
        &self,
        token: &AccessToken,
        message_id: &str,
        categories: &[String],
    ) -> Result<(), MailboxError>;

    /// The provider's native inbox rules.
    async fn list_provider_rules(
        &self,
        token: &AccessToken,
    ) -> Result<Vec<ProviderRule>, MailboxError>;
}
