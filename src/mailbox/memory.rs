//! In-process [`MailboxService`] used by tests and local dry runs.
//!
//! Behaves like the remote provider where the engine cares: messages are
//! listed newest first with opaque cursors, moves re-key the message, and
//! folder names are matched exactly. Individual operations can be made to
//! fail to exercise the engine's error paths.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailboxError;
use crate::mailbox::folders::split_path;
use crate::mailbox::{
    AccessToken, FolderId, FolderScope, MailFolder, MailMessage, MailboxService, MessagePage,
    ProviderRule, ResumeToken,
};

#[derive(Debug, Clone)]
struct FolderEntry {
    id: FolderId,
    parent: FolderId,
    display_name: String,
}

#[derive(Debug, Default)]
struct State {
    folders: Vec<FolderEntry>,
    messages: Vec<MailMessage>,
    cursors: HashMap<String, (Vec<MailMessage>, usize)>,
    provider_rules: Vec<ProviderRule>,
    next_id: u64,
    ops: HashMap<&'static str, usize>,
    failing_moves: HashSet<String>,
    failing_tags: HashSet<String>,
    fail_scoped_moves: bool,
    fail_folder_creation: bool,
    fail_listing: bool,
}

impl State {
    fn bump(&mut self, op: &'static str) {
        *self.ops.entry(op).or_default() += 1;
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn folder(&self, id: &FolderId) -> Option<&FolderEntry> {
        self.folders.iter().find(|f| &f.id == id)
    }

    fn to_mail_folder(&self, entry: &FolderEntry) -> MailFolder {
        let children = self.folders.iter().filter(|f| f.parent == entry.id).count();
        let unread = self
            .messages
            .iter()
            .filter(|m| m.parent_folder_id.as_ref() == Some(&entry.id) && !m.is_read)
            .count();
        MailFolder {
            id: entry.id.clone(),
            display_name: entry.display_name.clone(),
            child_folder_count: children as u32,
            unread_item_count: unread as u32,
        }
    }

    fn page(&mut self, mut remaining: Vec<MailMessage>, page_size: usize) -> MessagePage {
        let rest = if remaining.len() > page_size {
            remaining.split_off(page_size)
        } else {
            Vec::new()
        };
        let next = if rest.is_empty() {
            None
        } else {
            let token = self.fresh_id("cursor");
            self.cursors.insert(token.clone(), (rest, page_size));
            Some(ResumeToken::new(token))
        };
        MessagePage {
            messages: remaining,
            next,
        }
    }
}

fn failure(operation: &str, status: u16) -> MailboxError {
    MailboxError::Status {
        operation: operation.to_string(),
        status,
        body: "injected failure".into(),
    }
}

/// Mailbox held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    state: Mutex<State>,
}

impl MemoryMailbox {
    /// Empty mailbox with a single `inbox` folder under the root.
    pub fn new() -> Self {
        let mailbox = Self::default();
        mailbox.with_state(|s| {
            s.folders.push(FolderEntry {
                id: FolderId::new("inbox"),
                parent: FolderId::root(),
                display_name: "Inbox".into(),
            });
        });
        mailbox
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Add a message to a folder and return its id.
    pub fn add_message(
        &self,
        folder: &FolderId,
        subject: &str,
        sender_address: &str,
        sender_name: &str,
        received_at: DateTime<Utc>,
        is_read: bool,
    ) -> String {
        self.with_state(|s| {
            let id = s.fresh_id("msg");
            s.messages.push(MailMessage {
                id: id.clone(),
                subject: subject.to_string(),
                sender_address: sender_address.to_string(),
                sender_name: sender_name.to_string(),
                received_at,
                is_read,
                parent_folder_id: Some(folder.clone()),
                categories: Vec::new(),
            });
            id
        })
    }

    /// Add a message to the inbox.
    pub fn add_inbox_message(
        &self,
        subject: &str,
        sender_address: &str,
        received_at: DateTime<Utc>,
    ) -> String {
        self.add_message(
            &FolderId::new("inbox"),
            subject,
            sender_address,
            "",
            received_at,
            false,
        )
    }

    pub fn set_message_categories(&self, id: &str, categories: &[&str]) {
        self.with_state(|s| {
            if let Some(m) = s.messages.iter_mut().find(|m| m.id == id) {
                m.categories = categories.iter().map(|c| c.to_string()).collect();
            }
        });
    }

    pub fn add_provider_rule(&self, rule: ProviderRule) {
        self.with_state(|s| s.provider_rules.push(rule));
    }

    /// Moving this message fails with HTTP 500.
    pub fn fail_move(&self, message_id: &str) {
        self.with_state(|s| s.failing_moves.insert(message_id.to_string()));
    }

    /// Folder-scoped moves fail; unscoped moves still work.
    pub fn fail_scoped_moves(&self) {
        self.with_state(|s| s.fail_scoped_moves = true);
    }

    /// Category reads and writes for this message fail.
    pub fn fail_tags(&self, message_id: &str) {
        self.with_state(|s| s.failing_tags.insert(message_id.to_string()));
    }

    pub fn fail_folder_creation(&self) {
        self.with_state(|s| s.fail_folder_creation = true);
    }

    /// Every message listing fails.
    pub fn fail_listing(&self) {
        self.with_state(|s| s.fail_listing = true);
    }

    /// Number of calls made to one `MailboxService` method.
    pub fn op_count(&self, op: &str) -> usize {
        self.with_state(|s| s.ops.get(op).copied().unwrap_or(0))
    }

    /// Resolve a path without creating anything.
    pub fn folder_by_path(&self, path: &str) -> Option<FolderId> {
        self.with_state(|s| {
            let mut parent = FolderId::root();
            for segment in split_path(path) {
                let entry = s
                    .folders
                    .iter()
                    .find(|f| f.parent == parent && f.display_name == segment)?;
                parent = entry.id.clone();
            }
            Some(parent)
        })
    }

    /// How many children of `parent` carry `display_name`.
    pub fn children_named(&self, parent: &FolderId, display_name: &str) -> usize {
        self.with_state(|s| {
            s.folders
                .iter()
                .filter(|f| &f.parent == parent && f.display_name == display_name)
                .count()
        })
    }

    /// Messages currently in a folder.
    pub fn messages_in(&self, folder: &FolderId) -> Vec<MailMessage> {
        self.with_state(|s| {
            s.messages
                .iter()
                .filter(|m| m.parent_folder_id.as_ref() == Some(folder))
                .cloned()
                .collect()
        })
    }

    pub fn message(&self, id: &str) -> Option<MailMessage> {
        self.with_state(|s| s.messages.iter().find(|m| m.id == id).cloned())
    }
}

#[async_trait]
impl MailboxService for MemoryMailbox {
    async fn list_child_folders(
        &self,
        _token: &AccessToken,
        parent: &FolderId,
        display_name: Option<&str>,
    ) -> Result<Vec<MailFolder>, MailboxError> {
        self.with_state(|s| {
            s.bump("list_child_folders");
            let children: Vec<FolderEntry> = s
                .folders
                .iter()
                .filter(|f| &f.parent == parent)
                .filter(|f| display_name.is_none_or(|n| f.display_name == n))
                .cloned()
                .collect();
            Ok(children.iter().map(|f| s.to_mail_folder(f)).collect())
        })
    }

    async fn create_child_folder(
        &self,
        _token: &AccessToken,
        parent: &FolderId,
        display_name: &str,
    ) -> Result<MailFolder, MailboxError> {
        self.with_state(|s| {
            s.bump("create_child_folder");
            if s.fail_folder_creation {
                return Err(failure("create folder", 500));
            }
            let entry = FolderEntry {
                id: FolderId::new(s.fresh_id("folder")),
                parent: parent.clone(),
                display_name: display_name.to_string(),
            };
            s.folders.push(entry.clone());
            Ok(s.to_mail_folder(&entry))
        })
    }

    async fn get_folder(
        &self,
        _token: &AccessToken,
        id: &FolderId,
    ) -> Result<MailFolder, MailboxError> {
        self.with_state(|s| {
            s.bump("get_folder");
            match s.folder(id).cloned() {
                Some(entry) => Ok(s.to_mail_folder(&entry)),
                None => Err(failure("get folder", 404)),
            }
        })
    }

    async fn list_messages(
        &self,
        _token: &AccessToken,
        scope: &FolderScope,
        page_size: u32,
    ) -> Result<MessagePage, MailboxError> {
        self.with_state(|s| {
            s.bump("list_messages");
            if s.fail_listing {
                return Err(failure("list messages", 503));
            }
            let mut selected: Vec<MailMessage> = s
                .messages
                .iter()
                .filter(|m| match scope {
                    FolderScope::AllMessages => true,
                    FolderScope::Folder(id) => m.parent_folder_id.as_ref() == Some(id),
                })
                .cloned()
                .collect();
            selected.sort_by(|a, b| b.received_at.cmp(&a.received_at));
            Ok(s.page(selected, page_size.max(1) as usize))
        })
    }

    async fn next_messages(
        &self,
        _token: &AccessToken,
        resume: &ResumeToken,
    ) -> Result<MessagePage, MailboxError> {
        self.with_state(|s| {
            s.bump("next_messages");
            if s.fail_listing {
                return Err(failure("list messages", 503));
            }
            match s.cursors.remove(resume.as_str()) {
                Some((remaining, page_size)) => Ok(s.page(remaining, page_size)),
                None => Err(failure("list messages", 400)),
            }
        })
    }

    async fn move_message(
        &self,
        _token: &AccessToken,
        message_id: &str,
        destination: &FolderId,
        source: Option<&FolderId>,
    ) -> Result<String, MailboxError> {
        self.with_state(|s| {
            s.bump(if source.is_some() {
                "move_message_scoped"
            } else {
                "move_message"
            });
            if s.failing_moves.contains(message_id) {
                return Err(failure("move message", 500));
            }
            if source.is_some() && s.fail_scoped_moves {
                return Err(failure("move message", 404));
            }
            if s.folder(destination).is_none() {
                return Err(failure("move message", 404));
            }
            let new_id = s.fresh_id("msg");
            let message = s
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| failure("move message", 404))?;
            if let Some(src) = source {
                if message.parent_folder_id.as_ref() != Some(src) {
                    return Err(failure("move message", 404));
                }
            }
            message.id = new_id.clone();
            message.parent_folder_id = Some(destination.clone());
            Ok(new_id)
        })
    }

    async fn get_categories(
        &self,
        _token: &AccessToken,
        message_id: &str,
    ) -> Result<Vec<String>, MailboxError> {
        self.with_state(|s| {
            s.bump("get_categories");
            if s.failing_tags.contains(message_id) {
                return Err(failure("get categories", 500));
            }
            s.messages
                .iter()
                .find(|m| m.id == message_id)
                .map(|m| m.categories.clone())
                .ok_or_else(|| failure("get categories", 404))
        })
    }

    async fn set_categories(
        &self,
        _token: &AccessToken,
        message_id: &str,
        categories: &[String],
    ) -> Result<(), MailboxError> {
        self.with_state(|s| {
            s.bump("set_categories");
            if s.failing_tags.contains(message_id) {
                return Err(failure("set categories", 500));
            }
            let message = s
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| failure("set categories", 404))?;
            message.categories = categories.to_vec();
            Ok(())
        })
    }

    async fn list_provider_rules(
        &self,
        _token: &AccessToken,
    ) -> Result<Vec<ProviderRule>, MailboxError> {
        self.with_state(|s| {
            s.bump("list_provider_rules");
            Ok(s.provider_rules.clone())
        })
    }
}
