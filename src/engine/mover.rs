//! Batch mover/tagger: moves matched messages into one destination and
//! mutates their categories, isolating per-item failures.

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::scanner::Match;
use crate::error::{EngineError, MailboxError};
use crate::mailbox::{AccessToken, FolderId, FolderResolver, MailMessage, MailboxService};
use crate::notify::{Notifier, Severity};
use crate::store::{ExecutionLog, LogStatus, LogStore};

/// One message to process.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: String,
    /// Folder the message was listed from, enabling a folder-scoped move.
    pub source_folder: Option<FolderId>,
    /// The item's own tags to apply in add mode.
    pub categories: Vec<String>,
    pub rule_id: Option<Uuid>,
    pub subject: String,
    pub sender: String,
}

impl BatchItem {
    /// An item known only by id, as submitted to a bulk move.
    pub fn bare(id: impl Into<String>, source_folder: Option<FolderId>) -> Self {
        Self {
            id: id.into(),
            source_folder,
            categories: Vec::new(),
            rule_id: None,
            subject: String::new(),
            sender: String::new(),
        }
    }
}

impl From<&MailMessage> for BatchItem {
    fn from(message: &MailMessage) -> Self {
        Self {
            id: message.id.clone(),
            source_folder: message.parent_folder_id.clone(),
            categories: Vec::new(),
            rule_id: None,
            subject: message.subject.clone(),
            sender: message.sender_address.clone(),
        }
    }
}

impl From<&Match> for BatchItem {
    fn from(m: &Match) -> Self {
        Self {
            id: m.message.id.clone(),
            source_folder: m.message.parent_folder_id.clone(),
            categories: m.categories.clone(),
            rule_id: Some(m.rule_id),
            subject: m.message.subject.clone(),
            sender: m.message.sender_address.clone(),
        }
    }
}

/// How categories are mutated after the move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    /// Union of current tags with the item's tags (or the override).
    #[default]
    Add,
    /// Overwrite with the override; no override clears all tags.
    Replace,
    /// Remove every tag listed in the override.
    Remove,
}

impl TagMode {
    /// Map the two boolean flags used by bulk requests; `remove` wins.
    pub fn from_flags(replace_tags: bool, remove_mode: bool) -> Self {
        if remove_mode {
            Self::Remove
        } else if replace_tags {
            Self::Replace
        } else {
            Self::Add
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveOptions {
    /// Skip the move; only mutate tags.
    pub apply_tags_only: bool,
    pub tag_mode: TagMode,
}

/// Counts for one batch. `moved + failed <= items`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub moved: usize,
    pub failed: usize,
}

pub struct BatchMover<'a> {
    mailbox: &'a dyn MailboxService,
    logs: &'a dyn LogStore,
    notifier: &'a dyn Notifier,
}

impl<'a> BatchMover<'a> {
    pub fn new(
        mailbox: &'a dyn MailboxService,
        logs: &'a dyn LogStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            mailbox,
            logs,
            notifier,
        }
    }

    /// Move and tag `items`, one at a time.
    ///
    /// The destination is resolved once through `resolver`; a resolution
    /// failure aborts the batch before any item is touched. After that, a
    /// failing item is counted and the batch continues. One audit log row is
    /// written per item and a single failure notification is sent if
    /// anything failed.
    pub async fn move_batch(
        &self,
        token: &AccessToken,
        resolver: &mut FolderResolver,
        items: &[BatchItem],
        target_path: &str,
        category_override: Option<&[String]>,
        options: MoveOptions,
    ) -> Result<BatchOutcome, EngineError> {
        let destination = if options.apply_tags_only {
            None
        } else {
            let id = resolver
                .ensure_folder(self.mailbox, token, target_path)
                .await
                .map_err(|source| EngineError::FolderResolution {
                    path: target_path.to_string(),
                    source,
                })?;
            Some(id)
        };

        Ok(self
            .move_into(
                token,
                items,
                destination.as_ref(),
                target_path,
                category_override,
                options,
            )
            .await)
    }

    /// Process `items` against an already resolved destination.
    ///
    /// `destination` is `None` only in tags-only mode. `target_label` is what
    /// the audit log and notification report as the target.
    pub async fn move_into(
        &self,
        token: &AccessToken,
        items: &[BatchItem],
        destination: Option<&FolderId>,
        target_label: &str,
        category_override: Option<&[String]>,
        options: MoveOptions,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut records = Vec::with_capacity(items.len());

        for item in items {
            let result = self
                .process_item(token, item, destination, category_override, options)
                .await;

            let status = match &result {
                Ok(()) if options.apply_tags_only => LogStatus::Skipped,
                Ok(()) => LogStatus::Moved,
                Err(_) => LogStatus::Failed,
            };
            let mut record = ExecutionLog::new(
                item.rule_id,
                item.subject.clone(),
                item.sender.clone(),
                item.source_folder.as_ref().map(|f| f.to_string()),
                target_label,
                status,
            );

            match result {
                Ok(()) => outcome.moved += 1,
                Err(e) => {
                    warn!(message_id = %item.id, folder = target_label, error = %e, "Item failed");
                    outcome.failed += 1;
                    record = record.with_error(e.to_string());
                }
            }
            records.push(record);
        }

        self.write_logs(&records).await;

        info!(
            folder = target_label,
            moved = outcome.moved,
            failed = outcome.failed,
            "Batch complete"
        );

        if outcome.failed > 0 {
            self.notifier
                .notify(
                    Severity::Error,
                    &format!(
                        "Batch to {target_label}: {} of {} items failed",
                        outcome.failed,
                        items.len()
                    ),
                )
                .await;
        }

        outcome
    }

    async fn process_item(
        &self,
        token: &AccessToken,
        item: &BatchItem,
        destination: Option<&FolderId>,
        category_override: Option<&[String]>,
        options: MoveOptions,
    ) -> Result<(), MailboxError> {
        let current_id = match destination {
            Some(dest) => self.move_with_fallback(token, item, dest).await?,
            None => item.id.clone(),
        };
        self.apply_tags(token, &current_id, item, category_override, options.tag_mode)
            .await
    }

    /// Folder-scoped move when the source is known, retried once unscoped.
    async fn move_with_fallback(
        &self,
        token: &AccessToken,
        item: &BatchItem,
        destination: &FolderId,
    ) -> Result<String, MailboxError> {
        if let Some(source) = &item.source_folder {
            match self
                .mailbox
                .move_message(token, &item.id, destination, Some(source))
                .await
            {
                Ok(new_id) => return Ok(new_id),
                Err(e) => {
                    debug!(message_id = %item.id, error = %e, "Scoped move failed, retrying unscoped");
                }
            }
        }
        self.mailbox
            .move_message(token, &item.id, destination, None)
            .await
    }

    async fn apply_tags(
        &self,
        token: &AccessToken,
        message_id: &str,
        item: &BatchItem,
        category_override: Option<&[String]>,
        mode: TagMode,
    ) -> Result<(), MailboxError> {
        match mode {
            TagMode::Replace => {
                let tags = category_override.unwrap_or(&[]);
                self.mailbox.set_categories(token, message_id, tags).await
            }
            TagMode::Remove => {
                let to_remove = category_override.unwrap_or(&[]);
                if to_remove.is_empty() {
                    return Ok(());
                }
                let current = self.mailbox.get_categories(token, message_id).await?;
                let remaining: Vec<String> = current
                    .into_iter()
                    .filter(|c| !to_remove.contains(c))
                    .collect();
                self.mailbox
                    .set_categories(token, message_id, &remaining)
                    .await
            }
            TagMode::Add => {
                let to_add = category_override.unwrap_or(&item.categories);
                if to_add.is_empty() {
                    return Ok(());
                }
                let mut merged = self.mailbox.get_categories(token, message_id).await?;
                for tag in to_add {
                    if !merged.contains(tag) {
                        merged.push(tag.clone());
                    }
                }
                self.mailbox.set_categories(token, message_id, &merged).await
            }
        }
    }

    /// Write all audit rows concurrently; failures are logged and ignored.
    async fn write_logs(&self, records: &[ExecutionLog]) {
        let results = join_all(records.iter().map(|r| self.logs.append_log(r))).await;
        for e in results.into_iter().filter_map(Result::err) {
            warn!(error = %e, "Failed to write execution log");
        }
    }
}
