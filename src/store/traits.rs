//! Storage traits for rules and execution logs.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::rules::{NewRule, ReadFilter, Rule};

/// Outcome recorded for one processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Moved,
    Failed,
    /// Processed without a move (tag-only batches).
    Skipped,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Moved => "moved",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moved" => Ok(Self::Moved),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown log status: {other}")),
        }
    }
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    /// Loose reference; the rule may since have been deleted.
    pub rule_id: Option<Uuid>,
    pub subject: String,
    pub sender: String,
    pub source_folder: Option<String>,
    pub target_folder: String,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(
        rule_id: Option<Uuid>,
        subject: impl Into<String>,
        sender: impl Into<String>,
        source_folder: Option<String>,
        target_folder: impl Into<String>,
        status: LogStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            subject: subject.into(),
            sender: sender.into(),
            source_folder,
            target_folder: target_folder.into(),
            status,
            error_message: None,
            processed_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Rule persistence. Listing order is definition order.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert a new rule at the end of the definition order.
    async fn insert_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    /// Replace a rule's editable fields, keeping id, position and `created_at`.
    async fn update_rule(&self, id: Uuid, update: &NewRule) -> Result<Rule, DatabaseError>;

    /// Delete a rule permanently. Returns whether a row was removed.
    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn set_rule_active(&self, id: Uuid, active: bool) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError>;

    async fn list_rules(&self) -> Result<Vec<Rule>, DatabaseError>;

    async fn list_active_rules(&self) -> Result<Vec<Rule>, DatabaseError>;

    /// Rules with the given ids, in definition order. Unknown ids are ignored.
    async fn get_rules_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Rule>, DatabaseError>;

    /// Update the rule with this name, or insert it if none exists.
    /// Insert `rule`, or refresh the rule of the same name. An existing rule
    /// only takes the target folder, conditions and active flag; its
    /// description, categories and source folder are kept.
    async fn upsert_rule_by_name(&self, rule: &NewRule) -> Result<Rule, DatabaseError>;

    /// Set the read filter on every rule. Returns the number of rules changed.
    async fn set_read_filter_all(&self, filter: ReadFilter) -> Result<usize, DatabaseError>;
}

/// Append-only execution log.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log(&self, log: &ExecutionLog) -> Result<(), DatabaseError>;

    /// Most recent entries first.
    async fn recent_logs(&self, limit: usize) -> Result<Vec<ExecutionLog>, DatabaseError>;
}

/// Full persistence backend.
#[async_trait]
pub trait Database: RuleStore + LogStore {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
