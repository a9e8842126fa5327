//! libSQL backend: async `RuleStore` + `LogStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::rules::{NewRule, ReadFilter, Rule, RuleConditions};
use crate::store::migrations;
use crate::store::traits::{Database, ExecutionLog, LogStatus, LogStore, RuleStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_rules(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Rule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn rule_by_name(&self, name: &str) -> Result<Option<Rule>, DatabaseError> {
        let rules = self
            .query_rules(
                "rule_by_name",
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE name = ?1"),
                params![name],
            )
            .await?;
        Ok(rules.into_iter().next())
    }
}

// ── Helper functions ────────────────────────────────────────────────

const RULE_COLUMNS: &str = "id, name, description, target_folder, conditions, categories, is_active, source_folder, created_at, updated_at";

const LOG_COLUMNS: &str = "id, rule_id, subject, sender, source_folder, target_folder, status, error_message, processed_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn map_write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn row_to_rule(row: &libsql::Row) -> Result<Rule, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("rule row parse: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let name: String = row.get(1).map_err(read)?;
    let description: Option<String> = row.get(2).ok();
    let target_folder: String = row.get(3).map_err(read)?;
    let conditions_str: String = row.get::<String>(4).unwrap_or_else(|_| "{}".into());
    let categories_str: String = row.get::<String>(5).unwrap_or_else(|_| "[]".into());
    let is_active = row.get::<i64>(6).unwrap_or(0) != 0;
    let source_folder: Option<String> = row.get(7).ok();
    let created_str: String = row.get(8).map_err(read)?;
    let updated_str: String = row.get(9).map_err(read)?;

    let conditions: RuleConditions = serde_json::from_str(&conditions_str).map_err(|e| {
        DatabaseError::Serialization(format!("rule {name} conditions: {e}"))
    })?;
    let categories: Vec<String> = serde_json::from_str(&categories_str).map_err(|e| {
        DatabaseError::Serialization(format!("rule {name} categories: {e}"))
    })?;

    Ok(Rule {
        id: parse_uuid(&id_str)?,
        name,
        description,
        target_folder,
        conditions,
        categories,
        is_active,
        source_folder,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<ExecutionLog, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("log row parse: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let rule_id: Option<String> = row.get(1).ok();
    let status_str: String = row.get(6).map_err(read)?;
    let processed_str: String = row.get(8).map_err(read)?;

    Ok(ExecutionLog {
        id: parse_uuid(&id_str)?,
        rule_id: rule_id.as_deref().map(parse_uuid).transpose()?,
        subject: row.get(2).map_err(read)?,
        sender: row.get(3).map_err(read)?,
        source_folder: row.get(4).ok(),
        target_folder: row.get(5).map_err(read)?,
        status: status_str
            .parse::<LogStatus>()
            .map_err(DatabaseError::Serialization)?,
        error_message: row.get(7).ok(),
        processed_at: parse_datetime(&processed_str),
    })
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }
}

#[async_trait]
impl RuleStore for LibSqlBackend {
    async fn insert_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        let conditions = to_json(&rule.conditions)?;
        let categories = to_json(&rule.categories)?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO rules ({RULE_COLUMNS}, position) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
                     (SELECT COALESCE(MAX(position), 0) + 1 FROM rules))"
                ),
                params![
                    rule.id.to_string(),
                    rule.name.clone(),
                    opt_text(rule.description.as_deref()),
                    rule.target_folder.clone(),
                    conditions,
                    categories,
                    rule.is_active as i64,
                    opt_text(rule.source_folder.as_deref()),
                    rule.created_at.to_rfc3339(),
                    rule.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| map_write_error("insert_rule", e))?;

        debug!(rule_id = %rule.id, name = %rule.name, "Rule inserted");
        Ok(())
    }

    async fn update_rule(&self, id: Uuid, update: &NewRule) -> Result<Rule, DatabaseError> {
        let conditions = to_json(&update.conditions)?;
        let categories = to_json(&update.categories)?;
        let now = Utc::now().to_rfc3339();

        let changed = self
            .conn()
            .execute(
                "UPDATE rules SET name = ?1, description = ?2, target_folder = ?3, conditions = ?4, \
                 categories = ?5, is_active = ?6, source_folder = ?7, updated_at = ?8 WHERE id = ?9",
                params![
                    update.name.clone(),
                    opt_text(update.description.as_deref()),
                    update.target_folder.clone(),
                    conditions,
                    categories,
                    update.is_active as i64,
                    opt_text(update.source_folder.as_deref()),
                    now,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| map_write_error("update_rule", e))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }

        self.get_rule(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        })
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM rules WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        Ok(deleted > 0)
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE rules SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active as i64, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_rule_active: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }
        debug!(rule_id = %id, active, "Rule active flag updated");
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError> {
        let rules = self
            .query_rules(
                "get_rule",
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(rules.into_iter().next())
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, DatabaseError> {
        self.query_rules(
            "list_rules",
            &format!("SELECT {RULE_COLUMNS} FROM rules ORDER BY position, created_at"),
            (),
        )
        .await
    }

    async fn list_active_rules(&self) -> Result<Vec<Rule>, DatabaseError> {
        self.query_rules(
            "list_active_rules",
            &format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE is_active = 1 ORDER BY position, created_at"
            ),
            (),
        )
        .await
    }

    async fn get_rules_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Rule>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let all = self.list_rules().await?;
        Ok(all.into_iter().filter(|r| ids.contains(&r.id)).collect())
    }

    async fn upsert_rule_by_name(&self, rule: &NewRule) -> Result<Rule, DatabaseError> {
        match self.rule_by_name(&rule.name).await? {
            Some(existing) => {
                // Local-only fields (description, categories, source folder) survive.
                let conditions = to_json(&rule.conditions)?;
                self.conn()
                    .execute(
                        "UPDATE rules SET target_folder = ?1, conditions = ?2, is_active = ?3, \
                         updated_at = ?4 WHERE id = ?5",
                        params![
                            rule.target_folder.clone(),
                            conditions,
                            rule.is_active as i64,
                            Utc::now().to_rfc3339(),
                            existing.id.to_string(),
                        ],
                    )
                    .await
                    .map_err(|e| map_write_error("upsert_rule_by_name", e))?;
                self.get_rule(existing.id)
                    .await?
                    .ok_or_else(|| DatabaseError::NotFound {
                        entity: "rule".into(),
                        id: existing.id.to_string(),
                    })
            }
            None => {
                let created = rule.clone().into_rule();
                self.insert_rule(&created).await?;
                Ok(created)
            }
        }
    }

    async fn set_read_filter_all(&self, filter: ReadFilter) -> Result<usize, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut changed = 0;

        for rule in self.list_rules().await? {
            if rule.conditions.read_filter == filter {
                continue;
            }
            let conditions = RuleConditions {
                read_filter: filter,
                ..rule.conditions
            };
            self.conn()
                .execute(
                    "UPDATE rules SET conditions = ?1, updated_at = ?2 WHERE id = ?3",
                    params![to_json(&conditions)?, now.clone(), rule.id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("set_read_filter_all: {e}")))?;
            changed += 1;
        }

        info!(filter = filter.as_str(), changed, "Read filter applied to all rules");
        Ok(changed)
    }
}

#[async_trait]
impl LogStore for LibSqlBackend {
    async fn append_log(&self, log: &ExecutionLog) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO execution_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    log.id.to_string(),
                    opt_text(log.rule_id.map(|id| id.to_string()).as_deref()),
                    log.subject.clone(),
                    log.sender.clone(),
                    opt_text(log.source_folder.as_deref()),
                    log.target_folder.clone(),
                    log.status.as_str(),
                    opt_text(log.error_message.as_deref()),
                    log.processed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ExecutionLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM execution_logs ORDER BY processed_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }
}
