//! Rule execution orchestrator.
//!
//! Drives scan -> group -> move/tag -> aggregate -> notify for single rules,
//! the scheduled all-rules run and the multi-rule organize pass. Every public
//! operation returns an outcome struct; structural errors are converted into
//! `success: false` at this boundary and never escape as `Err`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::mover::{BatchItem, BatchMover, MoveOptions, TagMode};
use crate::engine::scanner::{Match, ScanPage, Scanner};
use crate::error::EngineError;
use crate::mailbox::{
    AccessToken, FOLDER_TREE_MAX_DEPTH, FolderId, FolderNode, FolderResolver, FolderScope,
    MailboxService, ProviderRule, ResumeToken, TokenSource, list_folder_tree,
};
use crate::notify::{Notifier, Severity};
use crate::rules::{NewRule, Rule};
use crate::store::{Database, LogStore, RuleStore};

/// Name given to synced provider rules that have none.
const UNTITLED_RULE: &str = "Untitled Rule";

/// Well-known id of the folder a reset moves mail into.
const INBOX: &str = "inbox";

/// Tunables for one orchestrator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: u32,
    /// Page ceiling per run.
    pub max_pages: usize,
    /// Matched-message ceiling per `run_rule` invocation.
    pub max_matched: usize,
    /// Source scope for rules without their own.
    pub default_source: String,
    /// Lower year bound for scheduled runs; `0` disables it.
    pub default_from_year: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 100,
            max_matched: 500,
            default_source: "inbox".to_string(),
            default_from_year: 0,
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
    pub matched: usize,
    pub moved: usize,
    pub failed: usize,
    pub pages: usize,
}

impl RunOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Per-rule line of a scheduled run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleResult {
    pub rule: String,
    pub success: bool,
    pub moved: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunAllOutcome {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<RuleResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parameters of a multi-rule organize pass. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrganizeRequest {
    /// Source scope; `all` scans every message.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub from_year: Option<i32>,
    /// Explicit rule selection; inactive rules in it are dropped. Empty or
    /// absent means every active rule.
    #[serde(default)]
    pub rule_ids: Option<Vec<Uuid>>,
    /// Send every match here instead of its rule's target folder.
    #[serde(default)]
    pub destination: Option<String>,
}

/// Counts for one destination folder of an organize pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub target: String,
    pub matched: usize,
    pub moved: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrganizeOutcome {
    pub success: bool,
    pub message: String,
    pub scanned: usize,
    pub matched: usize,
    pub moved: usize,
    pub failed: usize,
    pub pages: usize,
    /// Destinations in the order their first match was seen.
    pub groups: Vec<GroupOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetupOutcome {
    pub success: bool,
    /// Every path prefix that had to be created.
    pub created: Vec<String>,
    pub failures: Vec<PathFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderListOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub folders: Vec<FolderNode>,
}

/// One page of a dry-run scan.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub from_year: Option<i32>,
    #[serde(default)]
    pub rule_ids: Option<Vec<Uuid>>,
    /// Cursor returned by the previous preview page.
    #[serde(default)]
    pub resume: Option<ResumeToken>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreviewOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub scanned: usize,
    pub matches: Vec<Match>,
    pub resume: Option<ResumeToken>,
    pub stop: bool,
}

/// Bulk move or retag of explicit message ids.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MoveRequest {
    pub ids: Vec<String>,
    /// Destination path. Ignored with `apply_tags_only`.
    #[serde(default)]
    pub target: String,
    /// Folder the ids were listed from, enabling scoped moves.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub apply_tags_only: bool,
    #[serde(default)]
    pub replace_tags: bool,
    #[serde(default)]
    pub remove_mode: bool,
}

impl MoveRequest {
    pub fn options(&self) -> MoveOptions {
        MoveOptions {
            apply_tags_only: self.apply_tags_only,
            tag_mode: TagMode::from_flags(self.replace_tags, self.remove_mode),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MoveOutcome {
    pub success: bool,
    pub message: String,
    pub moved: usize,
    pub failed: usize,
}

/// Counts for one folder drained by a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderReset {
    pub path: String,
    pub moved: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetOutcome {
    pub success: bool,
    pub message: String,
    pub moved: usize,
    pub failed: usize,
    pub folders: Vec<FolderReset>,
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    rules: Arc<dyn RuleStore>,
    logs: Arc<dyn LogStore>,
    mailbox: Arc<dyn MailboxService>,
    tokens: Arc<dyn TokenSource>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    /// Serialises runs that move mail so two of them never race on folder creation.
    run_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new<S>(
        store: Arc<S>,
        mailbox: Arc<dyn MailboxService>,
        tokens: Arc<dyn TokenSource>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self
    where
        S: Database + 'static,
    {
        let rules: Arc<dyn RuleStore> = store.clone();
        let logs: Arc<dyn LogStore> = store;
        Self {
            rules,
            logs,
            mailbox,
            tokens,
            notifier,
            config,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rule_store(&self) -> &dyn RuleStore {
        self.rules.as_ref()
    }

    pub fn log_store(&self) -> &dyn LogStore {
        self.logs.as_ref()
    }

    /// Run one rule end-to-end. `from_year` falls back to the configured default.
    pub async fn run_rule(&self, rule_id: Uuid, from_year: Option<i32>) -> RunOutcome {
        let _guard = self.run_lock.lock().await;
        self.run_rule_unlocked(rule_id, from_year).await
    }

    async fn run_rule_unlocked(&self, rule_id: Uuid, from_year: Option<i32>) -> RunOutcome {
        let prepared = async {
            let token = self.tokens.access_token().await?;
            let rule = self.load_runnable_rule(rule_id).await?;
            Ok::<_, EngineError>((token, rule))
        }
        .await;

        let (token, rule) = match prepared {
            Ok(p) => p,
            Err(e) => {
                error!(%rule_id, error = %e, "Rule run rejected");
                return RunOutcome::rejected(e.to_string());
            }
        };

        let from_year = from_year.unwrap_or(self.config.default_from_year);
        let outcome = self.execute_rule(&token, &rule, from_year).await;

        let severity = if outcome.success && outcome.failed == 0 {
            Severity::Success
        } else {
            Severity::Error
        };
        self.notifier
            .notify(
                severity,
                &format!(
                    "Rule {}: matched {}, moved {}, failed {}",
                    rule.name, outcome.matched, outcome.moved, outcome.failed
                ),
            )
            .await;

        outcome
    }

    async fn load_runnable_rule(&self, rule_id: Uuid) -> Result<Rule, EngineError> {
        let rule = self
            .rules
            .get_rule(rule_id)
            .await?
            .ok_or(EngineError::RuleNotFound(rule_id))?;
        if !rule.is_active {
            return Err(EngineError::RuleInactive { name: rule.name });
        }
        Ok(rule)
    }

    /// Page loop for a single rule: each page's matches are moved before the
    /// next page is requested.
    async fn execute_rule(&self, token: &AccessToken, rule: &Rule, from_year: i32) -> RunOutcome {
        let scope = FolderScope::parse(
            rule.source_folder
                .as_deref()
                .unwrap_or(&self.config.default_source),
        );
        if rule.conditions.is_catch_all() {
            info!(rule = %rule.name, source = scope.label(), "Catch-all rule, every scanned message matches");
        }
        let rules = std::slice::from_ref(rule);
        let scanner = Scanner::new(self.mailbox.as_ref(), self.config.page_size);
        let mover = BatchMover::new(
            self.mailbox.as_ref(),
            self.logs.as_ref(),
            self.notifier.as_ref(),
        );
        let mut resolver = FolderResolver::new();

        let mut outcome = RunOutcome::default();
        let mut resume = None;
        let mut failure: Option<String> = None;

        while outcome.pages < self.config.max_pages {
            let page = match scanner
                .scan_page(token, &scope, resume.as_ref(), from_year, rules)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(rule = %rule.name, page = outcome.pages, error = %e, "Scan failed, stopping run");
                    failure = Some(e.to_string());
                    break;
                }
            };
            outcome.pages += 1;

            let more = page.has_more();
            let ScanPage {
                mut matches,
                resume: next,
                ..
            } = page;

            let capacity = self.config.max_matched.saturating_sub(outcome.matched);
            let capped = matches.len() >= capacity;
            matches.truncate(capacity);
            outcome.matched += matches.len();

            if !matches.is_empty() {
                let items: Vec<BatchItem> = matches.iter().map(BatchItem::from).collect();
                match mover
                    .move_batch(
                        token,
                        &mut resolver,
                        &items,
                        &rule.target_folder,
                        None,
                        MoveOptions::default(),
                    )
                    .await
                {
                    Ok(batch) => {
                        outcome.moved += batch.moved;
                        outcome.failed += batch.failed;
                    }
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "Batch aborted, stopping run");
                        outcome.failed += items.len();
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }

            if capped {
                info!(rule = %rule.name, max_matched = self.config.max_matched, "Match cap reached");
                break;
            }
            if !more {
                break;
            }
            resume = next;
        }

        if outcome.pages >= self.config.max_pages {
            info!(rule = %rule.name, pages = outcome.pages, "Page ceiling reached");
        }

        match failure {
            Some(message) => {
                outcome.success = false;
                outcome.message = message;
            }
            None => {
                outcome.success = true;
                outcome.message = format!(
                    "Moved {} of {} matched messages",
                    outcome.moved, outcome.matched
                );
            }
        }

        info!(
            rule = %rule.name,
            matched = outcome.matched,
            moved = outcome.moved,
            failed = outcome.failed,
            pages = outcome.pages,
            success = outcome.success,
            "Rule run finished"
        );
        outcome
    }

    /// Run every active rule in definition order. One rule's failure never
    /// stops the rest.
    pub async fn run_all_active_rules(&self) -> RunAllOutcome {
        let _guard = self.run_lock.lock().await;
        let timestamp = Utc::now();

        let rules = match self.rules.list_active_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "Failed to load active rules");
                return RunAllOutcome {
                    success: false,
                    timestamp,
                    results: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        info!(count = rules.len(), "Running all active rules");

        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            let outcome = self.run_rule_unlocked(rule.id, None).await;
            results.push(RuleResult {
                rule: rule.name,
                success: outcome.success,
                moved: outcome.moved,
                failed: outcome.failed,
                error: (!outcome.success).then_some(outcome.message),
            });
        }

        RunAllOutcome {
            success: true,
            timestamp,
            results,
            error: None,
        }
    }

    /// Scan a source with several rules, then move each destination group.
    pub async fn organize(&self, request: OrganizeRequest) -> OrganizeOutcome {
        let _guard = self.run_lock.lock().await;

        let prepared = async {
            let token = self.tokens.access_token().await?;
            let rules = self.select_rules(request.rule_ids.as_deref()).await?;
            Ok::<_, EngineError>((token, rules))
        }
        .await;

        let (token, rules) = match prepared {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Organize rejected");
                return OrganizeOutcome {
                    success: false,
                    message: e.to_string(),
                    ..Default::default()
                };
            }
        };

        let source = request
            .source
            .as_deref()
            .unwrap_or(&self.config.default_source);
        let scope = FolderScope::parse(source);
        let from_year = request.from_year.unwrap_or(self.config.default_from_year);

        let mut outcome = OrganizeOutcome::default();
        let mut failure: Option<String> = None;

        let matches = match self
            .collect_matches(&token, &scope, from_year, &rules, &mut outcome)
            .await
        {
            Ok(matches) => matches,
            Err((partial, e)) => {
                warn!(source = scope.label(), error = %e, "Scan failed, organizing partial results");
                failure = Some(e.to_string());
                partial
            }
        };
        outcome.matched = matches.len();

        let groups = group_by_target(&matches, request.destination.as_deref());
        let mover = BatchMover::new(
            self.mailbox.as_ref(),
            self.logs.as_ref(),
            self.notifier.as_ref(),
        );
        let mut resolver = FolderResolver::new();

        for (target, items) in groups {
            let mut group = GroupOutcome {
                target: target.clone(),
                matched: items.len(),
                moved: 0,
                failed: 0,
                error: None,
            };
            match mover
                .move_batch(
                    &token,
                    &mut resolver,
                    &items,
                    &target,
                    None,
                    MoveOptions::default(),
                )
                .await
            {
                Ok(batch) => {
                    group.moved = batch.moved;
                    group.failed = batch.failed;
                }
                Err(e) => {
                    warn!(folder = %target, error = %e, "Group skipped");
                    group.failed = items.len();
                    group.error = Some(e.to_string());
                    failure.get_or_insert_with(|| e.to_string());
                }
            }
            outcome.moved += group.moved;
            outcome.failed += group.failed;
            outcome.groups.push(group);
        }

        outcome.success = failure.is_none();
        outcome.message = match failure {
            Some(message) => message,
            None => format!(
                "Moved {} of {} matched messages into {} folders",
                outcome.moved,
                outcome.matched,
                outcome.groups.len()
            ),
        };

        info!(
            source = scope.label(),
            scanned = outcome.scanned,
            matched = outcome.matched,
            moved = outcome.moved,
            failed = outcome.failed,
            "Organize finished"
        );

        let severity = if outcome.success && outcome.failed == 0 {
            Severity::Success
        } else {
            Severity::Error
        };
        self.notifier
            .notify(
                severity,
                &format!(
                    "Organize {}: matched {}, moved {}, failed {}",
                    scope.label(),
                    outcome.matched,
                    outcome.moved,
                    outcome.failed
                ),
            )
            .await;

        outcome
    }

    async fn select_rules(&self, ids: Option<&[Uuid]>) -> Result<Vec<Rule>, EngineError> {
        let rules = match ids {
            Some(ids) if !ids.is_empty() => {
                let mut picked = self.rules.get_rules_by_ids(ids).await?;
                picked.retain(|r| r.is_active);
                picked
            }
            _ => self.rules.list_active_rules().await?,
        };
        if rules.is_empty() {
            return Err(EngineError::NoActiveRules);
        }
        Ok(rules)
    }

    /// Scan pages until the source is exhausted, the year cutoff is hit or
    /// the page ceiling is reached. A page failure returns what was collected.
    async fn collect_matches(
        &self,
        token: &AccessToken,
        scope: &FolderScope,
        from_year: i32,
        rules: &[Rule],
        outcome: &mut OrganizeOutcome,
    ) -> Result<Vec<Match>, (Vec<Match>, EngineError)> {
        let scanner = Scanner::new(self.mailbox.as_ref(), self.config.page_size);
        let mut matches = Vec::new();
        let mut resume = None;

        while outcome.pages < self.config.max_pages {
            let page = match scanner
                .scan_page(token, scope, resume.as_ref(), from_year, rules)
                .await
            {
                Ok(page) => page,
                Err(e) => return Err((matches, e.into())),
            };
            outcome.pages += 1;
            outcome.scanned += page.scanned;

            let more = page.has_more();
            matches.extend(page.matches);
            if !more {
                break;
            }
            resume = page.resume;
        }
        Ok(matches)
    }

    /// Scan a single page without moving anything.
    ///
    /// The returned `resume` feeds the next call; it is `None` once the
    /// source is exhausted or the year cutoff was reached.
    pub async fn preview(&self, request: PreviewRequest) -> PreviewOutcome {
        let scanned = async {
            let token = self.tokens.access_token().await?;
            let rules = self.select_rules(request.rule_ids.as_deref()).await?;
            let scope = FolderScope::parse(
                request
                    .source
                    .as_deref()
                    .unwrap_or(&self.config.default_source),
            );
            let from_year = request.from_year.unwrap_or(self.config.default_from_year);
            let page = Scanner::new(self.mailbox.as_ref(), self.config.page_size)
                .scan_page(&token, &scope, request.resume.as_ref(), from_year, &rules)
                .await?;
            Ok::<_, EngineError>(page)
        }
        .await;

        match scanned {
            Ok(page) => PreviewOutcome {
                success: true,
                error: None,
                scanned: page.scanned,
                matches: page.matches,
                resume: page.resume,
                stop: page.stop,
            },
            Err(e) => {
                error!(error = %e, "Preview scan failed");
                PreviewOutcome {
                    success: false,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Move and/or retag explicit message ids as one batch.
    pub async fn move_messages(&self, request: MoveRequest) -> MoveOutcome {
        let _guard = self.run_lock.lock().await;

        let token = match self.tokens.access_token().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Bulk move rejected");
                return MoveOutcome {
                    success: false,
                    message: EngineError::from(e).to_string(),
                    ..Default::default()
                };
            }
        };

        let options = request.options();
        if !options.apply_tags_only && request.target.trim().is_empty() {
            return MoveOutcome {
                success: false,
                message: "A target folder is required unless only tags are applied".into(),
                ..Default::default()
            };
        }

        let source = request.source.as_deref().map(FolderId::new);
        let items: Vec<BatchItem> = request
            .ids
            .iter()
            .map(|id| BatchItem::bare(id.as_str(), source.clone()))
            .collect();

        let mover = BatchMover::new(
            self.mailbox.as_ref(),
            self.logs.as_ref(),
            self.notifier.as_ref(),
        );
        let batch = mover
            .move_batch(
                &token,
                &mut FolderResolver::new(),
                &items,
                &request.target,
                request.categories.as_deref(),
                options,
            )
            .await;

        match batch {
            Ok(batch) => MoveOutcome {
                success: true,
                message: format!("Processed {} of {} messages", batch.moved, items.len()),
                moved: batch.moved,
                failed: batch.failed,
            },
            Err(e) => {
                warn!(folder = %request.target, error = %e, "Bulk move aborted");
                MoveOutcome {
                    success: false,
                    message: e.to_string(),
                    moved: 0,
                    failed: items.len(),
                }
            }
        }
    }

    /// Move the mail of every non-system folder back to the inbox.
    ///
    /// Folders are drained one at a time; a folder whose listing fails is
    /// reported and the rest still run. Folders are left in place.
    pub async fn reset_to_inbox(&self) -> ResetOutcome {
        let _guard = self.run_lock.lock().await;

        let listed = async {
            let token = self.tokens.access_token().await?;
            let tree =
                list_folder_tree(self.mailbox.as_ref(), &token, FOLDER_TREE_MAX_DEPTH).await?;
            Ok::<_, EngineError>((token, tree))
        }
        .await;

        let (token, tree) = match listed {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "Reset rejected");
                return ResetOutcome {
                    success: false,
                    message: e.to_string(),
                    ..Default::default()
                };
            }
        };

        let scanner = Scanner::new(self.mailbox.as_ref(), self.config.page_size);
        let mover = BatchMover::new(
            self.mailbox.as_ref(),
            self.logs.as_ref(),
            self.notifier.as_ref(),
        );
        let inbox = FolderId::new(INBOX);
        let mut outcome = ResetOutcome::default();

        for folder in resettable_folders(tree) {
            let drained = self
                .drain_folder(&token, &scanner, &mover, &folder, &inbox)
                .await;
            outcome.moved += drained.moved;
            outcome.failed += drained.failed;
            outcome.folders.push(drained);
        }

        let errors = outcome.folders.iter().filter(|f| f.error.is_some()).count();
        outcome.success = errors == 0;
        outcome.message = if errors == 0 {
            format!(
                "Moved {} messages back to Inbox from {} folders",
                outcome.moved,
                outcome.folders.len()
            )
        } else {
            format!("{errors} folders could not be listed")
        };

        info!(
            folders = outcome.folders.len(),
            moved = outcome.moved,
            failed = outcome.failed,
            "Reset finished"
        );

        let severity = if outcome.success && outcome.failed == 0 {
            Severity::Success
        } else {
            Severity::Error
        };
        self.notifier
            .notify(
                severity,
                &format!(
                    "Reset to Inbox: moved {}, failed {}",
                    outcome.moved, outcome.failed
                ),
            )
            .await;

        outcome
    }

    async fn drain_folder(
        &self,
        token: &AccessToken,
        scanner: &Scanner<'_>,
        mover: &BatchMover<'_>,
        folder: &FolderNode,
        inbox: &FolderId,
    ) -> FolderReset {
        let scope = FolderScope::Folder(folder.id.clone());
        let mut result = FolderReset {
            path: folder.path.clone(),
            moved: 0,
            failed: 0,
            error: None,
        };
        // Ids handed to the mover. Moved mail leaves the folder, so a
        // repeat sighting is an item that already failed.
        let mut attempted: HashSet<String> = HashSet::new();
        let mut pages = 0;

        // Provider cursors may be offset based and moving shifts later
        // pages, so passes repeat until one moves nothing.
        'passes: loop {
            let mut moved_this_pass = 0;
            let mut resume: Option<ResumeToken> = None;
            loop {
                if pages >= self.config.max_pages {
                    info!(folder = %folder.path, pages, "Page ceiling reached");
                    break 'passes;
                }
                let page = match scanner.fetch_page(token, &scope, resume.as_ref()).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(folder = %folder.path, error = %e, "Listing failed, skipping rest of folder");
                        result.error = Some(e.to_string());
                        break 'passes;
                    }
                };
                pages += 1;

                let items: Vec<BatchItem> = page
                    .messages
                    .iter()
                    .filter(|m| attempted.insert(m.id.clone()))
                    .map(BatchItem::from)
                    .collect();
                if !items.is_empty() {
                    let batch = mover
                        .move_into(token, &items, Some(inbox), INBOX, None, MoveOptions::default())
                        .await;
                    result.moved += batch.moved;
                    result.failed += batch.failed;
                    moved_this_pass += batch.moved;
                }

                match page.next {
                    Some(next) => resume = Some(next),
                    None => break,
                }
            }
            if moved_this_pass == 0 {
                break;
            }
        }

        debug!(folder = %folder.path, moved = result.moved, failed = result.failed, "Folder drained");
        result
    }

    /// Import the provider's native inbox rules, upserting by name.
    ///
    /// Provider rules that do not move mail have no counterpart here and are
    /// skipped.
    pub async fn sync_provider_rules(&self) -> SyncOutcome {
        let fetched = async {
            let token = self.tokens.access_token().await?;
            let remote = self.mailbox.list_provider_rules(&token).await?;
            Ok::<_, EngineError>((token, remote))
        }
        .await;

        let (token, remote) = match fetched {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Provider rule sync failed");
                return SyncOutcome {
                    success: false,
                    message: e.to_string(),
                    count: 0,
                };
            }
        };

        let mut count = 0;
        for provider_rule in &remote {
            let Some(rule) = self.translate_provider_rule(&token, provider_rule).await else {
                continue;
            };
            match self.rules.upsert_rule_by_name(&rule).await {
                Ok(saved) => {
                    info!(rule = %saved.name, folder = %saved.target_folder, "Synced provider rule");
                    count += 1;
                }
                Err(e) => warn!(rule = %rule.name, error = %e, "Failed to save synced rule"),
            }
        }

        SyncOutcome {
            success: true,
            message: format!("Synced {count} of {} provider rules", remote.len()),
            count,
        }
    }

    async fn translate_provider_rule(
        &self,
        token: &AccessToken,
        provider_rule: &ProviderRule,
    ) -> Option<NewRule> {
        let folder_id = provider_rule.move_to_folder.as_ref()?;
        let target = match self.mailbox.get_folder(token, folder_id).await {
            Ok(folder) => folder.display_name,
            Err(e) => {
                warn!(folder = %folder_id, error = %e, "Folder lookup failed, using raw id");
                folder_id.to_string()
            }
        };

        let name = provider_rule
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNTITLED_RULE);

        let sender = provider_rule
            .sender_contains
            .first()
            .or_else(|| provider_rule.from_addresses.first());

        let mut rule = NewRule::new(name, target)
            .with_senders(sender.cloned())
            .with_keywords(provider_rule.subject_contains.iter().cloned());
        rule.is_active = provider_rule.is_enabled;
        Some(rule)
    }

    /// Ensure each path exists, sharing one resolver across paths.
    pub async fn setup_folders(&self, paths: &[String]) -> SetupOutcome {
        let token = match self.tokens.access_token().await {
            Ok(t) => t,
            Err(e) => {
                return SetupOutcome {
                    success: false,
                    created: Vec::new(),
                    failures: vec![PathFailure {
                        path: String::new(),
                        error: EngineError::from(e).to_string(),
                    }],
                };
            }
        };

        let _guard = self.run_lock.lock().await;
        let mut resolver = FolderResolver::new();
        let mut failures = Vec::new();

        for path in paths {
            if let Err(e) = resolver
                .ensure_folder(self.mailbox.as_ref(), &token, path)
                .await
            {
                warn!(path = %path, error = %e, "Folder setup failed");
                failures.push(PathFailure {
                    path: path.clone(),
                    error: e.to_string(),
                });
            }
        }

        let created = resolver.created_paths().to_vec();
        info!(requested = paths.len(), created = created.len(), failed = failures.len(), "Folder setup finished");
        SetupOutcome {
            success: failures.is_empty(),
            created,
            failures,
        }
    }

    /// The whole folder tree, breadth first, down to the depth cap.
    pub async fn list_folders(&self) -> FolderListOutcome {
        let listed = async {
            let token = self.tokens.access_token().await?;
            let folders =
                list_folder_tree(self.mailbox.as_ref(), &token, FOLDER_TREE_MAX_DEPTH).await?;
            Ok::<_, EngineError>(folders)
        }
        .await;

        match listed {
            Ok(folders) => FolderListOutcome {
                success: true,
                error: None,
                folders,
            },
            Err(e) => {
                error!(error = %e, "Folder listing failed");
                FolderListOutcome {
                    success: false,
                    error: Some(e.to_string()),
                    folders: Vec::new(),
                }
            }
        }
    }
}

/// Well-known folder names a reset never drains, compared without case or spaces.
const SYSTEM_FOLDERS: &[&str] = &[
    "inbox",
    "drafts",
    "sentitems",
    "deleteditems",
    "junkemail",
    "outbox",
    "archive",
    "conversationhistory",
];

fn is_system_folder(name: &str) -> bool {
    let key: String = name
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    SYSTEM_FOLDERS.contains(&key.as_str())
}

/// Drop system folders and everything below them. Expects the breadth-first
/// order of [`list_folder_tree`].
fn resettable_folders(tree: Vec<FolderNode>) -> Vec<FolderNode> {
    let mut excluded: Vec<String> = Vec::new();
    tree.into_iter()
        .filter(|node| {
            if node.depth == 0
                && (is_system_folder(&node.display_name) || is_system_folder(node.id.as_str()))
            {
                excluded.push(format!("{}/", node.path));
                return false;
            }
            !excluded.iter().any(|prefix| node.path.starts_with(prefix.as_str()))
        })
        .collect()
}

/// Group matches by destination, keeping first-seen order.
fn group_by_target(matches: &[Match], destination: Option<&str>) -> Vec<(String, Vec<BatchItem>)> {
    let mut groups: Vec<(String, Vec<BatchItem>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for m in matches {
        let target = destination.unwrap_or(&m.target_folder).to_string();
        let slot = *index.entry(target.clone()).or_insert_with(|| {
            groups.push((target, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(BatchItem::from(m));
    }
    groups
}
