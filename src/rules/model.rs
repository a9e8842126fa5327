//! Rule data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Read-state gate on a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFilter {
    /// Match regardless of read state.
    #[default]
    Any,
    /// Only unread messages.
    UnreadOnly,
    /// Only messages already read.
    ReadOnly,
}

impl ReadFilter {
    /// Whether a message with the given read state passes the gate.
    pub fn admits(self, is_read: bool) -> bool {
        match self {
            Self::Any => true,
            Self::UnreadOnly => !is_read,
            Self::ReadOnly => is_read,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::UnreadOnly => "unread_only",
            Self::ReadOnly => "read_only",
        }
    }
}

/// Matching conditions. Empty lists mean "don't filter on this".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredConditions")]
pub struct RuleConditions {
    /// Substrings of the sender address or display name (any of).
    pub senders: Vec<String>,
    /// Substrings that must all appear in the subject.
    pub keywords: Vec<String>,
    /// Substrings that must not appear in the subject.
    pub exclude_keywords: Vec<String>,
    pub read_filter: ReadFilter,
}

impl RuleConditions {
    /// True when no sender, keyword, exclude or read condition is set.
    pub fn is_catch_all(&self) -> bool {
        self.senders.is_empty()
            && self.keywords.is_empty()
            && self.exclude_keywords.is_empty()
            && self.read_filter == ReadFilter::Any
    }
}

/// On-disk shape of [`RuleConditions`].
///
/// Older rows carry the two boolean flags `must_be_read` / `unread_only`
/// instead of `read_filter`; they are folded into the tri-state here.
#[derive(Deserialize)]
struct StoredConditions {
    #[serde(default)]
    senders: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    exclude_keywords: Vec<String>,
    #[serde(default)]
    read_filter: Option<ReadFilter>,
    #[serde(default)]
    must_be_read: Option<bool>,
    #[serde(default)]
    unread_only: Option<bool>,
}

impl From<StoredConditions> for RuleConditions {
    fn from(raw: StoredConditions) -> Self {
        let read_filter = raw.read_filter.unwrap_or(
            if raw.must_be_read.unwrap_or(false) {
                ReadFilter::ReadOnly
            } else if raw.unread_only.unwrap_or(false) {
                ReadFilter::UnreadOnly
            } else {
                ReadFilter::Any
            },
        );
        Self {
            senders: clean_list(raw.senders),
            keywords: clean_list(raw.keywords),
            exclude_keywords: clean_list(raw.exclude_keywords),
            read_filter,
        }
    }
}

/// Drop blank entries; a blank pattern would otherwise match everything.
fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A persisted matching policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    /// Display label, unique; the dedup key for provider rule sync.
    pub name: String,
    pub description: Option<String>,
    /// `/`-delimited destination path, e.g. `Banking/VCB`.
    pub target_folder: String,
    pub conditions: RuleConditions,
    /// Tags applied to matched messages.
    pub categories: Vec<String>,
    pub is_active: bool,
    /// Source scope for single-rule runs; `None` uses the configured default.
    pub source_folder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating, updating or upserting a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_folder: String,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub source_folder: Option<String>,
}

fn default_active() -> bool {
    true
}

impl NewRule {
    pub fn new(name: impl Into<String>, target_folder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_folder: target_folder.into(),
            is_active: true,
            ..Default::default()
        }
    }

    pub fn with_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.senders = senders.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.exclude_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_read_filter(mut self, read_filter: ReadFilter) -> Self {
        self.conditions.read_filter = read_filter;
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source_folder(mut self, source: impl Into<String>) -> Self {
        self.source_folder = Some(source.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Materialise into a [`Rule`] with a fresh id and timestamps.
    pub fn into_rule(self) -> Rule {
        let now = Utc::now();
        Rule {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            target_folder: self.target_folder,
            conditions: self.conditions,
            categories: self.categories,
            is_active: self.is_active,
            source_folder: self.source_folder,
            created_at: now,
            updated_at: now,
        }
    }
}
