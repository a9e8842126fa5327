//! Rule matcher: a pure predicate over a message's fields.
//!
//! Evaluation short-circuits in a fixed order:
//! 1. read-state gate
//! 2. senders (any pattern contained in address or display name)
//! 3. keywords (every keyword contained in the subject)
//! 4. exclude keywords (none contained in the subject)
//!
//! All comparisons are substring checks on [`normalize`]d text.
//!
//! Across rules there is no priority field: callers hand over an ordered
//! slice and [`first_match`] returns the earliest rule that matches.

use tracing::debug;

use crate::rules::model::Rule;
use crate::rules::normalize::normalize;

/// Decide whether one message matches one rule.
pub fn matches(
    subject: &str,
    sender_address: &str,
    sender_name: &str,
    is_read: bool,
    rule: &Rule,
) -> bool {
    let conditions = &rule.conditions;

    if !conditions.read_filter.admits(is_read) {
        return false;
    }

    if !conditions.senders.is_empty() {
        let address = normalize(sender_address);
        let name = normalize(sender_name);
        let sender_hit = conditions.senders.iter().any(|pattern| {
            let pattern = normalize(pattern);
            address.contains(&pattern) || name.contains(&pattern)
        });
        if !sender_hit {
            return false;
        }
    }

    let subject_norm = normalize(subject);

    for keyword in &conditions.keywords {
        let keyword = normalize(keyword);
        if !subject_norm.contains(&keyword) {
            debug!(
                rule = %rule.name,
                keyword = %keyword,
                subject = %subject_norm,
                "Keyword missing from subject"
            );
            return false;
        }
    }

    if conditions
        .exclude_keywords
        .iter()
        .any(|k| subject_norm.contains(&normalize(k)))
    {
        debug!(rule = %rule.name, subject = %subject_norm, "Excluded keyword present");
        return false;
    }

    true
}

/// Whether every keyword appears in the subject after normalisation.
///
/// An empty keyword list passes.
pub fn keywords_all_present(subject: &str, keywords: &[String]) -> bool {
    let subject_norm = normalize(subject);
    keywords
        .iter()
        .all(|k| subject_norm.contains(&normalize(k)))
}

/// First rule in `rules` that matches, in slice order.
pub fn first_match<'r>(
    subject: &str,
    sender_address: &str,
    sender_name: &str,
    is_read: bool,
    rules: &'r [Rule],
) -> Option<&'r Rule> {
    rules
        .iter()
        .find(|rule| matches(subject, sender_address, sender_name, is_read, rule))
}
