//! Paginated scanner: one page of messages against an ordered rule set.

use chrono::Datelike;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MailboxError;
use crate::mailbox::{
    AccessToken, FolderScope, MailMessage, MailboxService, MessagePage, ResumeToken,
};
use crate::rules::{Rule, first_match, keywords_all_present};

/// A message matched by a rule during one scan-to-move cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub message: MailMessage,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub target_folder: String,
    pub categories: Vec<String>,
}

/// Result of scanning one page.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub matches: Vec<Match>,
    /// Cursor for the next page. Always `None` when `stop` is set.
    pub resume: Option<ResumeToken>,
    /// An older-than-cutoff message was reached; request no further pages.
    pub stop: bool,
    /// Messages evaluated on this page.
    pub scanned: usize,
}

impl ScanPage {
    /// Whether the caller may request another page.
    pub fn has_more(&self) -> bool {
        !self.stop && self.resume.is_some()
    }
}

pub struct Scanner<'a> {
    mailbox: &'a dyn MailboxService,
    page_size: u32,
}

impl<'a> Scanner<'a> {
    pub fn new(mailbox: &'a dyn MailboxService, page_size: u32) -> Self {
        Self { mailbox, page_size }
    }

    /// Fetch and evaluate one page.
    ///
    /// Without `resume` a fresh newest-first listing of `scope` is started;
    /// with it the provider cursor is followed verbatim. `from_year <= 0`
    /// disables the year cutoff.
    ///
    /// Rules are tried in slice order and the first match wins. The cutoff
    /// relies on the listing being sorted by received time, newest first:
    /// once one message is older than `from_year`, everything after it is too.
    pub async fn scan_page(
        &self,
        token: &AccessToken,
        scope: &FolderScope,
        resume: Option<&ResumeToken>,
        from_year: i32,
        rules: &[Rule],
    ) -> Result<ScanPage, MailboxError> {
        let page = self.fetch_page(token, scope, resume).await?;

        let mut out = ScanPage::default();

        for message in page.messages {
            if from_year > 0 && message.received_at.year() < from_year {
                debug!(
                    received_at = %message.received_at,
                    from_year,
                    "Reached messages older than cutoff"
                );
                out.stop = true;
                break;
            }
            out.scanned += 1;

            if let Some(rule) = match_message(&message, rules) {
                out.matches.push(Match {
                    rule_id: rule.id,
                    rule_name: rule.name.clone(),
                    target_folder: rule.target_folder.clone(),
                    categories: rule.categories.clone(),
                    message,
                });
            }
        }

        if !out.stop {
            out.resume = page.next;
        }

        debug!(
            scope = scope.label(),
            scanned = out.scanned,
            matched = out.matches.len(),
            stop = out.stop,
            "Scanned page"
        );
        Ok(out)
    }

    /// Raw page of `scope`: a fresh listing, or the page behind `resume`.
    pub async fn fetch_page(
        &self,
        token: &AccessToken,
        scope: &FolderScope,
        resume: Option<&ResumeToken>,
    ) -> Result<MessagePage, MailboxError> {
        match resume {
            Some(cursor) => self.mailbox.next_messages(token, cursor).await,
            None => {
                self.mailbox
                    .list_messages(token, scope, self.page_size)
                    .await
            }
        }
    }
}

/// First rule that matches and whose keywords all reappear in the subject.
fn match_message<'r>(message: &MailMessage, rules: &'r [Rule]) -> Option<&'r Rule> {
    let mut remaining = rules;
    while let Some(rule) = first_match(
        &message.subject,
        &message.sender_address,
        &message.sender_name,
        message.is_read,
        remaining,
    ) {
        // Guard against the matcher and the keyword check drifting apart.
        if keywords_all_present(&message.subject, &rule.conditions.keywords) {
            return Some(rule);
        }
        warn!(
            rule = %rule.name,
            message_id = %message.id,
            "Matcher accepted a subject missing rule keywords; skipping rule"
        );
        let position = remaining.iter().position(|r| r.id == rule.id)?;
        remaining = &remaining[position + 1..];
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::mailbox::{FolderId, MemoryMailbox};
    use crate::rules::NewRule;

    fn token() -> AccessToken {
        AccessToken::new("t")
    }

    fn inbox() -> FolderScope {
        FolderScope::Folder(FolderId::new("inbox"))
    }

    fn at(year: i32, month: u32, day: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn year_cutoff_stops_scan() {
        let mailbox = MemoryMailbox::new();
        mailbox.add_inbox_message("Statement March", "bank@vcb.vn", at(2025, 3, 1));
        mailbox.add_inbox_message("Statement January", "bank@vcb.vn", at(2025, 1, 5));
        mailbox.add_inbox_message("Statement December", "bank@vcb.vn", at(2024, 12, 30));
        mailbox.add_inbox_message("Statement November", "bank@vcb.vn", at(2024, 11, 30));

        let rules = vec![NewRule::new("All", "Archive").into_rule()];
        let scanner = Scanner::new(&mailbox, 50);
        let page = scanner
            .scan_page(&token(), &inbox(), None, 2025, &rules)
            .await
            .unwrap();

        assert!(page.stop);
        assert!(page.resume.is_none());
        assert!(!page.has_more());
        assert_eq!(page.scanned, 2);
        let subjects: Vec<&str> = page
            .matches
            .iter()
            .map(|m| m.message.subject.as_str())
            .collect();
        assert_eq!(subjects, ["Statement March", "Statement January"]);
    }

    #[tokio::test]
    async fn zero_year_disables_cutoff() {
        let mailbox = MemoryMailbox::new();
        mailbox.add_inbox_message("old", "a@b.c", at(2001, 1, 1));
        let rules = vec![NewRule::new("All", "Archive").into_rule()];
        let page = Scanner::new(&mailbox, 10)
            .scan_page(&token(), &inbox(), None, 0, &rules)
            .await
            .unwrap();
        assert!(!page.stop);
        assert_eq!(page.matches.len(), 1);
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let mailbox = MemoryMailbox::new();
        mailbox.add_inbox_message("Cashback Visa reward", "promo@vib.com.vn", at(2025, 6, 1));
        mailbox.add_inbox_message("Weekly digest", "news@vib.com.vn", at(2025, 6, 2));

        let rules = vec![
            NewRule::new("Cashback", "Cards/Cashback")
                .with_keywords(["CASHBACK"])
                .with_categories(["Promo"])
                .into_rule(),
            NewRule::new("VIB", "Banking/VIB")
                .with_senders(["vib.com.vn"])
                .into_rule(),
        ];
        let page = Scanner::new(&mailbox, 10)
            .scan_page(&token(), &inbox(), None, 2025, &rules)
            .await
            .unwrap();

        assert_eq!(page.matches.len(), 2);
        let digest = &page.matches[0];
        assert_eq!(digest.message.subject, "Weekly digest");
        assert_eq!(digest.target_folder, "Banking/VIB");
        let cashback = &page.matches[1];
        assert_eq!(cashback.rule_name, "Cashback");
        assert_eq!(cashback.categories, vec!["Promo"]);
    }

    #[tokio::test]
    async fn unmatched_messages_are_counted_but_not_returned() {
        let mailbox = MemoryMailbox::new();
        mailbox.add_inbox_message("Lunch?", "friend@mail.com", at(2025, 5, 5));
        let rules = vec![NewRule::new("OTP", "Security").with_keywords(["OTP"]).into_rule()];
        let page = Scanner::new(&mailbox, 10)
            .scan_page(&token(), &inbox(), None, 2025, &rules)
            .await
            .unwrap();
        assert_eq!(page.scanned, 1);
        assert!(page.matches.is_empty());
    }

    #[tokio::test]
    async fn follows_resume_token() {
        let mailbox = MemoryMailbox::new();
        for day in 1..=3 {
            mailbox.add_inbox_message(&format!("m{day}"), "a@b.c", at(2025, 2, day));
        }
        let rules = vec![NewRule::new("All", "Archive").into_rule()];
        let scanner = Scanner::new(&mailbox, 2);

        let first = scanner
            .scan_page(&token(), &inbox(), None, 0, &rules)
            .await
            .unwrap();
        assert!(first.has_more());
        assert_eq!(first.matches.len(), 2);

        let second = scanner
            .scan_page(&token(), &inbox(), first.resume.as_ref(), 0, &rules)
            .await
            .unwrap();
        assert!(!second.has_more());
        assert_eq!(second.matches[0].message.subject, "m1");
    }

    #[tokio::test]
    async fn listing_failure_propagates() {
        let mailbox = MemoryMailbox::new();
        mailbox.fail_listing();
        let result = Scanner::new(&mailbox, 10)
            .scan_page(&token(), &FolderScope::AllMessages, None, 0, &[])
            .await;
        assert!(result.is_err());
    }
}
