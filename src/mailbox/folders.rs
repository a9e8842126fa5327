//! Folder path resolution and folder-tree listing.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::MailboxError;
use crate::mailbox::{AccessToken, FolderId, MailboxService};

/// Depth cap for [`list_folder_tree`]: children of the root are depth 0.
pub const FOLDER_TREE_MAX_DEPTH: usize = 5;

/// Maps `/`-delimited folder paths to folder ids, creating missing segments.
///
/// One resolver belongs to one run. Every resolved prefix is cached, so
/// `Banking/VCB` followed by `Banking/VIB` looks up `Banking` once. Lookup
/// always precedes creation, which makes repeated resolution of the same
/// path idempotent. Two resolvers racing on the same mailbox can still both
/// create a segment; callers serialise whole runs to avoid that.
#[derive(Debug, Default)]
pub struct FolderResolver {
    cache: HashMap<String, FolderId>,
    created: Vec<String>,
}

impl FolderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `path` to the id of its last segment.
    ///
    /// Remote failures propagate unchanged; nothing is retried here.
    pub async fn ensure_folder(
        &mut self,
        mailbox: &dyn MailboxService,
        token: &AccessToken,
        path: &str,
    ) -> Result<FolderId, MailboxError> {
        let segments = split_path(path);
        if segments.is_empty() {
            return Err(MailboxError::InvalidPath(path.to_string()));
        }

        let mut parent = FolderId::root();
        for depth in 0..segments.len() {
            let prefix = segments[..=depth].join("/");
            if let Some(id) = self.cache.get(&prefix) {
                parent = id.clone();
                continue;
            }

            let name = segments[depth];
            let existing = mailbox
                .list_child_folders(token, &parent, Some(name))
                .await?
                .into_iter()
                .find(|f| f.display_name == name);

            let id = match existing {
                Some(folder) => {
                    debug!(path = %prefix, id = %folder.id, "Folder exists");
                    folder.id
                }
                None => {
                    let folder = mailbox.create_child_folder(token, &parent, name).await?;
                    info!(path = %prefix, id = %folder.id, "Created folder");
                    self.created.push(prefix.clone());
                    folder.id
                }
            };

            self.cache.insert(prefix, id.clone());
            parent = id;
        }

        Ok(parent)
    }

    /// Cached id for an already-resolved path.
    pub fn cached(&self, path: &str) -> Option<&FolderId> {
        self.cache.get(&split_path(path).join("/"))
    }

    /// Path prefixes this resolver created, in creation order.
    pub fn created_paths(&self) -> &[String] {
        &self.created
    }
}

/// Split on `/`, trim segments and drop empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// One folder in a listed tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderNode {
    pub id: FolderId,
    pub display_name: String,
    /// Full `/`-delimited path from the root.
    pub path: String,
    pub depth: usize,
    pub unread_count: u32,
}

/// Breadth-first listing of the folder tree below the root.
///
/// Uses an explicit worklist instead of recursion; folders deeper than
/// `max_depth` levels are not visited.
pub async fn list_folder_tree(
    mailbox: &dyn MailboxService,
    token: &AccessToken,
    max_depth: usize,
) -> Result<Vec<FolderNode>, MailboxError> {
    let mut nodes = Vec::new();
    let mut pending: VecDeque<(FolderId, String, usize)> = VecDeque::new();
    pending.push_back((FolderId::root(), String::new(), 0));

    while let Some((parent, parent_path, depth)) = pending.pop_front() {
        if depth >= max_depth {
            continue;
        }
        for child in mailbox.list_child_folders(token, &parent, None).await? {
            let path = if parent_path.is_empty() {
                child.display_name.clone()
            } else {
                format!("{parent_path}/{}", child.display_name)
            };

            if child.child_folder_count > 0 {
                pending.push_back((child.id.clone(), path.clone(), depth + 1));
            }

            nodes.push(FolderNode {
                id: child.id,
                display_name: child.display_name,
                path,
                depth,
                unread_count: child.unread_item_count,
            });
        }
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::memory::MemoryMailbox;

    fn token() -> AccessToken {
        AccessToken::new("test-token")
    }

    #[test]
    fn split_path_trims_and_drops_empty_segments() {
        assert_eq!(split_path("Banking/VCB"), vec!["Banking", "VCB"]);
        assert_eq!(split_path(" /Banking// VCB /"), vec!["Banking", "VCB"]);
        assert!(split_path(" / / ").is_empty());
    }

    #[tokio::test]
    async fn creates_missing_segments() {
        let mailbox = MemoryMailbox::new();
        let mut resolver = FolderResolver::new();

        let leaf = resolver
            .ensure_folder(&mailbox, &token(), "Banking/VCB")
            .await
            .unwrap();

        assert_eq!(mailbox.folder_by_path("Banking/VCB"), Some(leaf));
        assert_eq!(resolver.created_paths(), ["Banking", "Banking/VCB"]);
    }

    #[tokio::test]
    async fn ensure_folder_is_idempotent_across_resolvers() {
        let mailbox = MemoryMailbox::new();

        let first = FolderResolver::new()
            .ensure_folder(&mailbox, &token(), "A/B")
            .await
            .unwrap();
        let creates_after_first = mailbox.op_count("create_child_folder");

        let mut second_resolver = FolderResolver::new();
        let second = second_resolver
            .ensure_folder(&mailbox, &token(), "A/B")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(creates_after_first, 2);
        assert_eq!(mailbox.op_count("create_child_folder"), 2);
        assert!(second_resolver.created_paths().is_empty());
        assert_eq!(mailbox.children_named(&FolderId::root(), "A"), 1);
    }

    #[tokio::test]
    async fn shared_prefix_is_looked_up_once() {
        let mailbox = MemoryMailbox::new();
        let mut resolver = FolderResolver::new();

        resolver
            .ensure_folder(&mailbox, &token(), "Banking/VCB")
            .await
            .unwrap();
        let lookups = mailbox.op_count("list_child_folders");
        resolver
            .ensure_folder(&mailbox, &token(), "Banking/VIB")
            .await
            .unwrap();

        // Only the new leaf needs a lookup.
        assert_eq!(mailbox.op_count("list_child_folders"), lookups + 1);
        assert!(resolver.cached("Banking").is_some());
        assert!(resolver.cached(" Banking / VIB ").is_some());
    }

    #[tokio::test]
    async fn display_name_match_is_case_sensitive() {
        let mailbox = MemoryMailbox::new();
        let mut resolver = FolderResolver::new();
        let upper = resolver
            .ensure_folder(&mailbox, &token(), "Promo")
            .await
            .unwrap();
        let lower = FolderResolver::new()
            .ensure_folder(&mailbox, &token(), "promo")
            .await
            .unwrap();
        assert_ne!(upper, lower);
    }

    #[tokio::test]
    async fn empty_path_is_rejected() {
        let mailbox = MemoryMailbox::new();
        let err = FolderResolver::new()
            .ensure_folder(&mailbox, &token(), " // ")
            .await
            .unwrap_err();
        assert!(matches!(err, MailboxError::InvalidPath(_)));
        assert_eq!(mailbox.op_count("list_child_folders"), 0);
    }

    #[tokio::test]
    async fn remote_failure_propagates() {
        let mailbox = MemoryMailbox::new();
        mailbox.fail_folder_creation();
        let err = FolderResolver::new()
            .ensure_folder(&mailbox, &token(), "New/Folder")
            .await
            .unwrap_err();
        assert!(matches!(err, MailboxError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn folder_tree_respects_depth_cap() {
        let mailbox = MemoryMailbox::new();
        let mut resolver = FolderResolver::new();
        resolver
            .ensure_folder(&mailbox, &token(), "L0/L1/L2/L3")
            .await
            .unwrap();

        let full = list_folder_tree(&mailbox, &token(), FOLDER_TREE_MAX_DEPTH)
            .await
            .unwrap();
        let paths: Vec<&str> = full.iter().map(|n| n.path.as_str()).collect();
        assert!(paths.contains(&"Inbox"));
        assert!(paths.contains(&"L0/L1/L2/L3"));

        let shallow = list_folder_tree(&mailbox, &token(), 2).await.unwrap();
        let max_depth = shallow.iter().map(|n| n.depth).max().unwrap();
        assert_eq!(max_depth, 1);
        assert!(shallow.iter().any(|n| n.path == "L0/L1"));
        assert!(!shallow.iter().any(|n| n.path == "L0/L1/L2"));
    }
}
