//! Compute the structural difference between two trees.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result};
use fn_error_context::context;

use crate::checksum::Checksum;
use crate::vfs::{FileInfo, TreeNode};

/// A set of slash-prefixed file paths.
pub type FileSet = BTreeSet<String>;

/// One modified entry, with whatever both sides could tell us about it.
/// Checksums are absent when the entry changed type.
#[derive(Debug, Clone)]
pub struct DiffItem {
    /// Slash-prefixed path of the entry.
    pub path: String,
    /// Metadata on the left side.
    pub a_info: Option<FileInfo>,
    /// Metadata on the right side.
    pub b_info: Option<FileInfo>,
    /// Content identity on the left side.
    pub a_checksum: Option<Checksum>,
    /// Content identity on the right side.
    pub b_checksum: Option<Checksum>,
}

/// Difference between two trees.
#[derive(Debug, Default)]
pub struct TreeDiff {
    /// Entries present on both sides with differing content or type.
    pub modified: Vec<DiffItem>,
    /// Entries present only on the left side (with descendants).
    pub removed: FileSet,
    /// Entries present only on the right side (with descendants).
    pub added: FileSet,
}

impl fmt::Display for TreeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "modified:{} removed:{} added:{}",
            self.modified.len(),
            self.removed.len(),
            self.added.len()
        )
    }
}

fn add_all_recurse(node: &dyn TreeNode, prefix: &str, out: &mut FileSet) -> Result<()> {
    for child in node.children()? {
        let path = format!("{prefix}{}", child.basename());
        let is_dir = child.query_info()?.file_type.is_dir();
        out.insert(path.clone());
        if is_dir {
            add_all_recurse(child.as_ref(), &format!("{path}/"), out)?;
        }
    }
    Ok(())
}

fn diff_recurse(
    prefix: &str,
    diff: &mut TreeDiff,
    a: &dyn TreeNode,
    b: &dyn TreeNode,
) -> Result<()> {
    // Walk the left side first, generating removals and modifications.
    for a_child in a.children()? {
        let name = a_child.basename();
        let path = format!("{prefix}{name}");
        let a_info = a_child.query_info()?;
        let a_is_dir = a_info.file_type.is_dir();
        let Some(b_child) = b.lookup(&name)? else {
            diff.removed.insert(path.clone());
            if a_is_dir {
                add_all_recurse(a_child.as_ref(), &format!("{path}/"), &mut diff.removed)?;
            }
            continue;
        };
        let b_info = b_child.query_info()?;
        if a_info.file_type != b_info.file_type {
            diff.modified.push(DiffItem {
                path,
                a_info: Some(a_info),
                b_info: Some(b_info),
                a_checksum: None,
                b_checksum: None,
            });
        } else if a_is_dir {
            // Identical subtree checksums prove identical subtrees.
            let pruned = match (a_child.tree_checksums()?, b_child.tree_checksums()?) {
                (Some((atree, _)), Some((btree, _))) => atree == btree,
                _ => false,
            };
            if !pruned {
                diff_recurse(&format!("{path}/"), diff, a_child.as_ref(), b_child.as_ref())?;
            }
        } else {
            let a_checksum = a_child
                .file_checksum()
                .with_context(|| format!("Checksumming {path}"))?;
            let b_checksum = b_child
                .file_checksum()
                .with_context(|| format!("Checksumming {path}"))?;
            if a_checksum != b_checksum {
                diff.modified.push(DiffItem {
                    path,
                    a_info: Some(a_info),
                    b_info: Some(b_info),
                    a_checksum,
                    b_checksum,
                });
            }
        }
    }
    // Then sweep the right side for additions.
    for b_child in b.children()? {
        let name = b_child.basename();
        if a.lookup(&name)?.is_some() {
            continue;
        }
        let path = format!("{prefix}{name}");
        diff.added.insert(path.clone());
        if b_child.query_info()?.file_type.is_dir() {
            add_all_recurse(b_child.as_ref(), &format!("{path}/"), &mut diff.added)?;
        }
    }
    Ok(())
}

/// Compare two trees, producing the modified/removed/added sets.  Both
/// sides may be committed snapshots or live directories.
#[context("Diffing trees")]
pub fn diff_trees(a: &dyn TreeNode, b: &dyn TreeNode) -> Result<TreeDiff> {
    let mut diff = TreeDiff::default();
    diff_recurse("/", &mut diff, a, b)?;
    Ok(diff)
}
