//! Tree ingestion: convert a source tree into a deduplicated object graph
//! bottom-up, then seal it with a commit and update the branch.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::checksum::{Checksum, ObjectType};
use crate::objects::{Commit, DirMeta, DirTree, MetaDict, validate_name};
use crate::repo::Repo;
use crate::vfs::{FileType, LocalFile, TreeNode};
use crate::{Error, check_cancelled};

/// Options for creating a commit.
#[derive(Debug, Default, Clone)]
pub struct CommitOptions {
    /// Branch to update; its current head (if any) becomes the parent.
    pub branch: String,
    /// One-line summary.
    pub subject: String,
    /// Free-form description.
    pub body: String,
    /// Open metadata dictionary stored in the commit.
    pub metadata: MetaDict,
    /// Commit timestamp; defaults to the current time.
    pub timestamp: Option<u64>,
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Recursively import one directory, returning its
/// `(dirtree, dirmeta)` checksum pair.
fn import_node(
    repo: &Repo,
    node: &dyn TreeNode,
    cancellable: Option<&CancellationToken>,
) -> Result<(Checksum, Checksum)> {
    let info = node.query_info()?;
    if !info.file_type.is_dir() {
        return Err(Error::NotDirectory(info.name).into());
    }
    let dirmeta = DirMeta {
        uid: info.uid,
        gid: info.gid,
        mode: info.mode,
        xattrs: info.xattrs,
    };
    let meta_checksum = repo.write_metadata(ObjectType::DirMeta, &dirmeta.to_object_bytes())?;

    let mut tree = DirTree::default();
    for child in node.children()? {
        check_cancelled(cancellable)?;
        let name = child.basename();
        validate_name(&name)?;
        let child_info = child
            .query_info()
            .with_context(|| format!("Examining {name}"))?;
        if child_info.file_type.is_dir() {
            let (child_tree, child_meta) = import_node(repo, child.as_ref(), cancellable)?;
            tree.subdirs.push((name, child_tree, child_meta));
        } else {
            let header = child_info.to_file_header();
            let checksum = if child_info.file_type == FileType::Regular {
                let mut content = child.read().with_context(|| format!("Reading {name}"))?;
                repo.stage_file(&header, Some(&mut content), cancellable)
            } else {
                repo.stage_file(&header, None, cancellable)
            }
            .with_context(|| format!("Storing {name}"))?;
            tree.files.push((name, checksum));
        }
    }
    let tree_checksum = repo.write_metadata(ObjectType::DirTree, &tree.to_object_bytes()?)?;
    Ok((tree_checksum, meta_checksum))
}

/// Build a commit from `(root_tree, root_meta)` and move the branch to it.
pub(crate) fn seal_commit(
    repo: &Repo,
    opts: &CommitOptions,
    root_tree: Checksum,
    root_meta: Checksum,
) -> Result<Checksum> {
    let parent = repo.resolve_rev(&opts.branch, true)?;
    let commit = Commit {
        metadata: opts.metadata.clone(),
        parent,
        related: Vec::new(),
        subject: opts.subject.clone(),
        body: opts.body.clone(),
        timestamp: opts.timestamp.unwrap_or_else(now),
        root_tree,
        root_meta,
    };
    let checksum = repo.write_metadata(ObjectType::Commit, &commit.to_object_bytes())?;
    repo.write_ref(None, &opts.branch, &checksum)?;
    tracing::debug!("committed {checksum} to {}", opts.branch);
    Ok(checksum)
}

/// Ingest any [`TreeNode`] source into the repository and commit it.
#[context("Committing tree")]
pub fn commit_tree(
    repo: &Repo,
    root: &dyn TreeNode,
    opts: &CommitOptions,
    cancellable: Option<&CancellationToken>,
) -> Result<Checksum> {
    let (root_tree, root_meta) = import_node(repo, root, cancellable)?;
    seal_commit(repo, opts, root_tree, root_meta)
}

/// Ingest a live directory.
#[context("Committing directory {path}")]
pub fn commit_directory(
    repo: &Repo,
    path: &Utf8Path,
    opts: &CommitOptions,
    cancellable: Option<&CancellationToken>,
) -> Result<Checksum> {
    let root = LocalFile::new_root(path)?;
    commit_tree(repo, &root, opts, cancellable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::RepoMode;
    use std::io::Write as _;

    fn testrepo() -> (tempfile::TempDir, Repo) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("repo");
        let repo = Repo::create(&path, RepoMode::Archive).unwrap();
        (td, repo)
    }

    fn write_tree(base: &Utf8Path) {
        std::fs::create_dir_all(base.join("sub")).unwrap();
        let mut f = std::fs::File::create(base.join("hello")).unwrap();
        f.write_all(b"hello world").unwrap();
        let mut f = std::fs::File::create(base.join("sub/other")).unwrap();
        f.write_all(b"other").unwrap();
    }

    fn opts(branch: &str) -> CommitOptions {
        CommitOptions {
            branch: branch.into(),
            subject: "Test".into(),
            timestamp: Some(1_700_000_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_commit_and_parentage() {
        let (td, repo) = testrepo();
        let src = Utf8Path::from_path(td.path()).unwrap().join("src");
        write_tree(&src);

        let c1 = commit_directory(&repo, &src, &opts("main"), None).unwrap();
        assert_eq!(repo.resolve_rev("main", false).unwrap(), Some(c1));
        assert_eq!(repo.load_commit(&c1).unwrap().parent, None);

        std::fs::write(src.join("hello").as_std_path(), b"changed").unwrap();
        let c2 = commit_directory(&repo, &src, &opts("main"), None).unwrap();
        assert_eq!(repo.load_commit(&c2).unwrap().parent, Some(c1));
        assert_eq!(repo.resolve_rev("main^", false).unwrap(), Some(c1));
    }

    #[test]
    fn test_deterministic_roots() {
        let (td, repo) = testrepo();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let (src_a, src_b) = (base.join("a"), base.join("b"));
        write_tree(&src_a);
        write_tree(&src_b);

        let c1 = commit_directory(&repo, &src_a, &opts("a"), None).unwrap();
        let c2 = commit_directory(&repo, &src_b, &opts("b"), None).unwrap();
        let (c1, c2) = (repo.load_commit(&c1).unwrap(), repo.load_commit(&c2).unwrap());
        assert_eq!(c1.root_tree, c2.root_tree);
        assert_eq!(c1.root_meta, c2.root_meta);
    }

    #[test]
    fn test_dedup_identical_content() {
        let (td, repo) = testrepo();
        let src = Utf8Path::from_path(td.path()).unwrap().join("src");
        std::fs::create_dir_all(src.as_std_path()).unwrap();
        std::fs::write(src.join("one").as_std_path(), b"same bytes").unwrap();
        std::fs::write(src.join("two").as_std_path(), b"same bytes").unwrap();
        commit_directory(&repo, &src, &opts("main"), None).unwrap();
        let n_files = repo
            .iter_loose_objects()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t == ObjectType::File)
            .count();
        assert_eq!(n_files, 1);
    }
}
