//! Replicate the objects reachable from a remote ref into this repository.
//!
//! Replication is a pure consumer of the object-store write API: the
//! source is simply another repository opened read-only (remotes are
//! configured with filesystem-path urls; network transports live outside
//! the core).

use std::collections::HashSet;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::checksum::{Checksum, ObjectType};
use crate::repo::Repo;
use crate::{Error, check_cancelled};

fn copy_file_object(src: &Repo, dst: &Repo, checksum: &Checksum) -> Result<()> {
    let mut obj = src.open_file_object(checksum)?;
    let actual = dst.stage_file(
        &obj.header,
        obj.content.as_mut().map(|c| c as &mut dyn std::io::Read),
        None,
    )?;
    if actual != *checksum {
        return Err(Error::Corrupted(format!(
            "Corrupted object {checksum} (actual checksum is {actual})"
        ))
        .into());
    }
    Ok(())
}

fn pull_tree(
    src: &Repo,
    dst: &Repo,
    tree_checksum: &Checksum,
    meta_checksum: &Checksum,
    seen: &mut HashSet<Checksum>,
    cancellable: Option<&CancellationToken>,
) -> Result<()> {
    check_cancelled(cancellable)?;
    if !dst.has_object(ObjectType::DirMeta, meta_checksum)? {
        let data = src.load_metadata_bytes(ObjectType::DirMeta, meta_checksum)?;
        dst.write_metadata_trusted(ObjectType::DirMeta, meta_checksum, &data)?;
    }
    if dst.has_object(ObjectType::DirTree, tree_checksum)? || !seen.insert(*tree_checksum) {
        return Ok(());
    }
    let tree = src.load_dirtree(tree_checksum)?;
    for (name, checksum) in &tree.files {
        check_cancelled(cancellable)?;
        if !dst.has_object(ObjectType::File, checksum)? {
            copy_file_object(src, dst, checksum)
                .with_context(|| format!("Fetching '{name}'"))?;
        }
    }
    for (name, child_tree, child_meta) in &tree.subdirs {
        pull_tree(src, dst, child_tree, child_meta, seen, cancellable)
            .with_context(|| format!("Fetching '{name}/'"))?;
    }
    // The dirtree lands after everything it references.
    let data = src.load_metadata_bytes(ObjectType::DirTree, tree_checksum)?;
    dst.write_metadata_trusted(ObjectType::DirTree, tree_checksum, &data)?;
    Ok(())
}

/// Fetch the objects reachable from `branch` in the configured remote and
/// update the remote-tracking ref.  Returns the pulled commit.
#[context("Pulling {branch} from {remote}")]
pub fn pull(
    repo: &Repo,
    remote: &str,
    branch: &str,
    cancellable: Option<&CancellationToken>,
) -> Result<Checksum> {
    let url = repo
        .remote_url(remote)
        .ok_or_else(|| Error::NotFound(format!("No remote '{remote}' configured")))?;
    if url.contains("://") {
        return Err(Error::Unsupported(format!(
            "only filesystem remotes are supported, not '{url}'"
        ))
        .into());
    }
    let src = Repo::open(Utf8Path::new(&url)).context("Opening remote repository")?;
    let commit_checksum = src
        .resolve_rev(branch, false)?
        .expect("resolve without allow_noent");

    // Walk a commit chain until we hit one we already have.
    let mut wanted = vec![commit_checksum];
    let mut cursor = commit_checksum;
    while !repo.has_object(ObjectType::Commit, &cursor)? {
        let commit = src.load_commit(&cursor)?;
        match commit.parent {
            Some(parent) if !repo.has_object(ObjectType::Commit, &parent)? => {
                wanted.push(parent);
                cursor = parent;
            }
            _ => break,
        }
    }

    let mut seen = HashSet::new();
    for checksum in wanted.iter().rev() {
        check_cancelled(cancellable)?;
        if repo.has_object(ObjectType::Commit, checksum)? {
            continue;
        }
        let commit = src.load_commit(checksum)?;
        pull_tree(
            &src,
            repo,
            &commit.root_tree,
            &commit.root_meta,
            &mut seen,
            cancellable,
        )?;
        let data = src.load_metadata_bytes(ObjectType::Commit, checksum)?;
        repo.write_metadata_trusted(ObjectType::Commit, checksum, &data)?;
    }

    repo.write_ref(Some(remote), branch, &commit_checksum)?;
    Ok(commit_checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{CommitOptions, commit_directory};
    use crate::repo::RepoMode;
    use crate::vfs::read_commit;
    use std::io::Read as _;
    use std::sync::Arc;

    #[test]
    fn test_pull_local_remote() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let src_path = base.join("origin");
        let origin = Repo::create(&src_path, RepoMode::Archive).unwrap();
        let tree = base.join("tree");
        std::fs::create_dir_all(tree.join("dir").as_std_path()).unwrap();
        std::fs::write(tree.join("a").as_std_path(), b"contents a").unwrap();
        std::fs::write(tree.join("dir/b").as_std_path(), b"contents b").unwrap();
        let opts = CommitOptions {
            branch: "main".into(),
            subject: "Publish".into(),
            ..Default::default()
        };
        let c1 = commit_directory(&origin, &tree, &opts, None).unwrap();

        let mut local = Repo::create(&base.join("local"), RepoMode::Archive).unwrap();
        local.set_remote("origin", src_path.as_str()).unwrap();
        let pulled = pull(&local, "origin", "main", None).unwrap();
        assert_eq!(pulled, c1);
        assert_eq!(local.resolve_rev("origin/main", false).unwrap(), Some(c1));

        // The pulled snapshot is fully readable
        let local = Arc::new(local);
        let root = read_commit(&local, "origin/main").unwrap();
        let mut buf = Vec::new();
        root.resolve_relative_path("dir/b")
            .read()
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, b"contents b");

        // A second pull is a no-op that still succeeds
        let pulled = pull(&local, "origin", "main", None).unwrap();
        assert_eq!(pulled, c1);
    }

    #[test]
    fn test_pull_requires_local_remote() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let mut local = Repo::create(&base.join("local"), RepoMode::Archive).unwrap();
        assert!(pull(&local, "nosuch", "main", None).is_err());
        local
            .set_remote("web", "https://example.com/repo")
            .unwrap();
        let err = pull(&local, "web", "main", None).unwrap_err();
        assert!(
            err.chain()
                .any(|e| matches!(e.downcast_ref(), Some(Error::Unsupported(_))))
        );
    }
}
