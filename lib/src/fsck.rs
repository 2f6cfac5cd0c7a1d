//! Consistency checking: recompute every object's checksum and verify it
//! against its storage key; validate pack structure.

use anyhow::Result;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::check_cancelled;
use crate::checksum::{self, Checksum, ObjectType};
use crate::pack;
use crate::repo::Repo;

/// Options for [`fsck`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FsckOptions {
    /// Unlink loose objects that fail verification.
    pub delete: bool,
}

/// The outcome of a consistency check.
#[derive(Debug, Default)]
pub struct FsckResult {
    /// Loose objects examined.
    pub n_objects: u64,
    /// Packs examined.
    pub n_packs: u32,
    /// Human-readable descriptions of everything found wrong.
    pub errors: Vec<String>,
}

impl FsckResult {
    /// Whether the repository verified clean.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn verify_loose(repo: &Repo, checksum: &Checksum, objtype: ObjectType) -> Result<()> {
    match objtype {
        ObjectType::DirTree | ObjectType::DirMeta | ObjectType::Commit => {
            let data = repo.load_metadata_bytes(objtype, checksum)?;
            // Shape first, then identity.
            crate::objects::decode_metadata(&data, objtype)?;
            let actual = checksum::sha256_of(&data)?;
            if actual != *checksum {
                anyhow::bail!("actual checksum is {actual}");
            }
        }
        ObjectType::File => {
            let mut obj = repo.open_file_object(checksum)?;
            let actual = checksum::checksum_file_object(
                &obj.header,
                obj.content.as_mut().map(|c| c as &mut dyn std::io::Read),
            )?;
            if actual != *checksum {
                verify_file_mismatch(repo, checksum, &actual)?;
            }
        }
    }
    Ok(())
}

/// A file object whose recomputed checksum disagrees with its key.  Two
/// legacy keyings are recognized and reported as such so an operator can
/// tell them apart from bit rot: the raw `sha256("")` digest standing in
/// for "no xattrs", and the meta-less archived-content checksum.
fn verify_file_mismatch(repo: &Repo, checksum: &Checksum, actual: &Checksum) -> Result<()> {
    let mut obj = repo.open_file_object(checksum)?;
    if obj.header.xattrs.is_empty() {
        let legacy = checksum::checksum_file_object_legacy_xattrs(
            &obj.header,
            obj.content.as_mut().map(|c| c as &mut dyn std::io::Read),
        )?;
        if legacy == *checksum {
            anyhow::bail!("keyed with the legacy empty-xattrs placeholder");
        }
    }
    let mut obj = repo.open_file_object(checksum)?;
    let content_only = checksum::checksum_file_content_only(
        &obj.header,
        obj.content.as_mut().map(|c| c as &mut dyn std::io::Read),
    )?;
    if content_only == *checksum {
        anyhow::bail!("keyed by its archived-content checksum");
    }
    anyhow::bail!("actual checksum is {actual}")
}

/// Verify every loose object and every pack.  Corruption is collected into
/// the result rather than aborting the scan; only host-level failures
/// (e.g. an unreadable objects directory) error out.
#[context("Checking repository consistency")]
pub fn fsck(
    repo: &Repo,
    opts: &FsckOptions,
    cancellable: Option<&CancellationToken>,
) -> Result<FsckResult> {
    let mut result = FsckResult::default();
    for (checksum, objtype) in repo.iter_loose_objects()? {
        check_cancelled(cancellable)?;
        result.n_objects += 1;
        if let Err(e) = verify_loose(repo, &checksum, objtype) {
            result
                .errors
                .push(format!("corrupted object '{checksum}.{objtype}': {e:#}"));
            if opts.delete {
                repo.delete_loose_object(objtype, &checksum)?;
            }
        }
    }
    for stem in pack::list_pack_indexes(repo)? {
        check_cancelled(cancellable)?;
        result.n_packs += 1;
        result.errors.extend(pack::fsck_pack(repo, &stem)?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{CommitOptions, commit_directory};
    use crate::objects::FileHeader;
    use crate::repo::RepoMode;
    use camino::Utf8Path;

    fn committed_repo(mode: RepoMode) -> (tempfile::TempDir, Repo) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let src = base.join("src");
        std::fs::create_dir_all(src.as_std_path()).unwrap();
        std::fs::write(src.join("hello").as_std_path(), b"hello world").unwrap();
        let repo = Repo::create(&base.join("repo"), mode).unwrap();
        let opts = CommitOptions {
            branch: "main".into(),
            subject: "Test".into(),
            ..Default::default()
        };
        commit_directory(&repo, &src, &opts, None).unwrap();
        (td, repo)
    }

    #[test]
    fn test_clean_repo_passes() {
        for mode in [RepoMode::Archive, RepoMode::Bare] {
            let (_td, repo) = committed_repo(mode);
            let r = fsck(&repo, &FsckOptions::default(), None).unwrap();
            assert!(r.is_ok(), "{:?}", r.errors);
            assert!(r.n_objects >= 4);
        }
    }

    #[test]
    fn test_detects_and_deletes_corruption() {
        let (_td, repo) = committed_repo(RepoMode::Archive);
        // Flip content bytes underneath one file object
        let (victim, _) = repo
            .iter_loose_objects()
            .unwrap()
            .into_iter()
            .find(|(_, t)| *t == ObjectType::File)
            .unwrap();
        let path = checksum::loose_object_path(&victim, ObjectType::File);
        let mut data = repo.dir().read(path.as_std_path()).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        repo.dir().write(path.as_std_path(), &data).unwrap();

        let r = fsck(&repo, &FsckOptions::default(), None).unwrap();
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].contains(&victim.to_hex()));

        let r = fsck(&repo, &FsckOptions { delete: true }, None).unwrap();
        assert!(!r.is_ok());
        assert!(!repo.has_loose_object(ObjectType::File, &victim).unwrap());
        // After deletion the store is consistent again
        let r = fsck(&repo, &FsckOptions::default(), None).unwrap();
        assert!(r.is_ok());
    }

    #[test]
    fn test_recognizes_legacy_empty_xattrs_keying() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let repo = Repo::create(&base.join("repo"), RepoMode::Archive).unwrap();
        // Plant an archive file object under the key a legacy writer would
        // have produced: the sha256("") placeholder in the xattrs position.
        let header = FileHeader {
            mode: libc::S_IFREG | 0o644,
            ..Default::default()
        };
        let mut content: &[u8] = b"legacy payload";
        let legacy_key =
            checksum::checksum_file_object_legacy_xattrs(&header, Some(&mut content)).unwrap();
        let mut artifact = header.to_bytes();
        artifact.extend_from_slice(b"legacy payload");
        let path = checksum::loose_object_path(&legacy_key, ObjectType::File);
        repo.dir()
            .create_dir_all(path.parent().unwrap().as_std_path())
            .unwrap();
        repo.dir().write(path.as_std_path(), &artifact).unwrap();

        let r = fsck(&repo, &FsckOptions::default(), None).unwrap();
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].contains("legacy empty-xattrs placeholder"), "{:?}", r.errors);
    }
}
