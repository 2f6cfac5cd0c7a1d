//! Ingest a tar stream as a snapshot.
//!
//! Dirmeta and file objects are synthesized from tar entry headers rather
//! than `lstat`; because tar archives carry entries in arbitrary order, a
//! path map accumulates each directory's children and the dirtrees are
//! emitted bottom-up after the stream is exhausted.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::checksum::{Checksum, ObjectType};
use crate::ingest::{CommitOptions, seal_commit};
use crate::objects::{DirMeta, DirTree, FileHeader, validate_name};
use crate::repo::Repo;
use crate::serialize::{Xattrs, canonicalize_xattrs};
use crate::{Error, check_cancelled};

#[derive(Debug, Default)]
struct DirAccum {
    meta: Option<Checksum>,
    files: BTreeMap<String, Checksum>,
    subdirs: BTreeSet<String>,
}

type DirMap = BTreeMap<Utf8PathBuf, DirAccum>;

/// Normalize a tar entry path: strip `./`, reject absolute paths and any
/// `..` component before a single object is written.
fn normalize_entry_path(path: &std::path::Path) -> Result<Utf8PathBuf> {
    let path = Utf8Path::from_path(path)
        .ok_or_else(|| anyhow!("Invalid non-utf8 path {path:?}"))?;
    if path.is_absolute() {
        return Err(Error::InvalidInput(format!("absolute path '{path}' in archive")).into());
    }
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        use camino::Utf8Component::*;
        match component {
            CurDir => (),
            Normal(c) => out.push(c),
            _ => {
                return Err(
                    Error::InvalidInput(format!("invalid path '{path}' in archive")).into()
                );
            }
        }
    }
    Ok(out)
}

fn ensure_dir<'a>(dirs: &'a mut DirMap, path: &Utf8Path) -> &'a mut DirAccum {
    if !dirs.contains_key(path) {
        if let Some(parent) = path.parent() {
            let name = path.file_name().expect("non-root path").to_string();
            ensure_dir(dirs, &parent.to_owned()).subdirs.insert(name);
        }
        dirs.insert(path.to_owned(), DirAccum::default());
    }
    dirs.get_mut(path).expect("just inserted")
}

fn entry_xattrs<R: Read>(entry: &mut tar::Entry<R>) -> Result<Xattrs> {
    let mut ret = Xattrs::new();
    if let Some(extensions) = entry.pax_extensions()? {
        for ext in extensions {
            let ext = ext?;
            let Ok(key) = ext.key() else { continue };
            if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
                ret.push((name.as_bytes().to_vec(), ext.value_bytes().to_vec()));
            }
        }
    }
    Ok(canonicalize_xattrs(ret))
}

fn header_ids(header: &tar::Header) -> Result<(u32, u32)> {
    let uid: u32 = header.uid()?.try_into().context("uid")?;
    let gid: u32 = header.gid()?.try_into().context("gid")?;
    Ok((uid, gid))
}

fn entry_rdev(header: &tar::Header) -> Result<u32> {
    let major = header.device_major()?.unwrap_or(0);
    let minor = header.device_minor()?.unwrap_or(0);
    Ok(rustix::fs::makedev(major, minor) as u32)
}

fn default_dirmeta(repo: &Repo) -> Result<Checksum> {
    let meta = DirMeta {
        uid: 0,
        gid: 0,
        mode: libc::S_IFDIR | 0o755,
        xattrs: Xattrs::new(),
    };
    repo.write_metadata(ObjectType::DirMeta, &meta.to_object_bytes())
}

fn emit_dirtrees(
    repo: &Repo,
    dirs: &DirMap,
    path: &Utf8Path,
    cancellable: Option<&CancellationToken>,
) -> Result<(Checksum, Checksum)> {
    check_cancelled(cancellable)?;
    let accum = dirs.get(path).expect("registered directory");
    let mut tree = DirTree::default();
    for name in &accum.subdirs {
        let (child_tree, child_meta) = emit_dirtrees(repo, dirs, &path.join(name), cancellable)?;
        tree.subdirs.push((name.clone(), child_tree, child_meta));
    }
    for (name, checksum) in &accum.files {
        tree.files.push((name.clone(), *checksum));
    }
    let meta = match accum.meta {
        Some(m) => m,
        // Directories the archive never mentioned get a neutral dirmeta
        None => default_dirmeta(repo)?,
    };
    let tree = repo.write_metadata(ObjectType::DirTree, &tree.to_object_bytes()?)?;
    Ok((tree, meta))
}

/// Ingest a tar stream and commit the resulting tree.
#[context("Committing tar stream")]
pub fn commit_tar<R: Read>(
    repo: &Repo,
    src: R,
    opts: &CommitOptions,
    cancellable: Option<&CancellationToken>,
) -> Result<Checksum> {
    let mut archive = tar::Archive::new(src);
    let mut dirs = DirMap::new();
    dirs.insert(Utf8PathBuf::new(), DirAccum::default());

    for entry in archive.entries()? {
        check_cancelled(cancellable)?;
        let mut entry = entry?;
        let path = normalize_entry_path(&entry.path()?)?;
        let xattrs = entry_xattrs(&mut entry)?;
        let header = entry.header();
        let (uid, gid) = header_ids(header)?;
        let perms = header.mode()? & 0o7777;
        let entry_type = header.entry_type();

        if path.as_str().is_empty() {
            // The archive's own entry for the tree root carries its dirmeta.
            if entry_type == tar::EntryType::Directory {
                let meta = DirMeta {
                    uid,
                    gid,
                    mode: libc::S_IFDIR | perms,
                    xattrs,
                };
                let checksum = repo.write_metadata(ObjectType::DirMeta, &meta.to_object_bytes())?;
                ensure_dir(&mut dirs, Utf8Path::new("")).meta = Some(checksum);
            }
            continue;
        }
        let name = path.file_name().expect("non-root path").to_string();
        validate_name(&name)?;
        let parent = path.parent().unwrap_or(Utf8Path::new("")).to_owned();

        match entry_type {
            tar::EntryType::Directory => {
                let meta = DirMeta {
                    uid,
                    gid,
                    mode: libc::S_IFDIR | perms,
                    xattrs,
                };
                let checksum = repo.write_metadata(ObjectType::DirMeta, &meta.to_object_bytes())?;
                ensure_dir(&mut dirs, &path).meta = Some(checksum);
            }
            tar::EntryType::Regular => {
                let file_header = FileHeader {
                    uid,
                    gid,
                    mode: libc::S_IFREG | perms,
                    rdev: 0,
                    symlink_target: String::new(),
                    xattrs,
                };
                let checksum = repo
                    .stage_file(&file_header, Some(&mut entry), cancellable)
                    .with_context(|| format!("Storing '{path}'"))?;
                ensure_dir(&mut dirs, &parent).files.insert(name, checksum);
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("Symlink '{path}' has no target"))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| anyhow!("Non-utf8 symlink target"))?
                    .to_string();
                let file_header = FileHeader {
                    uid,
                    gid,
                    mode: libc::S_IFLNK | perms,
                    rdev: 0,
                    symlink_target: target,
                    xattrs,
                };
                let checksum = repo.stage_file(&file_header, None, cancellable)?;
                ensure_dir(&mut dirs, &parent).files.insert(name, checksum);
            }
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                let fmt = match entry_type {
                    tar::EntryType::Char => libc::S_IFCHR,
                    tar::EntryType::Block => libc::S_IFBLK,
                    _ => libc::S_IFIFO,
                };
                let rdev = if entry_type == tar::EntryType::Fifo {
                    0
                } else {
                    entry_rdev(header)?
                };
                let file_header = FileHeader {
                    uid,
                    gid,
                    mode: fmt | perms,
                    rdev,
                    symlink_target: String::new(),
                    xattrs,
                };
                let checksum = repo.stage_file(&file_header, None, cancellable)?;
                ensure_dir(&mut dirs, &parent).files.insert(name, checksum);
            }
            o => {
                return Err(Error::InvalidInput(format!(
                    "unsupported tar entry '{path}' of type {o:?}"
                ))
                .into());
            }
        }
    }

    let (root_tree, root_meta) = emit_dirtrees(repo, &dirs, Utf8Path::new(""), cancellable)?;
    seal_commit(repo, opts, root_tree, root_meta)
}
