//! Materialize a committed snapshot onto a live filesystem.
//!
//! Bare repositories check out by hardlinking object files into place;
//! archive repositories (and packed objects) materialize each entry from
//! its header and content stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use fn_error_context::context;
use rustix::fs::{AtFlags, Mode};
use tokio_util::sync::CancellationToken;

use crate::checksum::{Checksum, ObjectType, loose_object_path};
use crate::repo::{
    Repo, RepoMode, apply_xattrs_fd, apply_xattrs_path, chown_if_permitted_at,
    chown_if_permitted_fd,
};
use crate::vfs::{CommitFile, read_commit};
use crate::{Error, check_cancelled};

/// Materialize an entry from its file object, creating a filesystem
/// entity of the correct type and applying its recorded metadata.
fn unpack_object(
    repo: &Repo,
    checksum: &Checksum,
    dest: &Dir,
    name: &str,
    dest_abs: &Utf8Path,
) -> Result<()> {
    let mut obj = repo.open_file_object(checksum)?;
    let header = obj.header.clone();
    match header.mode & libc::S_IFMT {
        libc::S_IFREG => {
            let mut f = dest.create(name)?;
            let content = obj.content.as_mut().expect("regular file content");
            std::io::copy(content, &mut f)?;
            rustix::fs::fchmod(&f, Mode::from_raw_mode(header.mode & 0o7777))?;
            apply_xattrs_fd(&f, &header.xattrs)?;
            chown_if_permitted_fd(&f, header.uid, header.gid)?;
        }
        libc::S_IFLNK => {
            dest.symlink(&header.symlink_target, name)?;
            chown_if_permitted_at(dest, Utf8Path::new(name), header.uid, header.gid)?;
            apply_xattrs_path(&dest_abs.join(name), &header.xattrs)?;
        }
        libc::S_IFCHR | libc::S_IFBLK | libc::S_IFIFO => {
            let ftype = match header.mode & libc::S_IFMT {
                libc::S_IFCHR => rustix::fs::FileType::CharacterDevice,
                libc::S_IFBLK => rustix::fs::FileType::BlockDevice,
                _ => rustix::fs::FileType::Fifo,
            };
            rustix::fs::mknodat(
                dest,
                name,
                ftype,
                Mode::from_raw_mode(header.mode & 0o7777),
                header.rdev as u64,
            )
            .context("mknod")?;
            // mknod modes are filtered through the umask
            rustix::fs::chmodat(
                dest,
                name,
                Mode::from_raw_mode(header.mode & 0o7777),
                AtFlags::empty(),
            )?;
            apply_xattrs_path(&dest_abs.join(name), &header.xattrs)?;
            chown_if_permitted_at(dest, Utf8Path::new(name), header.uid, header.gid)?;
        }
        _ => unreachable!("validated file mode"),
    }
    Ok(())
}

fn checkout_tree(
    repo: &Repo,
    node: &CommitFile,
    dest: &Dir,
    dest_abs: &Utf8Path,
    cancellable: Option<&CancellationToken>,
) -> Result<()> {
    for child in node.enumerate_children()? {
        check_cancelled(cancellable)?;
        let name = child.basename().to_string();
        if child.is_dir()? {
            let info = child.query_info()?;
            dest.create_dir(&name)
                .with_context(|| format!("Creating directory '{name}'"))?;
            let subdir = dest.open_dir(&name)?;
            let abs = dest_abs.join(&name);
            checkout_tree(repo, &child, &subdir, &abs, cancellable)?;
            // Mode bits go last so a read-only directory can be populated.
            apply_xattrs_path(&abs, &info.xattrs)?;
            chown_if_permitted_fd(&subdir, info.uid, info.gid)?;
            rustix::fs::fchmod(&subdir, Mode::from_raw_mode(info.mode & 0o7777))?;
        } else {
            let checksum = child.file_checksum()?.expect("non-directory has a checksum");
            match repo.mode() {
                RepoMode::Bare => {
                    let objpath = loose_object_path(&checksum, ObjectType::File);
                    match repo
                        .dir()
                        .hard_link(objpath.as_std_path(), dest, &name)
                    {
                        Ok(()) => (),
                        // The loose copy may have moved into a pack
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            unpack_object(repo, &checksum, dest, &name, dest_abs)?;
                        }
                        Err(e) => {
                            return Err(anyhow::Error::new(e)
                                .context(format!("Linking '{name}' into checkout")));
                        }
                    }
                }
                RepoMode::Archive => unpack_object(repo, &checksum, dest, &name, dest_abs)?,
            }
        }
    }
    Ok(())
}

/// Check out `rev` into `destination`, which must not exist.  A failed
/// checkout leaves whatever it wrote; nothing is rolled back.
#[context("Checking out {rev} to {destination}")]
pub fn checkout(
    repo: &Arc<Repo>,
    rev: &str,
    destination: &Utf8Path,
    cancellable: Option<&CancellationToken>,
) -> Result<()> {
    if std::fs::symlink_metadata(destination.as_std_path()).is_ok() {
        return Err(Error::AlreadyExists(format!(
            "Destination path '{destination}' already exists"
        ))
        .into());
    }
    let root = read_commit(repo, rev)?;
    let root_info = root.query_info()?;
    std::fs::create_dir(destination.as_std_path())?;
    let dest = Dir::open_ambient_dir(destination.as_std_path(), cap_std::ambient_authority())?;
    checkout_tree(repo, &root, &dest, destination, cancellable)?;
    apply_xattrs_path(destination, &root_info.xattrs)?;
    chown_if_permitted_fd(&dest, root_info.uid, root_info.gid)?;
    rustix::fs::fchmod(&dest, Mode::from_raw_mode(root_info.mode & 0o7777))?;
    Ok(())
}
