//! The on-disk repository: loose-object layout, the staging/commit write
//! protocol, and the bare/archive storage modes.

use std::ffi::CString;
use std::fmt;
use std::io::{Read, Seek as _, Write};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::{Dir, MetadataExt as _};
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::{AtFlags, Gid, Mode, Uid, XattrFlags};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checksum::{self, Checksum, ObjectType, Sha256};
use crate::objects::{
    Commit, DirMeta, DirTree, FileHeader, MAX_METADATA_SIZE, ObjectPayload, decode_metadata,
};
use crate::serialize::Xattrs;
use crate::{Error, check_cancelled, pack};

/// How file objects are represented on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoMode {
    /// File objects are real filesystem entries with real uid/gid/mode/xattrs;
    /// checkout uses hardlinks.  Requires a filesystem (and usually a writer)
    /// that allows the recorded uids.
    Bare,
    /// File objects are uniform header-plus-content blobs.  Safe for
    /// unprivileged repositories and for network transport.
    Archive,
}

impl FromStr for RepoMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<RepoMode> {
        match s {
            "bare" => Ok(RepoMode::Bare),
            "archive" => Ok(RepoMode::Archive),
            o => Err(Error::InvalidInput(format!("invalid repository mode '{o}'")).into()),
        }
    }
}

impl fmt::Display for RepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepoMode::Bare => "bare",
            RepoMode::Archive => "archive",
        })
    }
}

/// An open repository.
pub struct Repo {
    path: Utf8PathBuf,
    dir: Dir,
    mode: RepoMode,
    config: tini::Ini,
}

impl fmt::Debug for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// An opened file-object: the parsed header plus, for regular files, a
/// stream over the content bytes.
pub struct FileObject {
    /// The file's recorded metadata.
    pub header: FileHeader,
    /// Content length in bytes; zero for non-regular files.
    pub size: u64,
    /// Content stream, present only for regular files.
    pub content: Option<Box<dyn Read + Send>>,
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("header", &self.header)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn tmp_name(prefix: &str) -> Utf8PathBuf {
    let rand = Uuid::new_v4().simple().to_string();
    format!("tmp/{}-{}", prefix, &rand[0..12]).into()
}

impl Repo {
    /// Lay out a new repository skeleton at `path` (which must exist and be
    /// a directory) and write its config.
    #[context("Initializing repo at {path}")]
    pub fn create(path: &Utf8Path, mode: RepoMode) -> Result<Repo> {
        std::fs::create_dir_all(path.as_std_path())?;
        let dir = Dir::open_ambient_dir(path.as_std_path(), cap_std::ambient_authority())?;
        for d in ["objects", "tmp", "refs/heads", "refs/remotes"] {
            dir.create_dir_all(d)?;
        }
        let contents = format!("[core]\nrepo_version=0\nmode={mode}\n");
        dir.atomic_write("config", contents.as_bytes())?;
        let config = tini::Ini::from_string(&contents).context("Parsing generated config")?;
        Ok(Repo {
            path: path.to_owned(),
            dir,
            mode,
            config,
        })
    }

    /// Open an existing repository, validating its config.
    #[context("Opening repo at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Repo> {
        let dir = Dir::open_ambient_dir(path.as_std_path(), cap_std::ambient_authority())?;
        if dir.symlink_metadata_optional("objects")?.is_none() {
            return Err(anyhow!("Couldn't find objects directory"));
        }
        let config_data = dir.read_to_string("config").context("Reading config")?;
        let config =
            tini::Ini::from_string(&config_data).context("Couldn't parse config file")?;
        let version: String = config
            .get("core", "repo_version")
            .ok_or_else(|| anyhow!("Missing core.repo_version"))?;
        if version != "0" {
            return Err(anyhow!("Invalid repository version '{version}'"));
        }
        let mode = config
            .get::<String>("core", "mode")
            .unwrap_or_else(|| "bare".to_string())
            .parse()?;
        Ok(Repo {
            path: path.to_owned(),
            dir,
            mode,
            config,
        })
    }

    /// The storage mode declared in the config.
    pub fn mode(&self) -> RepoMode {
        self.mode
    }

    /// The path this repository was opened at.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    /// The configured url of a named remote, if any.
    pub fn remote_url(&self, name: &str) -> Option<String> {
        self.config.get(&format!("remote \"{name}\""), "url")
    }

    /// Add a named remote to the config.  On re-parse a later section wins,
    /// so re-adding an existing name replaces it.
    pub fn set_remote(&mut self, name: &str, url: &str) -> Result<()> {
        let mut contents = self.dir.read_to_string("config").context("Reading config")?;
        contents.push_str(&format!("\n[remote \"{name}\"]\nurl={url}\n"));
        self.dir.atomic_write("config", contents.as_bytes())?;
        self.config = tini::Ini::from_string(&contents).context("Couldn't parse config file")?;
        Ok(())
    }

    /// Whether an object exists, loose or packed.
    pub fn has_object(&self, objtype: ObjectType, checksum: &Checksum) -> Result<bool> {
        if self.has_loose_object(objtype, checksum)? {
            return Ok(true);
        }
        Ok(pack::find_in_packs(self, objtype, checksum)?.is_some())
    }

    pub(crate) fn has_loose_object(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<bool> {
        let path = checksum::loose_object_path(checksum, objtype);
        Ok(self.dir.symlink_metadata_optional(path.as_std_path())?.is_some())
    }

    /// Install a staged tmpfile under its canonical object name.  A
    /// pre-existing object with the same key is deduplication, not an error.
    fn link_into_place(
        &self,
        tmp: &Utf8Path,
        checksum: &Checksum,
        objtype: ObjectType,
    ) -> Result<()> {
        let dest = checksum::loose_object_path(checksum, objtype);
        let parent = dest.parent().expect("object path has a parent");
        self.dir.create_dir_all(parent.as_std_path())?;
        match self
            .dir
            .hard_link(tmp.as_std_path(), &self.dir, dest.as_std_path())
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Storing file '{dest}'"))),
        }
    }

    fn unlink_tmp(&self, tmp: &Utf8Path) {
        if let Err(e) = self.dir.remove_file(tmp.as_std_path()) {
            tracing::debug!("Failed to unlink {tmp}: {e}");
        }
    }

    /// Write a serialized metadata object, returning its checksum.  Writing
    /// bytes that already exist under their name is a no-op.
    #[context("Writing {objtype} object")]
    pub fn write_metadata(&self, objtype: ObjectType, data: &[u8]) -> Result<Checksum> {
        if objtype == ObjectType::File {
            return Err(anyhow!("File objects are not metadata"));
        }
        let checksum = checksum::sha256_of(data)?;
        if self.has_loose_object(objtype, &checksum)? {
            return Ok(checksum);
        }
        let tmp = tmp_name("meta-tmp");
        self.dir.write(tmp.as_std_path(), data)?;
        let r = self.link_into_place(&tmp, &checksum, objtype);
        self.unlink_tmp(&tmp);
        r?;
        Ok(checksum)
    }

    /// Like [`Self::write_metadata`], but fail with a corruption error if
    /// the bytes do not hash to `expected`.  Used when replicating objects
    /// between repositories.
    pub fn write_metadata_trusted(
        &self,
        objtype: ObjectType,
        expected: &Checksum,
        data: &[u8],
    ) -> Result<Checksum> {
        let actual = self.write_metadata(objtype, data)?;
        if actual != *expected {
            return Err(Error::Corrupted(format!(
                "Corrupted object {expected} (actual checksum is {actual})"
            ))
            .into());
        }
        Ok(actual)
    }

    /// Load the raw serialized bytes of a metadata object, loose or packed.
    pub(crate) fn load_metadata_bytes(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<Vec<u8>> {
        let path = checksum::loose_object_path(checksum, objtype);
        match self.dir.open(path.as_std_path()) {
            Ok(mut f) => {
                let len = f.metadata()?.len();
                if len > MAX_METADATA_SIZE {
                    return Err(
                        Error::Corrupted(format!("metadata object of {len} bytes")).into()
                    );
                }
                let mut buf = Vec::with_capacity(len as usize);
                f.read_to_end(&mut buf)?;
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match pack::find_in_packs(self, objtype, checksum)? {
                    Some(payload) => Ok(payload),
                    None => Err(Error::NotFound(format!("object {checksum}.{objtype}")).into()),
                }
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("Opening object {path}"))),
        }
    }

    /// Load and decode a metadata object of the given kind.
    pub(crate) fn load_metadata(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<ObjectPayload> {
        let data = self.load_metadata_bytes(objtype, checksum)?;
        decode_metadata(&data, objtype)
            .with_context(|| format!("Corrupted metadata object '{checksum}'"))
    }

    /// Load a commit object.
    pub fn load_commit(&self, checksum: &Checksum) -> Result<Commit> {
        match self.load_metadata(ObjectType::Commit, checksum)? {
            ObjectPayload::Commit(c) => Ok(c),
            _ => unreachable!("kind checked by decode"),
        }
    }

    /// Load a dirtree object.
    pub fn load_dirtree(&self, checksum: &Checksum) -> Result<DirTree> {
        match self.load_metadata(ObjectType::DirTree, checksum)? {
            ObjectPayload::DirTree(t) => Ok(t),
            _ => unreachable!("kind checked by decode"),
        }
    }

    /// Load a dirmeta object.
    pub fn load_dirmeta(&self, checksum: &Checksum) -> Result<DirMeta> {
        match self.load_metadata(ObjectType::DirMeta, checksum)? {
            ObjectPayload::DirMeta(m) => Ok(m),
            _ => unreachable!("kind checked by decode"),
        }
    }

    /// Store a file object from its header and (for regular files) content
    /// stream.  Returns the content-addressed checksum; if an object with
    /// that checksum already exists the store is a no-op.
    #[context("Storing file object")]
    pub fn stage_file(
        &self,
        header: &FileHeader,
        content: Option<&mut dyn Read>,
        cancellable: Option<&CancellationToken>,
    ) -> Result<Checksum> {
        check_cancelled(cancellable)?;
        crate::objects::validate_file_mode(header.mode)?;
        if header.mode & libc::S_IFMT == libc::S_IFDIR {
            return Err(Error::InvalidInput("directories are not file objects".into()).into());
        }
        match self.mode {
            RepoMode::Archive => self.stage_file_archive(header, content),
            RepoMode::Bare => self.stage_file_bare(header, content),
        }
    }

    fn stage_file_archive(
        &self,
        header: &FileHeader,
        content: Option<&mut dyn Read>,
    ) -> Result<Checksum> {
        let tmp = tmp_name("file-tmp");
        let r = (|| {
            let mut h = Sha256::new()?;
            let mut f = self.dir.create(tmp.as_std_path())?;
            f.write_all(&header.to_bytes())?;
            match header.mode & libc::S_IFMT {
                libc::S_IFREG => {
                    let content =
                        content.ok_or_else(|| anyhow!("Regular file object requires content"))?;
                    let mut buf = [0u8; 8192];
                    loop {
                        let n = content.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        f.write_all(&buf[0..n])?;
                        h.update(&buf[0..n])?;
                    }
                }
                libc::S_IFLNK => h.update(header.symlink_target.as_bytes())?,
                libc::S_IFCHR | libc::S_IFBLK => h.update(&header.rdev.to_be_bytes())?,
                _ => (),
            }
            f.flush()?;
            drop(f);
            let checksum = finish_file_checksum(h, header)?;
            self.link_into_place(&tmp, &checksum, ObjectType::File)?;
            Ok(checksum)
        })();
        self.unlink_tmp(&tmp);
        r
    }

    fn stage_file_bare(
        &self,
        header: &FileHeader,
        content: Option<&mut dyn Read>,
    ) -> Result<Checksum> {
        let tmp = tmp_name("file-tmp");
        let r = (|| {
            let mut h = Sha256::new()?;
            match header.mode & libc::S_IFMT {
                libc::S_IFREG => {
                    let content =
                        content.ok_or_else(|| anyhow!("Regular file object requires content"))?;
                    let f = self.dir.create(tmp.as_std_path())?;
                    let mut buf = [0u8; 8192];
                    let mut f = std::io::BufWriter::new(f);
                    loop {
                        let n = content.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        f.write_all(&buf[0..n])?;
                        h.update(&buf[0..n])?;
                    }
                    let f = f.into_inner().context("Flushing staged file")?;
                    rustix::fs::fchmod(&f, Mode::from_raw_mode(header.mode & 0o7777))?;
                    apply_xattrs_fd(&f, &header.xattrs)?;
                    chown_if_permitted_fd(&f, header.uid, header.gid)?;
                }
                libc::S_IFLNK => {
                    self.dir
                        .symlink(&header.symlink_target, tmp.as_std_path())?;
                    h.update(header.symlink_target.as_bytes())?;
                    apply_xattrs_path(&self.path.join(&tmp), &header.xattrs)?;
                    chown_if_permitted_at(&self.dir, &tmp, header.uid, header.gid)?;
                }
                libc::S_IFCHR | libc::S_IFBLK | libc::S_IFIFO => {
                    let ftype = match header.mode & libc::S_IFMT {
                        libc::S_IFCHR => rustix::fs::FileType::CharacterDevice,
                        libc::S_IFBLK => rustix::fs::FileType::BlockDevice,
                        _ => rustix::fs::FileType::Fifo,
                    };
                    rustix::fs::mknodat(
                        &self.dir,
                        tmp.as_std_path(),
                        ftype,
                        Mode::from_raw_mode(header.mode & 0o7777),
                        header.rdev as u64,
                    )
                    .context("mknod")?;
                    // mknod modes are filtered through the umask
                    rustix::fs::chmodat(
                        &self.dir,
                        tmp.as_std_path(),
                        Mode::from_raw_mode(header.mode & 0o7777),
                        AtFlags::empty(),
                    )?;
                    if header.mode & libc::S_IFMT != libc::S_IFIFO {
                        h.update(&header.rdev.to_be_bytes())?;
                    }
                    apply_xattrs_path(&self.path.join(&tmp), &header.xattrs)?;
                    chown_if_permitted_at(&self.dir, &tmp, header.uid, header.gid)?;
                }
                _ => unreachable!("validated file mode"),
            }
            let checksum = finish_file_checksum(h, header)?;
            self.link_into_place(&tmp, &checksum, ObjectType::File)?;
            Ok(checksum)
        })();
        self.unlink_tmp(&tmp);
        r
    }

    /// Open a file object for reading: parse (bare: synthesize) its header
    /// and return a content stream for regular files.  Falls back to packs
    /// when no loose copy exists.
    pub fn open_file_object(&self, checksum: &Checksum) -> Result<FileObject> {
        let path = checksum::loose_object_path(checksum, ObjectType::File);
        match self.mode {
            RepoMode::Bare => {
                let meta = match self.dir.symlink_metadata_optional(path.as_std_path())? {
                    Some(m) => m,
                    None => return self.open_packed_file_object(checksum),
                };
                let mode = meta.mode();
                let abs = self.path.join(&path);
                let symlink_target = if mode & libc::S_IFMT == libc::S_IFLNK {
                    let t = self.dir.read_link(path.as_std_path())?;
                    t.to_str()
                        .ok_or_else(|| anyhow!("Non-utf8 symlink target"))?
                        .to_string()
                } else {
                    String::new()
                };
                let header = FileHeader {
                    uid: meta.uid(),
                    gid: meta.gid(),
                    mode,
                    rdev: meta.rdev() as u32,
                    symlink_target,
                    xattrs: xattrs_for_path(&abs)?,
                };
                let (size, content) = if header.is_regular() {
                    let f = self.dir.open(path.as_std_path())?;
                    (
                        meta.len(),
                        Some(Box::new(f.into_std()) as Box<dyn Read + Send>),
                    )
                } else {
                    (0, None)
                };
                Ok(FileObject {
                    header,
                    size,
                    content,
                })
            }
            RepoMode::Archive => {
                let f = match self.dir.open(path.as_std_path()) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return self.open_packed_file_object(checksum);
                    }
                    Err(e) => {
                        return Err(anyhow::Error::new(e).context(format!("Opening object {path}")));
                    }
                };
                let mut f = f.into_std();
                let total = f.metadata()?.len();
                let header = FileHeader::from_reader(&mut f)
                    .with_context(|| format!("Corrupted object '{checksum}'"))?;
                let pos = f.stream_position()?;
                let size = total.saturating_sub(pos);
                let content = if header.is_regular() {
                    Some(Box::new(f) as Box<dyn Read + Send>)
                } else {
                    None
                };
                Ok(FileObject {
                    header,
                    size,
                    content,
                })
            }
        }
    }

    fn open_packed_file_object(&self, checksum: &Checksum) -> Result<FileObject> {
        let payload = pack::find_in_packs(self, ObjectType::File, checksum)?
            .ok_or_else(|| Error::NotFound(format!("object {checksum}.file")))?;
        let (header, hlen) = FileHeader::from_bytes_prefix(&payload)
            .with_context(|| format!("Corrupted pack entry '{checksum}'"))?;
        let size = (payload.len() - hlen) as u64;
        let content = if header.is_regular() {
            let mut cursor = std::io::Cursor::new(payload);
            cursor.set_position(hlen as u64);
            Some(Box::new(cursor) as Box<dyn Read + Send>)
        } else {
            None
        };
        Ok(FileObject {
            header,
            size,
            content,
        })
    }

    /// Enumerate every loose object: two directory levels under `objects/`,
    /// filtered by extension; foreign files are skipped.
    pub fn iter_loose_objects(&self) -> Result<Vec<(Checksum, ObjectType)>> {
        let mut ret = Vec::new();
        let objects = self.dir.open_dir("objects")?;
        for entry in objects.entries()? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.len() != 2 || !entry.file_type()?.is_dir() {
                continue;
            }
            let sub = objects.open_dir(name)?;
            for child in sub.entries()? {
                let child = child?;
                let childname = child.file_name();
                let Some(childname) = childname.to_str() else {
                    continue;
                };
                if let Some((checksum, objtype)) = checksum::parse_loose_name(name, childname) {
                    ret.push((checksum, objtype));
                }
            }
        }
        ret.sort();
        Ok(ret)
    }

    /// Byte size of a loose object's on-disk artifact.
    pub(crate) fn loose_object_size(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<u64> {
        let path = checksum::loose_object_path(checksum, objtype);
        let meta = self
            .dir
            .symlink_metadata_optional(path.as_std_path())?
            .ok_or_else(|| Error::NotFound(format!("object {checksum}.{objtype}")))?;
        Ok(meta.len())
    }

    /// Remove a loose object (fsck `--delete`, repack cleanup).
    pub(crate) fn delete_loose_object(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
    ) -> Result<()> {
        let path = checksum::loose_object_path(checksum, objtype);
        self.dir
            .remove_file(path.as_std_path())
            .with_context(|| format!("Deleting {path}"))?;
        Ok(())
    }
}

fn finish_file_checksum(mut h: Sha256, header: &FileHeader) -> Result<Checksum> {
    h.update(&header.uid.to_be_bytes())?;
    h.update(&header.gid.to_be_bytes())?;
    h.update(&(header.mode & !libc::S_IFMT).to_be_bytes())?;
    h.update(&crate::serialize::xattrs_to_bytes(&header.xattrs))?;
    h.finish()
}

/// Read the extended attributes of a path (not following symlinks), in
/// canonical sorted order.  Filesystems without xattr support yield an
/// empty set.
pub(crate) fn xattrs_for_path(path: &Utf8Path) -> Result<Xattrs> {
    let mut names = match rustix::fs::llistxattr(path.as_std_path(), &mut []) {
        Ok(n) => vec![0u8; n],
        Err(rustix::io::Errno::NOTSUP) => return Ok(Xattrs::new()),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("Listing xattrs of {path}"))),
    };
    let n = rustix::fs::llistxattr(path.as_std_path(), &mut names)?;
    names.truncate(n);
    let mut ret = Xattrs::new();
    for name in names.split(|&b| b == 0).filter(|s| !s.is_empty()) {
        let cname = CString::new(name).expect("no interior NUL");
        let n = rustix::fs::lgetxattr(path.as_std_path(), &cname, &mut [])?;
        let mut value = vec![0u8; n];
        let n = rustix::fs::lgetxattr(path.as_std_path(), &cname, &mut value)?;
        value.truncate(n);
        ret.push((name.to_vec(), value));
    }
    Ok(crate::serialize::canonicalize_xattrs(ret))
}

pub(crate) fn apply_xattrs_fd(fd: &impl rustix::fd::AsFd, xattrs: &Xattrs) -> Result<()> {
    for (name, value) in xattrs {
        let cname = CString::new(name.as_slice()).context("Invalid xattr name")?;
        rustix::fs::fsetxattr(fd, &cname, value, XattrFlags::empty())
            .context("Setting xattr")?;
    }
    Ok(())
}

pub(crate) fn apply_xattrs_path(path: &Utf8Path, xattrs: &Xattrs) -> Result<()> {
    for (name, value) in xattrs {
        let cname = CString::new(name.as_slice()).context("Invalid xattr name")?;
        match rustix::fs::lsetxattr(path.as_std_path(), &cname, value, XattrFlags::empty()) {
            Ok(()) => (),
            // Symlinks commonly refuse user.* attributes
            Err(rustix::io::Errno::PERM) | Err(rustix::io::Errno::NOTSUP) => {
                tracing::debug!("Skipping xattr on {path}");
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Setting xattr on {path}")));
            }
        }
    }
    Ok(())
}

/// Apply ownership when we can; unprivileged writers keep their own ids.
pub(crate) fn chown_if_permitted_fd(
    fd: &impl rustix::fd::AsFd,
    uid: u32,
    gid: u32,
) -> Result<()> {
    #[allow(unsafe_code)]
    let (uid, gid) = (unsafe { Uid::from_raw(uid) }, unsafe { Gid::from_raw(gid) });
    match rustix::fs::fchown(fd, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::PERM) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context("chown")),
    }
}

pub(crate) fn chown_if_permitted_at(dir: &Dir, path: &Utf8Path, uid: u32, gid: u32) -> Result<()> {
    #[allow(unsafe_code)]
    let (uid, gid) = (unsafe { Uid::from_raw(uid) }, unsafe { Gid::from_raw(gid) });
    match rustix::fs::chownat(
        dir,
        path.as_std_path(),
        Some(uid),
        Some(gid),
        AtFlags::SYMLINK_NOFOLLOW,
    ) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::PERM) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context("chown")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    fn testrepo(mode: RepoMode) -> (tempfile::TempDir, Repo) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("repo");
        let repo = Repo::create(&path, mode).unwrap();
        (td, repo)
    }

    #[test]
    fn test_init_and_open() {
        let (td, repo) = testrepo(RepoMode::Archive);
        assert_eq!(repo.mode(), RepoMode::Archive);
        let reopened = Repo::open(repo.path()).unwrap();
        assert_eq!(reopened.mode(), RepoMode::Archive);
        drop(reopened);
        // Missing skeleton is an error
        let bad = Utf8Path::from_path(td.path()).unwrap().join("nosuch");
        assert!(Repo::open(&bad).is_err());
    }

    #[test]
    fn test_metadata_dedup_and_load() {
        let (_td, repo) = testrepo(RepoMode::Archive);
        let meta = DirMeta {
            uid: 0,
            gid: 0,
            mode: libc::S_IFDIR | 0o755,
            xattrs: Vec::new(),
        };
        let bytes = meta.to_object_bytes();
        let c1 = repo.write_metadata(ObjectType::DirMeta, &bytes).unwrap();
        let c2 = repo.write_metadata(ObjectType::DirMeta, &bytes).unwrap();
        assert_eq!(c1, c2);
        assert!(repo.has_object(ObjectType::DirMeta, &c1).unwrap());
        assert_eq!(repo.load_dirmeta(&c1).unwrap(), meta);
        // Wrong kind lookup misses
        assert!(!repo.has_object(ObjectType::Commit, &c1).unwrap());
        assert!(crate::Error::is_not_found(
            &repo.load_commit(&c1).unwrap_err()
        ));
    }

    #[test]
    fn test_write_metadata_trusted_rejects_mismatch() {
        let (_td, repo) = testrepo(RepoMode::Archive);
        let meta = DirMeta::default();
        let bytes = meta.to_object_bytes();
        let bogus = Checksum::from_bytes(&[7; 32]).unwrap();
        assert!(
            repo.write_metadata_trusted(ObjectType::DirMeta, &bogus, &bytes)
                .is_err()
        );
    }

    #[test]
    fn test_file_object_roundtrip_archive() {
        let (_td, repo) = testrepo(RepoMode::Archive);
        let header = FileHeader {
            uid: 0,
            gid: 0,
            mode: libc::S_IFREG | 0o644,
            rdev: 0,
            symlink_target: String::new(),
            xattrs: Vec::new(),
        };
        let mut content: &[u8] = b"hello world";
        let c = repo
            .stage_file(&header, Some(&mut content), None)
            .unwrap();
        let obj = repo.open_file_object(&c).unwrap();
        assert_eq!(obj.header, header);
        assert_eq!(obj.size, 11);
        let mut buf = Vec::new();
        obj.content.unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello world");

        // Identical bytes+meta dedup to a single object
        let mut content: &[u8] = b"hello world";
        let c2 = repo.stage_file(&header, Some(&mut content), None).unwrap();
        assert_eq!(c, c2);
        let n_files = repo
            .iter_loose_objects()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t == ObjectType::File)
            .count();
        assert_eq!(n_files, 1);
    }

    #[test]
    fn test_file_object_roundtrip_bare() {
        let (_td, repo) = testrepo(RepoMode::Bare);
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        let header = FileHeader {
            uid,
            gid,
            mode: libc::S_IFREG | 0o600,
            rdev: 0,
            symlink_target: String::new(),
            xattrs: Vec::new(),
        };
        let mut content: &[u8] = b"bare content";
        let c = repo.stage_file(&header, Some(&mut content), None).unwrap();
        let obj = repo.open_file_object(&c).unwrap();
        assert_eq!(obj.header.mode, header.mode);
        assert_eq!(obj.header.uid, uid);
        let mut buf = Vec::new();
        obj.content.unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"bare content");

        let link = FileHeader {
            uid,
            gid,
            mode: libc::S_IFLNK | 0o777,
            rdev: 0,
            symlink_target: "some/target".into(),
            xattrs: Vec::new(),
        };
        let c = repo.stage_file(&link, None, None).unwrap();
        let obj = repo.open_file_object(&c).unwrap();
        assert_eq!(obj.header.symlink_target, "some/target");
        assert!(obj.content.is_none());
    }

    #[test]
    fn test_cancellation() {
        let (_td, repo) = testrepo(RepoMode::Archive);
        let token = CancellationToken::new();
        token.cancel();
        let header = FileHeader {
            mode: libc::S_IFREG | 0o644,
            ..Default::default()
        };
        let mut content: &[u8] = b"";
        let err = repo
            .stage_file(&header, Some(&mut content), Some(&token))
            .unwrap_err();
        assert!(
            err.chain()
                .any(|e| matches!(e.downcast_ref(), Some(Error::Cancelled)))
        );
    }
}
