//! Lazy, read-only filesystem view over committed snapshots.
//!
//! A [`CommitFile`] is either the root of a commit or a child reached
//! through its parent's dirtree.  Nodes resolve on first use and cache the
//! outcome, including failures; a node that failed to resolve returns the
//! same error for every subsequent operation and is never retried.

use std::fmt;
use std::io::Read;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::{Dir, MetadataExt as _};
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::Error;
use crate::checksum::Checksum;
use crate::objects::{DirMeta, DirTree, FileHeader};
use crate::repo::{Repo, xattrs_for_path};
use crate::serialize::Xattrs;

/// The closed set of filesystem entry types a snapshot can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A character device.
    CharDevice,
    /// A block device.
    BlockDevice,
    /// A named pipe.
    Fifo,
}

impl FileType {
    /// Derive from the file-type bits of an `st_mode`.
    pub fn from_mode(mode: u32) -> Result<FileType> {
        Ok(match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::Regular,
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::Fifo,
            o => return Err(Error::InvalidInput(format!("invalid file type {o:o}")).into()),
        })
    }

    /// Whether this is [`FileType::Directory`].
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Synthesized metadata for one entry in a tree.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Base name within the parent directory; empty for a tree root.
    pub name: String,
    /// Entry type.
    pub file_type: FileType,
    /// Content size in bytes (regular files only).
    pub size: u64,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Full `st_mode`.
    pub mode: u32,
    /// Device identifier for character/block devices.
    pub rdev: u32,
    /// Symlink target; empty unless a symlink.
    pub symlink_target: String,
    /// Extended attributes, sorted by name.
    pub xattrs: Xattrs,
}

impl FileInfo {
    pub(crate) fn from_file_header(name: &str, header: &FileHeader, size: u64) -> Result<FileInfo> {
        Ok(FileInfo {
            name: name.to_string(),
            file_type: FileType::from_mode(header.mode)?,
            size,
            uid: header.uid,
            gid: header.gid,
            mode: header.mode,
            rdev: header.rdev,
            symlink_target: header.symlink_target.clone(),
            xattrs: header.xattrs.clone(),
        })
    }

    pub(crate) fn from_dirmeta(name: &str, meta: &DirMeta) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            file_type: FileType::Directory,
            size: 0,
            uid: meta.uid,
            gid: meta.gid,
            mode: meta.mode,
            rdev: 0,
            symlink_target: String::new(),
            xattrs: meta.xattrs.clone(),
        }
    }

    pub(crate) fn to_file_header(&self) -> FileHeader {
        FileHeader {
            uid: self.uid,
            gid: self.gid,
            mode: self.mode,
            rdev: self.rdev,
            symlink_target: self.symlink_target.clone(),
            xattrs: self.xattrs.clone(),
        }
    }
}

/// The capability set shared by everything "file-like": committed snapshot
/// nodes and live filesystem paths.  Tree ingestion and diff accept either.
pub trait TreeNode {
    /// The entry's name within its parent (empty for a root).
    fn basename(&self) -> String;

    /// Synthesize this entry's metadata.
    fn query_info(&self) -> Result<FileInfo>;

    /// Open the content stream of a regular file.
    fn read(&self) -> Result<Box<dyn Read + Send>>;

    /// Enumerate a directory's children, sorted by name.
    fn children(&self) -> Result<Vec<Box<dyn TreeNode>>>;

    /// Look up one child by name; `None` if absent.
    fn lookup(&self, name: &str) -> Result<Option<Box<dyn TreeNode>>>;

    /// The content-addressed identity of a non-directory entry, if it can
    /// be produced (committed nodes know it; live files compute it).
    fn file_checksum(&self) -> Result<Option<Checksum>>;

    /// `(dirtree, dirmeta)` checksums when cheaply known; lets callers
    /// prune recursion over provably identical subtrees.
    fn tree_checksums(&self) -> Result<Option<(Checksum, Checksum)>> {
        Ok(None)
    }
}

#[derive(Clone)]
enum Resolved {
    Directory {
        tree: Arc<DirTree>,
        meta: Arc<DirMeta>,
        tree_checksum: Checksum,
        meta_checksum: Checksum,
    },
    Leaf {
        checksum: Checksum,
    },
    Failed {
        not_found: bool,
        message: String,
    },
}

struct Node {
    repo: Arc<Repo>,
    commit: Checksum,
    parent: Option<CommitFile>,
    name: String,
    resolved: OnceLock<Resolved>,
}

/// One node of the virtual tree of a commit.
#[derive(Clone)]
pub struct CommitFile {
    node: Arc<Node>,
}

impl fmt::Debug for CommitFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitFile")
            .field("commit", &self.node.commit)
            .field("path", &self.path())
            .finish()
    }
}

impl PartialEq for CommitFile {
    fn eq(&self, other: &Self) -> bool {
        self.node.commit == other.node.commit && self.path() == other.path()
    }
}

impl Eq for CommitFile {}

fn str_hash(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

impl CommitFile {
    /// The root node of a commit's tree.
    pub fn new_root(repo: Arc<Repo>, commit: Checksum) -> CommitFile {
        CommitFile {
            node: Arc::new(Node {
                repo,
                commit,
                parent: None,
                name: String::new(),
                resolved: OnceLock::new(),
            }),
        }
    }

    /// The repository this node reads from.
    pub fn repo(&self) -> &Arc<Repo> {
        &self.node.repo
    }

    /// The commit this tree was opened from.
    pub fn commit_checksum(&self) -> &Checksum {
        &self.node.commit
    }

    /// The parent node; `None` for the root.
    pub fn parent(&self) -> Option<CommitFile> {
        self.node.parent.clone()
    }

    /// The node's name within its parent; empty for the root.
    pub fn basename(&self) -> &str {
        &self.node.name
    }

    /// Slash-joined names from the root.
    pub fn path(&self) -> Utf8PathBuf {
        match &self.node.parent {
            None => "/".into(),
            Some(parent) => parent.path().join(&self.node.name),
        }
    }

    /// A lazily-resolved child node.  The child is not checked for
    /// existence until it is first used.
    pub fn child(&self, name: &str) -> CommitFile {
        CommitFile {
            node: Arc::new(Node {
                repo: self.node.repo.clone(),
                commit: self.node.commit,
                parent: Some(self.clone()),
                name: name.to_string(),
                resolved: OnceLock::new(),
            }),
        }
    }

    /// Descend `path` component by component.  An absolute path resolves
    /// from the commit root.
    pub fn resolve_relative_path(&self, path: &str) -> CommitFile {
        let mut node = if path.starts_with('/') {
            let mut root = self.clone();
            while let Some(p) = root.parent() {
                root = p;
            }
            root
        } else {
            self.clone()
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            node = node.child(component);
        }
        node
    }

    fn do_resolve(&self) -> Resolved {
        let r = match &self.node.parent {
            None => self.do_resolve_commit(),
            Some(parent) => self.do_resolve_from_parent(parent),
        };
        match r {
            Ok(resolved) => resolved,
            Err(e) => Resolved::Failed {
                not_found: Error::is_not_found(&e),
                message: format!("{e:#}"),
            },
        }
    }

    fn do_resolve_commit(&self) -> Result<Resolved> {
        let commit = self.node.repo.load_commit(&self.node.commit)?;
        let tree = self.node.repo.load_dirtree(&commit.root_tree)?;
        let meta = self.node.repo.load_dirmeta(&commit.root_meta)?;
        Ok(Resolved::Directory {
            tree: Arc::new(tree),
            meta: Arc::new(meta),
            tree_checksum: commit.root_tree,
            meta_checksum: commit.root_meta,
        })
    }

    fn do_resolve_from_parent(&self, parent: &CommitFile) -> Result<Resolved> {
        let name = self.node.name.as_str();
        let Resolved::Directory { tree, .. } = parent.resolved()? else {
            return Err(Error::NotDirectory(parent.path().into()).into());
        };
        if let Some(checksum) = tree.lookup_file(name) {
            return Ok(Resolved::Leaf {
                checksum: *checksum,
            });
        }
        if let Some((tree_checksum, meta_checksum)) = tree.lookup_subdir(name) {
            let (tree_checksum, meta_checksum) = (*tree_checksum, *meta_checksum);
            let tree = self.node.repo.load_dirtree(&tree_checksum)?;
            let meta = self.node.repo.load_dirmeta(&meta_checksum)?;
            return Ok(Resolved::Directory {
                tree: Arc::new(tree),
                meta: Arc::new(meta),
                tree_checksum,
                meta_checksum,
            });
        }
        Err(Error::NotFound(format!("No such file or directory: {}", self.path())).into())
    }

    fn resolved(&self) -> Result<&Resolved> {
        let r = self.node.resolved.get_or_init(|| self.do_resolve());
        match r {
            Resolved::Failed { not_found, message } => {
                if *not_found {
                    Err(Error::NotFound(message.clone()).into())
                } else {
                    Err(anyhow!("{message}"))
                }
            }
            ok => Ok(ok),
        }
    }

    /// Force resolution now; idempotent.
    pub fn ensure_resolved(&self) -> Result<()> {
        self.resolved().map(|_| ())
    }

    /// Whether this node resolves at all.  Errors other than absence
    /// still propagate.
    pub fn exists(&self) -> Result<bool> {
        match self.resolved() {
            Ok(_) => Ok(true),
            Err(e) if Error::is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether this node is a directory.
    pub fn is_dir(&self) -> Result<bool> {
        Ok(matches!(self.resolved()?, Resolved::Directory { .. }))
    }

    /// The file-object checksum of a non-directory node.
    pub fn file_checksum(&self) -> Result<Option<Checksum>> {
        match self.resolved()? {
            Resolved::Leaf { checksum } => Ok(Some(*checksum)),
            _ => Ok(None),
        }
    }

    /// The `(dirtree, dirmeta)` checksums of a directory node.
    pub fn tree_checksums(&self) -> Result<Option<(Checksum, Checksum)>> {
        match self.resolved()? {
            Resolved::Directory {
                tree_checksum,
                meta_checksum,
                ..
            } => Ok(Some((*tree_checksum, *meta_checksum))),
            _ => Ok(None),
        }
    }

    /// Synthesize this node's metadata.  Directory attributes come from
    /// the dirmeta; file attributes come from the file object (a `stat` of
    /// the object entry in bare mode, the stored header in archive mode).
    pub fn query_info(&self) -> Result<FileInfo> {
        match self.resolved()? {
            Resolved::Directory { meta, .. } => {
                Ok(FileInfo::from_dirmeta(&self.node.name, meta))
            }
            Resolved::Leaf { checksum } => {
                let obj = self.node.repo.open_file_object(checksum)?;
                FileInfo::from_file_header(&self.node.name, &obj.header, obj.size)
            }
            Resolved::Failed { .. } => unreachable!("resolved() returned the failure"),
        }
    }

    /// Open the content of a regular file node.
    pub fn read(&self) -> Result<Box<dyn Read + Send>> {
        match self.resolved()? {
            Resolved::Directory { .. } => {
                Err(Error::IsDirectory(self.path().into_string()).into())
            }
            Resolved::Leaf { checksum } => {
                let obj = self.node.repo.open_file_object(checksum)?;
                obj.content.ok_or_else(|| {
                    Error::Unsupported(format!("no content stream for {}", self.path())).into()
                })
            }
            Resolved::Failed { .. } => unreachable!("resolved() returned the failure"),
        }
    }

    /// A directory's children in dirtree (sorted) order.
    pub fn enumerate_children(&self) -> Result<Vec<CommitFile>> {
        let Resolved::Directory { tree, .. } = self.resolved()? else {
            return Err(Error::NotDirectory(self.path().into_string()).into());
        };
        let mut names: Vec<&str> = Vec::with_capacity(tree.files.len() + tree.subdirs.len());
        names.extend(tree.files.iter().map(|f| f.0.as_str()));
        names.extend(tree.subdirs.iter().map(|d| d.0.as_str()));
        names.sort_unstable();
        Ok(names.into_iter().map(|n| self.child(n)).collect())
    }

    /// A stable per-repository node hash: `str_hash(commit)` for the root,
    /// otherwise `hash(parent) + str_hash(name)` with wrapping addition.
    pub fn node_hash(&self) -> u32 {
        match &self.node.parent {
            None => str_hash(&self.node.commit.to_hex()),
            Some(parent) => parent.node_hash().wrapping_add(str_hash(&self.node.name)),
        }
    }
}

impl TreeNode for CommitFile {
    fn basename(&self) -> String {
        self.node.name.clone()
    }

    fn query_info(&self) -> Result<FileInfo> {
        CommitFile::query_info(self)
    }

    fn read(&self) -> Result<Box<dyn Read + Send>> {
        CommitFile::read(self)
    }

    fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        Ok(self
            .enumerate_children()?
            .into_iter()
            .map(|c| Box::new(c) as Box<dyn TreeNode>)
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Option<Box<dyn TreeNode>>> {
        let child = self.child(name);
        if child.exists()? {
            Ok(Some(Box::new(child)))
        } else {
            Ok(None)
        }
    }

    fn file_checksum(&self) -> Result<Option<Checksum>> {
        CommitFile::file_checksum(self)
    }

    fn tree_checksums(&self) -> Result<Option<(Checksum, Checksum)>> {
        CommitFile::tree_checksums(self)
    }
}

/// Resolve `rev` and open the virtual tree root of the resulting commit.
pub fn read_commit(repo: &Arc<Repo>, rev: &str) -> Result<CommitFile> {
    let resolved = repo
        .resolve_rev(rev, false)?
        .ok_or_else(|| Error::NotFound(format!("rev '{rev}'")))?;
    let root = CommitFile::new_root(repo.clone(), resolved);
    root.ensure_resolved()
        .with_context(|| format!("Reading commit {resolved}"))?;
    Ok(root)
}

/// A live filesystem path presented through the [`TreeNode`] capability
/// set, so ingestion and diff can consume it interchangeably with
/// committed snapshots.
pub struct LocalFile {
    dir: Arc<Dir>,
    base: Utf8PathBuf,
    rel: Utf8PathBuf,
    name: String,
}

impl fmt::Debug for LocalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFile")
            .field("base", &self.base)
            .field("rel", &self.rel)
            .finish()
    }
}

impl LocalFile {
    /// Open a live directory as a tree root.
    pub fn new_root(path: &Utf8Path) -> Result<LocalFile> {
        let dir = Dir::open_ambient_dir(path.as_std_path(), cap_std::ambient_authority())
            .with_context(|| format!("Opening {path}"))?;
        Ok(LocalFile {
            dir: Arc::new(dir),
            base: path.to_owned(),
            rel: Utf8PathBuf::new(),
            name: String::new(),
        })
    }

    fn child_node(&self, name: &str) -> LocalFile {
        LocalFile {
            dir: self.dir.clone(),
            base: self.base.clone(),
            rel: self.rel.join(name),
            name: name.to_string(),
        }
    }

    fn abs(&self) -> Utf8PathBuf {
        self.base.join(&self.rel)
    }
}

impl TreeNode for LocalFile {
    fn basename(&self) -> String {
        self.name.clone()
    }

    fn query_info(&self) -> Result<FileInfo> {
        let meta = if self.rel.as_str().is_empty() {
            self.dir.dir_metadata()?
        } else {
            self.dir
                .symlink_metadata_optional(self.rel.as_std_path())?
                .ok_or_else(|| Error::NotFound(format!("No such file or directory: {}", self.abs())))?
        };
        let mode = meta.mode();
        let symlink_target = if mode & libc::S_IFMT == libc::S_IFLNK {
            self.dir
                .read_link(self.rel.as_std_path())?
                .to_str()
                .ok_or_else(|| anyhow!("Non-utf8 symlink target"))?
                .to_string()
        } else {
            String::new()
        };
        Ok(FileInfo {
            name: self.name.clone(),
            file_type: FileType::from_mode(mode)?,
            size: meta.len(),
            uid: meta.uid(),
            gid: meta.gid(),
            mode,
            rdev: meta.rdev() as u32,
            symlink_target,
            xattrs: xattrs_for_path(&self.abs())?,
        })
    }

    fn read(&self) -> Result<Box<dyn Read + Send>> {
        let f = self
            .dir
            .open(self.rel.as_std_path())
            .with_context(|| format!("Opening {}", self.abs()))?;
        Ok(Box::new(f.into_std()))
    }

    fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        let mut names = Vec::new();
        let entries = if self.rel.as_str().is_empty() {
            self.dir.entries()?
        } else {
            self.dir.read_dir(self.rel.as_std_path())?
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| Error::InvalidInput(format!("non-UTF-8 name {name:?}")))?;
            names.push(name.to_string());
        }
        names.sort_unstable();
        Ok(names
            .into_iter()
            .map(|n| Box::new(self.child_node(&n)) as Box<dyn TreeNode>)
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Option<Box<dyn TreeNode>>> {
        let child = self.child_node(name);
        if self
            .dir
            .symlink_metadata_optional(child.rel.as_std_path())?
            .is_some()
        {
            Ok(Some(Box::new(child)))
        } else {
            Ok(None)
        }
    }

    fn file_checksum(&self) -> Result<Option<Checksum>> {
        let info = self.query_info()?;
        if info.file_type.is_dir() {
            return Ok(None);
        }
        let header = info.to_file_header();
        let checksum = if info.file_type == FileType::Regular {
            let mut content = self.read()?;
            crate::checksum::checksum_file_object(&header, Some(&mut content))?
        } else {
            crate::checksum::checksum_file_object(&header, None)?
        };
        Ok(Some(checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_hash_additive() {
        // The composition is addition, not xor; sibling order independent.
        let a = str_hash("commit");
        assert_eq!(
            a.wrapping_add(str_hash("x")).wrapping_add(str_hash("y")),
            a.wrapping_add(str_hash("y")).wrapping_add(str_hash("x"))
        );
        assert_ne!(str_hash("a"), str_hash("b"));
    }

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(
            FileType::from_mode(libc::S_IFREG | 0o644).unwrap(),
            FileType::Regular
        );
        assert_eq!(
            FileType::from_mode(libc::S_IFLNK | 0o777).unwrap(),
            FileType::Symlink
        );
        assert!(FileType::from_mode(libc::S_IFSOCK | 0o644).is_err());
    }
}
