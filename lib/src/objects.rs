//! Typed payloads for the serialized metadata object kinds, their canonical
//! byte forms, and structural validation.

use anyhow::Result;

pub use crate::serialize::{MetaDict, MetaValue, Xattrs};
use crate::checksum::{Checksum, ObjectType};
use crate::serialize::{TupleReader, TupleWriter};
use crate::Error;

/// Upper bound on a serialized metadata object; larger is corruption.
pub(crate) const MAX_METADATA_SIZE: u64 = 1 << 26;

/// The metadata of one non-directory filesystem entry.  For symlinks
/// `symlink_target` is non-empty; for devices `rdev` is non-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Full `st_mode`, including the file type bits.
    pub mode: u32,
    /// Device identifier; zero unless character/block device.
    pub rdev: u32,
    /// Symbolic link target; empty unless `S_ISLNK(mode)`.
    pub symlink_target: String,
    /// Extended attributes, sorted ascending by name.
    pub xattrs: Xattrs,
}

impl FileHeader {
    fn write_body(&self, w: &mut TupleWriter) {
        w.put_u32(self.uid);
        w.put_u32(self.gid);
        w.put_u32(self.mode);
        w.put_u32(self.rdev);
        w.put_str(&self.symlink_target);
        w.put_xattrs(&self.xattrs);
    }

    fn read_body(r: &mut TupleReader) -> Result<FileHeader> {
        let header = FileHeader {
            uid: r.read_u32()?,
            gid: r.read_u32()?,
            mode: r.read_u32()?,
            rdev: r.read_u32()?,
            symlink_target: r.read_str()?.to_string(),
            xattrs: r.read_xattrs()?,
        };
        validate_file_mode(header.mode)?;
        Ok(header)
    }

    /// The archive-mode on-disk prefix: a 32-bit big-endian length followed
    /// by the header tuple.  Content bytes follow directly for regular files.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = TupleWriter::new();
        self.write_body(&mut w);
        let body = w.into_bytes();
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parse a length-prefixed header from the start of `data`, returning
    /// the header and the total number of bytes it occupied.
    pub fn from_bytes_prefix(data: &[u8]) -> Result<(FileHeader, usize)> {
        let len = data
            .get(0..4)
            .map(|b| u32::from_be_bytes(b.try_into().expect("4 bytes")) as usize)
            .ok_or_else(|| Error::Corrupted("truncated file header".into()))?;
        let body = data
            .get(4..4 + len)
            .ok_or_else(|| Error::Corrupted("truncated file header".into()))?;
        let mut r = TupleReader::new(body);
        let header = FileHeader::read_body(&mut r)?;
        r.expect_end()?;
        Ok((header, 4 + len))
    }

    /// Read a length-prefixed header from a stream, leaving the stream
    /// positioned at the first content byte.
    pub fn from_reader(r: &mut impl std::io::Read) -> Result<FileHeader> {
        let mut lenbuf = [0u8; 4];
        r.read_exact(&mut lenbuf)
            .map_err(|_| Error::Corrupted("truncated file header".into()))?;
        let len = u32::from_be_bytes(lenbuf) as u64;
        if len > MAX_METADATA_SIZE {
            return Err(Error::Corrupted(format!("file header of {len} bytes")).into());
        }
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body)
            .map_err(|_| Error::Corrupted("truncated file header".into()))?;
        let mut tr = TupleReader::new(&body);
        let header = FileHeader::read_body(&mut tr)?;
        tr.expect_end()?;
        Ok(header)
    }

    /// Whether this header describes a regular file (and hence is followed
    /// by content bytes in archive mode).
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

/// Directory metadata only; a directory's children live in [`DirTree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirMeta {
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Full `st_mode` of the directory.
    pub mode: u32,
    /// Extended attributes, sorted ascending by name.
    pub xattrs: Xattrs,
}

impl DirMeta {
    /// Canonical serialized object bytes (kind tag + length + body).
    pub fn to_object_bytes(&self) -> Vec<u8> {
        let mut w = TupleWriter::new();
        w.put_u32(self.uid);
        w.put_u32(self.gid);
        w.put_u32(self.mode);
        w.put_xattrs(&self.xattrs);
        wrap_metadata(ObjectType::DirMeta, w.into_bytes())
    }

    fn read_body(r: &mut TupleReader) -> Result<DirMeta> {
        Ok(DirMeta {
            uid: r.read_u32()?,
            gid: r.read_u32()?,
            mode: r.read_u32()?,
            xattrs: r.read_xattrs()?,
        })
    }
}

/// A directory's children: `(name, file object)` entries and
/// `(name, dirtree, dirmeta)` entries, each strictly ascending by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirTree {
    /// Non-directory children.
    pub files: Vec<(String, Checksum)>,
    /// Directory children with their content and metadata checksums.
    pub subdirs: Vec<(String, Checksum, Checksum)>,
}

impl DirTree {
    /// Canonical serialized object bytes.  Fails if [`Self::validate`] does.
    pub fn to_object_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut w = TupleWriter::new();
        w.put_u32(self.files.len() as u32);
        for (name, csum) in &self.files {
            w.put_str(name);
            w.put_bytes(csum.as_bytes());
        }
        w.put_u32(self.subdirs.len() as u32);
        for (name, tree, meta) in &self.subdirs {
            w.put_str(name);
            w.put_bytes(tree.as_bytes());
            w.put_bytes(meta.as_bytes());
        }
        Ok(wrap_metadata(ObjectType::DirTree, w.into_bytes()))
    }

    fn read_body(r: &mut TupleReader) -> Result<DirTree> {
        let nfiles = r.read_u32()? as usize;
        let mut files = Vec::with_capacity(nfiles.min(4096));
        for _ in 0..nfiles {
            let name = r.read_str()?.to_string();
            let csum = Checksum::from_bytes(r.read_bytes()?)?;
            files.push((name, csum));
        }
        let nsubdirs = r.read_u32()? as usize;
        let mut subdirs = Vec::with_capacity(nsubdirs.min(4096));
        for _ in 0..nsubdirs {
            let name = r.read_str()?.to_string();
            let tree = Checksum::from_bytes(r.read_bytes()?)?;
            let meta = Checksum::from_bytes(r.read_bytes()?)?;
            subdirs.push((name, tree, meta));
        }
        let ret = DirTree { files, subdirs };
        ret.validate()?;
        Ok(ret)
    }

    /// Enforce the dirtree invariants: every name valid, both sequences
    /// strictly ascending, and the two name sets disjoint.
    pub fn validate(&self) -> Result<()> {
        for name in self
            .files
            .iter()
            .map(|f| &f.0)
            .chain(self.subdirs.iter().map(|d| &d.0))
        {
            validate_name(name)?;
        }
        for w in self.files.windows(2) {
            if w[0].0 >= w[1].0 {
                return Err(
                    Error::Corrupted(format!("misordered dirtree entry '{}'", w[1].0)).into(),
                );
            }
        }
        for w in self.subdirs.windows(2) {
            if w[0].0 >= w[1].0 {
                return Err(
                    Error::Corrupted(format!("misordered dirtree entry '{}'", w[1].0)).into(),
                );
            }
        }
        // Both sequences are sorted; a linear merge finds duplicates.
        let mut files = self.files.iter().map(|f| f.0.as_str()).peekable();
        for (name, _, _) in &self.subdirs {
            while let Some(f) = files.peek() {
                match (*f).cmp(name.as_str()) {
                    std::cmp::Ordering::Less => {
                        files.next();
                    }
                    std::cmp::Ordering::Equal => {
                        return Err(Error::Corrupted(format!(
                            "'{name}' is both a file and a directory"
                        ))
                        .into());
                    }
                    std::cmp::Ordering::Greater => break,
                }
            }
        }
        Ok(())
    }

    /// Binary-search the sorted file list.
    pub fn lookup_file(&self, name: &str) -> Option<&Checksum> {
        self.files
            .binary_search_by(|f| f.0.as_str().cmp(name))
            .ok()
            .map(|i| &self.files[i].1)
    }

    /// Binary-search the sorted subdirectory list, returning
    /// `(dirtree, dirmeta)` checksums.
    pub fn lookup_subdir(&self, name: &str) -> Option<(&Checksum, &Checksum)> {
        self.subdirs
            .binary_search_by(|d| d.0.as_str().cmp(name))
            .ok()
            .map(|i| (&self.subdirs[i].1, &self.subdirs[i].2))
    }
}

/// The root of a snapshot: points at one dirtree/dirmeta pair and at most
/// one parent commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Open metadata dictionary.
    pub metadata: MetaDict,
    /// Parent commit; `None` for an initial commit.
    pub parent: Option<Checksum>,
    /// Related objects, by name.
    pub related: Vec<(String, Checksum)>,
    /// One-line summary.
    pub subject: String,
    /// Free-form description.
    pub body: String,
    /// Seconds since the epoch, UTC.
    pub timestamp: u64,
    /// The root directory's dirtree.
    pub root_tree: Checksum,
    /// The root directory's dirmeta.
    pub root_meta: Checksum,
}

impl Commit {
    /// Canonical serialized object bytes.
    pub fn to_object_bytes(&self) -> Vec<u8> {
        let mut w = TupleWriter::new();
        w.put_metadata_dict(&self.metadata);
        match &self.parent {
            Some(p) => w.put_bytes(p.as_bytes()),
            None => w.put_bytes(b""),
        }
        w.put_u32(self.related.len() as u32);
        for (name, csum) in &self.related {
            w.put_str(name);
            w.put_bytes(csum.as_bytes());
        }
        w.put_str(&self.subject);
        w.put_str(&self.body);
        w.put_u64(self.timestamp);
        w.put_bytes(self.root_tree.as_bytes());
        w.put_bytes(self.root_meta.as_bytes());
        wrap_metadata(ObjectType::Commit, w.into_bytes())
    }

    fn read_body(r: &mut TupleReader) -> Result<Commit> {
        let metadata = r.read_metadata_dict()?;
        let parent = match r.read_bytes()? {
            b"" => None,
            b => Some(Checksum::from_bytes(b)?),
        };
        let nrelated = r.read_u32()? as usize;
        let mut related = Vec::with_capacity(nrelated.min(4096));
        for _ in 0..nrelated {
            let name = r.read_str()?.to_string();
            let csum = Checksum::from_bytes(r.read_bytes()?)?;
            related.push((name, csum));
        }
        Ok(Commit {
            metadata,
            parent,
            related,
            subject: r.read_str()?.to_string(),
            body: r.read_str()?.to_string(),
            timestamp: r.read_u64()?,
            root_tree: Checksum::from_bytes(r.read_bytes()?)?,
            root_meta: Checksum::from_bytes(r.read_bytes()?)?,
        })
    }
}

/// A decoded metadata object of any kind.
#[derive(Debug, Clone)]
pub enum ObjectPayload {
    /// A `.dirtree` object.
    DirTree(DirTree),
    /// A `.dirmeta` object.
    DirMeta(DirMeta),
    /// A `.commit` object.
    Commit(Commit),
}

fn wrap_metadata(kind: ObjectType, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(kind as u32).to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode a serialized metadata object, dispatching on its kind tag and
/// requiring it to match `expected`.
pub(crate) fn decode_metadata(data: &[u8], expected: ObjectType) -> Result<ObjectPayload> {
    let mut r = TupleReader::new(data);
    let kind = ObjectType::from_u32(r.read_u32()?)?;
    if kind != expected {
        return Err(Error::Corrupted(format!(
            "found object type {kind}, expected {expected}"
        ))
        .into());
    }
    let len = r.read_u32()? as usize;
    let payload = match kind {
        ObjectType::DirTree => ObjectPayload::DirTree(DirTree::read_body(&mut r)?),
        ObjectType::DirMeta => ObjectPayload::DirMeta(DirMeta::read_body(&mut r)?),
        ObjectType::Commit => ObjectPayload::Commit(Commit::read_body(&mut r)?),
        ObjectType::File => {
            return Err(Error::Corrupted("file object is not a metadata object".into()).into());
        }
    };
    r.expect_end()?;
    if data.len() != 8 + len {
        return Err(Error::Corrupted("object length field disagrees with body".into()).into());
    }
    Ok(payload)
}

/// A single path component as stored in a dirtree: non-empty, no `/` or
/// NUL, and neither `.` nor `..`.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidInput(format!("invalid name '{name}'")).into());
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidInput(format!("invalid name '{name}'")).into());
    }
    Ok(())
}

/// Reject modes whose file type is not one of REG|LNK|DIR|CHR|BLK|FIFO.
pub(crate) fn validate_file_mode(mode: u32) -> Result<()> {
    match mode & libc::S_IFMT {
        libc::S_IFREG | libc::S_IFLNK | libc::S_IFDIR | libc::S_IFCHR | libc::S_IFBLK
        | libc::S_IFIFO => Ok(()),
        o => Err(Error::InvalidInput(format!("invalid file type in mode {o:o}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum(fill: u8) -> Checksum {
        Checksum::from_bytes(&[fill; 32]).unwrap()
    }

    #[test]
    fn test_dirmeta_roundtrip() {
        let meta = DirMeta {
            uid: 0,
            gid: 0,
            mode: libc::S_IFDIR | 0o755,
            xattrs: vec![(b"user.test\0".to_vec(), b"value".to_vec())],
        };
        let bytes = meta.to_object_bytes();
        match decode_metadata(&bytes, ObjectType::DirMeta).unwrap() {
            ObjectPayload::DirMeta(m) => assert_eq!(m, meta),
            o => panic!("unexpected payload {o:?}"),
        }
        // Kind tag mismatch is corruption
        assert!(decode_metadata(&bytes, ObjectType::Commit).is_err());
    }

    #[test]
    fn test_dirtree_ordering_enforced() {
        let ok = DirTree {
            files: vec![("a".into(), checksum(1)), ("b".into(), checksum(2))],
            subdirs: vec![("c".into(), checksum(3), checksum(4))],
        };
        ok.validate().unwrap();
        let bytes = ok.to_object_bytes().unwrap();
        match decode_metadata(&bytes, ObjectType::DirTree).unwrap() {
            ObjectPayload::DirTree(t) => {
                assert_eq!(t, ok);
                assert_eq!(t.lookup_file("b"), Some(&checksum(2)));
                assert_eq!(t.lookup_file("c"), None);
                assert_eq!(t.lookup_subdir("c"), Some((&checksum(3), &checksum(4))));
            }
            o => panic!("unexpected payload {o:?}"),
        }

        let misordered = DirTree {
            files: vec![("b".into(), checksum(1)), ("a".into(), checksum(2))],
            subdirs: Vec::new(),
        };
        assert!(misordered.validate().is_err());
        let duplicate = DirTree {
            files: vec![("a".into(), checksum(1)), ("a".into(), checksum(2))],
            subdirs: Vec::new(),
        };
        assert!(duplicate.validate().is_err());
        let overlapping = DirTree {
            files: vec![("a".into(), checksum(1))],
            subdirs: vec![("a".into(), checksum(2), checksum(3))],
        };
        assert!(overlapping.validate().is_err());
        let badname = DirTree {
            files: vec![("..".into(), checksum(1))],
            subdirs: Vec::new(),
        };
        assert!(badname.validate().is_err());
    }

    #[test]
    fn test_commit_roundtrip() {
        let commit = Commit {
            metadata: [("version".to_string(), MetaValue::Str("42".into()))]
                .into_iter()
                .collect(),
            parent: Some(checksum(9)),
            related: vec![("runtime".into(), checksum(7))],
            subject: "Test commit".into(),
            body: "A longer\ndescription".into(),
            timestamp: 1_700_000_000,
            root_tree: checksum(1),
            root_meta: checksum(2),
        };
        let bytes = commit.to_object_bytes();
        match decode_metadata(&bytes, ObjectType::Commit).unwrap() {
            ObjectPayload::Commit(c) => assert_eq!(c, commit),
            o => panic!("unexpected payload {o:?}"),
        }

        // Initial commits store an empty parent
        let initial = Commit {
            parent: None,
            ..commit
        };
        let bytes = initial.to_object_bytes();
        match decode_metadata(&bytes, ObjectType::Commit).unwrap() {
            ObjectPayload::Commit(c) => assert_eq!(c.parent, None),
            o => panic!("unexpected payload {o:?}"),
        }
    }

    #[test]
    fn test_file_header_prefix() {
        let header = FileHeader {
            uid: 1000,
            gid: 1000,
            mode: libc::S_IFREG | 0o644,
            rdev: 0,
            symlink_target: String::new(),
            xattrs: Vec::new(),
        };
        let mut artifact = header.to_bytes();
        artifact.extend_from_slice(b"content follows");
        let (parsed, hlen) = FileHeader::from_bytes_prefix(&artifact).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&artifact[hlen..], b"content follows");

        let mut cursor = std::io::Cursor::new(&artifact);
        let parsed = FileHeader::from_reader(&mut cursor).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(cursor.position() as usize, hlen);
    }

    #[test]
    fn test_validate_name() {
        for bad in ["", ".", "..", "a/b", "a\0b"] {
            assert!(validate_name(bad).is_err(), "{bad:?}");
        }
        validate_name("regular-name").unwrap();
    }
}
