//! SHA-256 checksums and the canonical object naming derived from them.

use std::fmt;
use std::io::Read;

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use openssl::hash::{Hasher, MessageDigest};

use crate::Error;
use crate::objects::FileHeader;
use crate::serialize;

/// The hex form of `sha256("")`, used by legacy encodings as a
/// placeholder meaning "no extended attributes".
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// The kinds of object we store.  The numeric values are the on-disk
/// kind tags of serialized metadata objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum ObjectType {
    /// Content and metadata of one non-directory filesystem entry.
    File = 1,
    /// A directory's children, sorted.
    DirTree = 2,
    /// A directory's own metadata (no children).
    DirMeta = 3,
    /// The root of a snapshot.
    Commit = 4,
}

impl ObjectType {
    /// The file extension used for loose objects of this type.
    pub fn extension(&self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirTree => "dirtree",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::Commit => "commit",
        }
    }

    /// Inverse of [`Self::extension`].
    pub fn from_extension(ext: &str) -> Option<ObjectType> {
        Some(match ext {
            "file" => ObjectType::File,
            "dirtree" => ObjectType::DirTree,
            "dirmeta" => ObjectType::DirMeta,
            "commit" => ObjectType::Commit,
            _ => return None,
        })
    }

    pub(crate) fn from_u32(v: u32) -> Result<ObjectType> {
        Ok(match v {
            1 => ObjectType::File,
            2 => ObjectType::DirTree,
            3 => ObjectType::DirMeta,
            4 => ObjectType::Commit,
            o => return Err(Error::Corrupted(format!("invalid object type {o}")).into()),
        })
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A SHA-256 checksum; the identity of every object in a repository.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Parse the canonical textual form: exactly 64 lowercase hex characters.
    pub fn from_hex(s: &str) -> Result<Checksum> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidChecksum(s.to_string()).into());
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf).expect("validated hex");
        Ok(Checksum(buf))
    }

    /// Construct from raw bytes; must be exactly 32 bytes.
    pub fn from_bytes(b: &[u8]) -> Result<Checksum> {
        let buf: [u8; 32] = b
            .try_into()
            .map_err(|_| Error::InvalidChecksum(hex::encode(b)))?;
        Ok(Checksum(buf))
    }

    /// The canonical textual form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

/// The repository-relative path of a loose object, `objects/<aa>/<rest>.<ext>`.
pub fn loose_object_path(checksum: &Checksum, objtype: ObjectType) -> Utf8PathBuf {
    let hex = checksum.to_hex();
    format!("objects/{}/{}.{}", &hex[0..2], &hex[2..], objtype.extension()).into()
}

/// Reassemble a checksum from the two-level loose layout, validating shape.
/// Returns `None` for names that are not `<62 hex>.<known extension>`.
pub(crate) fn parse_loose_name(parent: &str, name: &str) -> Option<(Checksum, ObjectType)> {
    if !(parent.is_ascii() && parent.len() == 2) {
        return None;
    }
    let (stem, ext) = name.rsplit_once('.')?;
    let objtype = ObjectType::from_extension(ext)?;
    if stem.len() != 62 {
        return None;
    }
    let checksum = Checksum::from_hex(&format!("{parent}{stem}")).ok()?;
    Some((checksum, objtype))
}

pub(crate) struct Sha256 {
    hasher: Hasher,
}

impl Sha256 {
    pub(crate) fn new() -> Result<Sha256> {
        let hasher = Hasher::new(MessageDigest::sha256()).context("Allocating hasher")?;
        Ok(Sha256 { hasher })
    }

    pub(crate) fn update(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data).context("Hashing")?;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<Checksum> {
        let digest = self.hasher.finish().context("Finishing hash")?;
        Checksum::from_bytes(&digest)
    }
}

/// SHA-256 of a byte slice.
pub(crate) fn sha256_of(data: &[u8]) -> Result<Checksum> {
    let mut h = Sha256::new()?;
    h.update(data)?;
    h.finish()
}

/// Feed the content portion of a file object into `h`: the raw bytes for
/// regular files, the target for symlinks, the big-endian rdev for devices,
/// and nothing for FIFOs.
fn update_content_portion(
    h: &mut Sha256,
    header: &FileHeader,
    content: Option<&mut dyn Read>,
) -> Result<u64> {
    let fmt = header.mode & libc::S_IFMT;
    let mut total = 0u64;
    match fmt {
        libc::S_IFREG => {
            let content =
                content.ok_or_else(|| anyhow!("Regular file object requires content"))?;
            let mut buf = [0u8; 8192];
            loop {
                let n = content.read(&mut buf).context("Reading content")?;
                if n == 0 {
                    break;
                }
                h.update(&buf[0..n])?;
                total += n as u64;
            }
        }
        libc::S_IFLNK => h.update(header.symlink_target.as_bytes())?,
        libc::S_IFCHR | libc::S_IFBLK => h.update(&header.rdev.to_be_bytes())?,
        libc::S_IFIFO => (),
        o => {
            return Err(Error::InvalidInput(format!("unsupported file mode {o:o}")).into());
        }
    }
    Ok(total)
}

/// Compute the checksum of a file object from its header and (for regular
/// files) its content stream: content portion first, then big-endian uid,
/// gid, permission bits, then the serialized xattrs.
pub(crate) fn checksum_file_object(
    header: &FileHeader,
    content: Option<&mut dyn Read>,
) -> Result<Checksum> {
    let mut h = Sha256::new()?;
    update_content_portion(&mut h, header, content)?;
    h.update(&header.uid.to_be_bytes())?;
    h.update(&header.gid.to_be_bytes())?;
    h.update(&(header.mode & !libc::S_IFMT).to_be_bytes())?;
    h.update(&serialize::xattrs_to_bytes(&header.xattrs))?;
    h.finish()
}

/// The meta-less "archived content" variant; fsck uses it to tell an
/// object keyed by content alone apart from real corruption.  Never
/// reachable from the ingest path.
pub(crate) fn checksum_file_content_only(
    header: &FileHeader,
    content: Option<&mut dyn Read>,
) -> Result<Checksum> {
    let mut h = Sha256::new()?;
    update_content_portion(&mut h, header, content)?;
    h.finish()
}

/// Like [`checksum_file_object`], but hashing the raw [`EMPTY_SHA256`]
/// digest where legacy writers put it as the "no xattrs" placeholder
/// instead of the serialized empty sequence.  Only used to recognize
/// such keys during fsck.
pub(crate) fn checksum_file_object_legacy_xattrs(
    header: &FileHeader,
    content: Option<&mut dyn Read>,
) -> Result<Checksum> {
    let mut h = Sha256::new()?;
    update_content_portion(&mut h, header, content)?;
    h.update(&header.uid.to_be_bytes())?;
    h.update(&header.gid.to_be_bytes())?;
    h.update(&(header.mode & !libc::S_IFMT).to_be_bytes())?;
    h.update(Checksum::from_hex(EMPTY_SHA256)?.as_bytes())?;
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_checksum_string() {
        let valid = "41af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372e3";
        assert!(Checksum::from_hex(valid).is_ok());
        // Wrong lengths
        assert!(Checksum::from_hex(&valid[0..63]).is_err());
        assert!(Checksum::from_hex(&format!("{valid}0")).is_err());
        // Mixed case and non-hex are rejected
        assert!(Checksum::from_hex(&valid.to_uppercase()).is_err());
        assert!(
            Checksum::from_hex("41af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372ez")
                .is_err()
        );
        assert!(Checksum::from_hex("").is_err());
    }

    #[test]
    fn test_hex_roundtrip() {
        let hex = "41af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372e3";
        let c = Checksum::from_hex(hex).unwrap();
        assert_eq!(c.to_hex(), hex);
        assert_eq!(Checksum::from_bytes(c.as_bytes()).unwrap(), c);
    }

    #[test]
    fn test_empty_sha256() {
        assert_eq!(sha256_of(b"").unwrap().to_hex(), EMPTY_SHA256);
    }

    #[test]
    fn test_loose_path() {
        let c = Checksum::from_hex(
            "41af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372e3",
        )
        .unwrap();
        let p = loose_object_path(&c, ObjectType::DirTree);
        assert_eq!(
            p,
            "objects/41/af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372e3.dirtree"
        );
        let (c2, t) = parse_loose_name(
            "41",
            "af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372e3.dirtree",
        )
        .unwrap();
        assert_eq!(c2, c);
        assert_eq!(t, ObjectType::DirTree);
        // Foreign files are skipped, not errors
        assert!(parse_loose_name("41", "README").is_none());
        assert!(parse_loose_name("tmp", "af.file").is_none());
    }

    #[test]
    fn test_file_object_checksum_symlink() {
        let header = FileHeader {
            uid: 0,
            gid: 0,
            mode: libc::S_IFLNK | 0o777,
            rdev: 0,
            symlink_target: "target".into(),
            xattrs: Vec::new(),
        };
        let a = checksum_file_object(&header, None).unwrap();
        let mut other = header.clone();
        other.symlink_target = "target2".into();
        let b = checksum_file_object(&other, None).unwrap();
        assert_ne!(a, b);
        // The content-only variant ignores ownership
        let mut chowned = header.clone();
        chowned.uid = 1000;
        assert_ne!(checksum_file_object(&chowned, None).unwrap(), a);
        assert_eq!(
            checksum_file_content_only(&chowned, None).unwrap(),
            checksum_file_content_only(&header, None).unwrap()
        );
    }

    #[test]
    fn test_legacy_empty_xattrs_placeholder_differs() {
        let header = FileHeader {
            uid: 0,
            gid: 0,
            mode: libc::S_IFLNK | 0o777,
            rdev: 0,
            symlink_target: "t".into(),
            xattrs: Vec::new(),
        };
        // The placeholder digest is 32 bytes where the modern form stores a
        // zero-length serialized sequence, so the keys never collide.
        let modern = checksum_file_object(&header, None).unwrap();
        let legacy = checksum_file_object_legacy_xattrs(&header, None).unwrap();
        assert_ne!(modern, legacy);
    }
}
