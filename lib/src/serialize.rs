//! The tagged-tuple binary codec used by every serialized metadata object.
//!
//! Integers are stored big-endian.  Byte and string fields carry a 32-bit
//! big-endian length prefix; sequences carry a 32-bit big-endian element
//! count.  Tuples are positional and self-delimiting, so a reader never
//! needs an outer length to parse one.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::Error;

/// Extended attributes of a filesystem entry: `(name, value)` pairs,
/// sorted ascending by name before hashing or storage.
pub type Xattrs = Vec<(Vec<u8>, Vec<u8>)>;

/// The value side of a commit/pack metadata dictionary entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    /// UTF-8 text.
    Str(String),
    /// An unsigned integer.
    U64(u64),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// An open string-keyed metadata dictionary (possibly empty).
pub type MetaDict = BTreeMap<String, MetaValue>;

const TAG_STR: u8 = 0;
const TAG_U64: u8 = 1;
const TAG_BYTES: u8 = 2;

#[derive(Debug, Default)]
pub(crate) struct TupleWriter {
    buf: Vec<u8>,
}

impl TupleWriter {
    pub(crate) fn new() -> TupleWriter {
        Default::default()
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub(crate) fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub(crate) fn put_xattrs(&mut self, xattrs: &Xattrs) {
        self.put_u32(xattrs.len() as u32);
        for (name, value) in xattrs {
            self.put_bytes(name);
            self.put_bytes(value);
        }
    }

    pub(crate) fn put_metadata_dict(&mut self, dict: &MetaDict) {
        self.put_u32(dict.len() as u32);
        for (key, value) in dict {
            self.put_str(key);
            match value {
                MetaValue::Str(s) => {
                    self.put_u8(TAG_STR);
                    self.put_str(s);
                }
                MetaValue::U64(v) => {
                    self.put_u8(TAG_U64);
                    self.put_u64(*v);
                }
                MetaValue::Bytes(b) => {
                    self.put_u8(TAG_BYTES);
                    self.put_bytes(b);
                }
            }
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub(crate) struct TupleReader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn truncated() -> anyhow::Error {
    Error::Corrupted("truncated serialized object".into()).into()
}

impl<'a> TupleReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> TupleReader<'a> {
        TupleReader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let r = self.data.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(r)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    pub(crate) fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub(crate) fn read_str(&mut self) -> Result<&'a str> {
        let b = self.read_bytes()?;
        std::str::from_utf8(b)
            .map_err(|_| Error::Corrupted("invalid UTF-8 in serialized string".into()).into())
    }

    pub(crate) fn read_xattrs(&mut self) -> Result<Xattrs> {
        let n = self.read_u32()? as usize;
        let mut ret = Xattrs::with_capacity(n.min(1024));
        for _ in 0..n {
            let name = self.read_bytes()?.to_vec();
            let value = self.read_bytes()?.to_vec();
            ret.push((name, value));
        }
        Ok(ret)
    }

    pub(crate) fn read_metadata_dict(&mut self) -> Result<MetaDict> {
        let n = self.read_u32()? as usize;
        let mut ret = MetaDict::new();
        for _ in 0..n {
            let key = self.read_str()?.to_string();
            let value = match self.read_u8()? {
                TAG_STR => MetaValue::Str(self.read_str()?.to_string()),
                TAG_U64 => MetaValue::U64(self.read_u64()?),
                TAG_BYTES => MetaValue::Bytes(self.read_bytes()?.to_vec()),
                o => {
                    return Err(
                        Error::Corrupted(format!("unknown metadata value tag {o}")).into()
                    );
                }
            };
            ret.insert(key, value);
        }
        Ok(ret)
    }

    /// All fields consumed; trailing garbage is corruption.
    pub(crate) fn expect_end(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(Error::Corrupted(format!(
                "{} trailing bytes after serialized object",
                self.data.len() - self.pos
            ))
            .into());
        }
        Ok(())
    }
}

/// Serialize xattrs standalone; this byte form is also what the file-object
/// checksum hashes as its metadata tail.
pub(crate) fn xattrs_to_bytes(xattrs: &Xattrs) -> Vec<u8> {
    let mut w = TupleWriter::new();
    w.put_xattrs(xattrs);
    w.into_bytes()
}

/// Sort xattrs ascending by name, byte-wise, as required before hashing
/// regardless of the order the OS returned them.
pub(crate) fn canonicalize_xattrs(mut xattrs: Xattrs) -> Xattrs {
    xattrs.sort_by(|a, b| a.0.cmp(&b.0));
    xattrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = TupleWriter::new();
        w.put_u8(7);
        w.put_u32(0x01020304);
        w.put_u64(u64::MAX - 1);
        w.put_str("hello");
        w.put_bytes(b"");
        let buf = w.into_bytes();
        // Big-endian on disk
        assert_eq!(&buf[1..5], &[1, 2, 3, 4]);
        let mut r = TupleReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0x01020304);
        assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_str().unwrap(), "hello");
        assert_eq!(r.read_bytes().unwrap(), b"");
        r.expect_end().unwrap();
    }

    #[test]
    fn test_truncation_is_corruption() {
        let mut w = TupleWriter::new();
        w.put_str("hello");
        let buf = w.into_bytes();
        let mut r = TupleReader::new(&buf[0..buf.len() - 1]);
        assert!(r.read_str().is_err());
        // A declared length larger than the remaining data must not panic
        let mut r = TupleReader::new(&[0xff, 0xff, 0xff, 0xff, b'x']);
        assert!(r.read_bytes().is_err());
    }

    #[test]
    fn test_metadata_dict_roundtrip() {
        let mut dict = MetaDict::new();
        dict.insert("version".into(), MetaValue::Str("1".into()));
        dict.insert("count".into(), MetaValue::U64(42));
        dict.insert("blob".into(), MetaValue::Bytes(vec![0, 1, 2]));
        let mut w = TupleWriter::new();
        w.put_metadata_dict(&dict);
        let buf = w.into_bytes();
        let mut r = TupleReader::new(&buf);
        assert_eq!(r.read_metadata_dict().unwrap(), dict);
        r.expect_end().unwrap();
    }

    #[test]
    fn test_xattrs_canonical_order() {
        let xattrs = vec![
            (b"user.b".to_vec(), b"2".to_vec()),
            (b"user.a".to_vec(), b"1".to_vec()),
        ];
        let canonical = canonicalize_xattrs(xattrs);
        assert_eq!(canonical[0].0, b"user.a");
        let bytes = xattrs_to_bytes(&canonical);
        let mut r = TupleReader::new(&bytes);
        assert_eq!(r.read_xattrs().unwrap(), canonical);
    }
}
