//! Packing of loose objects into indexed pack files.
//!
//! A pack is `objects/pack/ostpack-<hash>.data` plus a sibling `.index`,
//! where `<hash>` is the SHA-256 of the data file's contents.  Entries are
//! aligned, individually length-prefixed, and optionally gzipped; the index
//! is sorted by `(checksum, objtype)` for binary search.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::checksum::{Checksum, ObjectType, Sha256};
use crate::repo::{Repo, RepoMode};
use crate::serialize::{MetaDict, TupleReader, TupleWriter};
use crate::{Error, check_cancelled};

pub(crate) const PACK_DATA_TAG: &str = "OSTv0PACKFILE";
pub(crate) const PACK_INDEX_TAG: &str = "OSTv0PACKINDEX";

const FLAG_GZIP: u8 = 1 << 0;
const DEFAULT_PACK_SIZE: u64 = 50 * 1024 * 1024;

/// Per-entry compression inside pack data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackCompression {
    /// Gzip each entry payload.
    #[default]
    Gzip,
    /// Store payloads verbatim.
    None,
}

impl std::str::FromStr for PackCompression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<PackCompression> {
        match s {
            "gzip" => Ok(PackCompression::Gzip),
            "none" => Ok(PackCompression::None),
            o => Err(Error::InvalidInput(format!("invalid compression '{o}'")).into()),
        }
    }
}

/// Options for [`repack`].
#[derive(Debug, Clone)]
pub struct RepackOptions {
    /// Maximum total uncompressed payload bytes per pack.
    pub pack_size: u64,
    /// Per-entry compression.
    pub compression: PackCompression,
    /// Unlink the loose copy of each packed object after the pack lands.
    pub delete_loose: bool,
}

impl Default for RepackOptions {
    fn default() -> Self {
        RepackOptions {
            pack_size: DEFAULT_PACK_SIZE,
            compression: PackCompression::Gzip,
            delete_loose: true,
        }
    }
}

/// What [`repack`] did.
#[derive(Debug, Default, Clone, Copy)]
pub struct RepackStats {
    /// Number of packs written.
    pub n_packs: u32,
    /// Number of objects moved into packs.
    pub n_objects: u64,
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    pos: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Result<Self> {
        Ok(HashingWriter {
            inner,
            hasher: Sha256::new()?,
            pos: 0,
        })
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher
            .update(&buf[0..n])
            .map_err(std::io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn write_padding(w: &mut impl Write, pos: u64, align: u64) -> Result<u64> {
    let rem = pos % align;
    if rem == 0 {
        return Ok(pos);
    }
    let pad = (align - rem) as usize;
    w.write_all(&[0u8; 8][0..pad])?;
    Ok(pos + pad as u64)
}

fn pack_stem_from_name(name: &str, suffix: &str) -> Option<String> {
    let stem = name.strip_prefix("ostpack-")?.strip_suffix(suffix)?;
    Checksum::from_hex(stem).ok()?;
    Some(stem.to_string())
}

/// Consolidate loose file objects into packs, clustering by size under
/// `opts.pack_size` and writing members in ascending size order.
#[context("Repacking")]
pub fn repack(
    repo: &Repo,
    opts: &RepackOptions,
    cancellable: Option<&CancellationToken>,
) -> Result<RepackStats> {
    let mut candidates = Vec::new();
    for (checksum, objtype) in repo.iter_loose_objects()? {
        if objtype != ObjectType::File {
            continue;
        }
        let size = repo.loose_object_size(objtype, &checksum)?;
        candidates.push((size, checksum));
    }
    candidates.sort();

    let mut stats = RepackStats::default();
    let mut cluster: Vec<(u64, Checksum)> = Vec::new();
    let mut cluster_size = 0u64;
    for (size, checksum) in candidates {
        if !cluster.is_empty() && cluster_size + size > opts.pack_size {
            check_cancelled(cancellable)?;
            write_pack(repo, &cluster, opts, cancellable)?;
            stats.n_packs += 1;
            stats.n_objects += cluster.len() as u64;
            cluster.clear();
            cluster_size = 0;
        }
        cluster_size += size;
        cluster.push((size, checksum));
    }
    if !cluster.is_empty() {
        write_pack(repo, &cluster, opts, cancellable)?;
        stats.n_packs += 1;
        stats.n_objects += cluster.len() as u64;
    }
    tracing::debug!(
        "repacked {} objects into {} packs",
        stats.n_objects,
        stats.n_packs
    );
    Ok(stats)
}

/// The uniform pack payload for a file object: the archive-mode artifact
/// (length-prefixed header, then raw content).
fn file_object_payload(repo: &Repo, checksum: &Checksum) -> Result<Vec<u8>> {
    match repo.mode() {
        RepoMode::Archive => {
            let path = crate::checksum::loose_object_path(checksum, ObjectType::File);
            let mut buf = Vec::new();
            repo.dir()
                .open(path.as_std_path())?
                .read_to_end(&mut buf)?;
            Ok(buf)
        }
        RepoMode::Bare => {
            let mut obj = repo.open_file_object(checksum)?;
            let mut buf = obj.header.to_bytes();
            if let Some(content) = obj.content.as_mut() {
                content.read_to_end(&mut buf)?;
            }
            Ok(buf)
        }
    }
}

fn write_pack(
    repo: &Repo,
    cluster: &[(u64, Checksum)],
    opts: &RepackOptions,
    cancellable: Option<&CancellationToken>,
) -> Result<()> {
    let tmpname: Utf8PathBuf = format!("tmp/pack-{}", uuid::Uuid::new_v4().simple()).into();
    let r = (|| {
        let f = repo.dir().create(tmpname.as_std_path())?;
        let mut w = HashingWriter::new(std::io::BufWriter::new(f))?;

        let mut header = TupleWriter::new();
        header.put_str(PACK_DATA_TAG);
        header.put_metadata_dict(&MetaDict::new());
        header.put_u64(cluster.len() as u64);
        let header = header.into_bytes();
        w.write_all(&(header.len() as u32).to_be_bytes())?;
        w.write_all(&header)?;

        let mut index_entries: Vec<(Checksum, u32, u64)> = Vec::with_capacity(cluster.len());
        for (_, checksum) in cluster {
            check_cancelled(cancellable)?;
            let payload = file_object_payload(repo, checksum)?;
            let (payload, flags) = match opts.compression {
                PackCompression::Gzip => {
                    let mut enc = flate2::write::GzEncoder::new(
                        Vec::new(),
                        flate2::Compression::default(),
                    );
                    enc.write_all(&payload)?;
                    (enc.finish()?, FLAG_GZIP)
                }
                PackCompression::None => (payload, 0),
            };
            let mut body = TupleWriter::new();
            body.put_u32(ObjectType::File as u32);
            body.put_u8(flags);
            body.put_bytes(checksum.as_bytes());
            body.put_bytes(&payload);
            let body = body.into_bytes();

            let pos = w.pos;
            let pos = write_padding(&mut w, pos, 4)?;
            w.write_all(&(body.len() as u32).to_be_bytes())?;
            let pos = write_padding(&mut w, pos + 4, 8)?;
            index_entries.push((*checksum, ObjectType::File as u32, pos));
            w.write_all(&body)?;
        }
        w.flush()?;
        let HashingWriter { hasher, inner, .. } = w;
        drop(inner);
        let pack_checksum = hasher.finish()?;

        repo.dir().create_dir_all("objects/pack")?;
        let stem = pack_checksum.to_hex();
        let data_path = format!("objects/pack/ostpack-{stem}.data");
        repo.dir()
            .rename(tmpname.as_std_path(), repo.dir(), &data_path)?;

        // Index second: a reader that sees the index can open the data.
        index_entries.sort();
        let mut index = TupleWriter::new();
        index.put_str(PACK_INDEX_TAG);
        index.put_metadata_dict(&MetaDict::new());
        index.put_u32(index_entries.len() as u32);
        for (checksum, objtype, offset) in &index_entries {
            index.put_u32(*objtype);
            index.put_bytes(checksum.as_bytes());
            index.put_u64(*offset);
        }
        let index = index.into_bytes();
        let mut file = Vec::with_capacity(4 + index.len());
        file.extend_from_slice(&(index.len() as u32).to_be_bytes());
        file.extend_from_slice(&index);
        repo.dir()
            .atomic_write(format!("objects/pack/ostpack-{stem}.index"), &file)?;

        if opts.delete_loose {
            for (_, checksum) in cluster {
                repo.delete_loose_object(ObjectType::File, checksum)?;
            }
        }
        Ok(())
    })();
    if r.is_err() {
        if let Err(e) = repo.dir().remove_file(tmpname.as_std_path()) {
            tracing::debug!("Failed to unlink {tmpname}: {e}");
        }
    }
    r
}

/// A parsed pack index.
#[derive(Debug)]
pub(crate) struct PackIndex {
    pub(crate) entries: Vec<(Checksum, u32, u64)>,
}

impl PackIndex {
    /// Binary search by `(checksum, objtype)`; objtype tie-breaks as u32.
    pub(crate) fn search(&self, checksum: &Checksum, objtype: ObjectType) -> Option<u64> {
        self.entries
            .binary_search_by(|(c, t, _)| (c, *t).cmp(&(checksum, objtype as u32)))
            .ok()
            .map(|i| self.entries[i].2)
    }
}

/// Enumerate the hash stems of every pack in the repository.
pub(crate) fn list_pack_indexes(repo: &Repo) -> Result<Vec<String>> {
    let Some(packdir) = repo.dir().open_dir_optional("objects/pack")? else {
        return Ok(Vec::new());
    };
    let mut ret = Vec::new();
    for entry in packdir.entries()? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(stem) = pack_stem_from_name(name, ".index") {
            ret.push(stem);
        }
    }
    ret.sort();
    Ok(ret)
}

/// Load and parse one pack index by hash stem.
#[context("Loading pack index {stem}")]
pub(crate) fn load_pack_index(repo: &Repo, stem: &str) -> Result<PackIndex> {
    let path = format!("objects/pack/ostpack-{stem}.index");
    let data = repo.dir().read(&path)?;
    let mut r = TupleReader::new(&data);
    let len = r.read_u32()? as usize;
    if data.len() != 4 + len {
        return Err(Error::Corrupted(format!("bad pack index length in {path}")).into());
    }
    let tag = r.read_str()?;
    if tag != PACK_INDEX_TAG {
        return Err(Error::Corrupted(format!("bad pack index tag '{tag}'")).into());
    }
    let _meta = r.read_metadata_dict()?;
    let n = r.read_u32()? as usize;
    let mut entries = Vec::with_capacity(n.min(65536));
    for _ in 0..n {
        let objtype = r.read_u32()?;
        let checksum = Checksum::from_bytes(r.read_bytes()?)?;
        let offset = r.read_u64()?;
        entries.push((checksum, objtype, offset));
    }
    r.expect_end()?;
    Ok(PackIndex { entries })
}

fn read_field_u32(f: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Fetch one entry's decompressed payload from a pack data file.  The
/// offset must come from the pack's index.
pub(crate) fn read_pack_entry(
    repo: &Repo,
    stem: &str,
    offset: u64,
) -> Result<(ObjectType, Checksum, Vec<u8>)> {
    let path = format!("objects/pack/ostpack-{stem}.data");
    let f = repo
        .dir()
        .open(&path)
        .with_context(|| format!("Opening pack {path}"))?;
    let mut f = f.into_std();
    f.seek(SeekFrom::Start(offset))?;
    let objtype = ObjectType::from_u32(read_field_u32(&mut f)?)?;
    let mut flags = [0u8; 1];
    f.read_exact(&mut flags)?;
    let csumlen = read_field_u32(&mut f)? as usize;
    if csumlen != 32 {
        return Err(Error::Corrupted(format!("bad pack entry in {path}")).into());
    }
    let mut csum = [0u8; 32];
    f.read_exact(&mut csum)?;
    let checksum = Checksum::from_bytes(&csum)?;
    let payload_len = read_field_u32(&mut f)? as usize;
    let mut payload = vec![0u8; payload_len];
    f.read_exact(&mut payload)?;
    let payload = if flags[0] & FLAG_GZIP != 0 {
        let mut dec = flate2::read::GzDecoder::new(&payload[..]);
        let mut out = Vec::new();
        dec.read_to_end(&mut out)
            .with_context(|| format!("Decompressing pack entry in {path}"))?;
        out
    } else {
        payload
    };
    Ok((objtype, checksum, payload))
}

/// Search every pack index for an object, returning its decompressed
/// payload.  Each index is independently complete for its pack, so the
/// resolution order does not matter.
pub(crate) fn find_in_packs(
    repo: &Repo,
    objtype: ObjectType,
    checksum: &Checksum,
) -> Result<Option<Vec<u8>>> {
    for stem in list_pack_indexes(repo)? {
        let index = load_pack_index(repo, &stem)?;
        if let Some(offset) = index.search(checksum, objtype) {
            let (t, c, payload) = read_pack_entry(repo, &stem, offset)?;
            if t != objtype || c != *checksum {
                return Err(Error::Corrupted(format!(
                    "pack {stem} entry at {offset} does not match its index"
                ))
                .into());
            }
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

/// Validate a pack: index tag/order/uniqueness and the data file's hash
/// against the name stem.  Returns human-readable problems.
pub(crate) fn fsck_pack(repo: &Repo, stem: &str) -> Result<Vec<String>> {
    let mut errors = Vec::new();
    let index = match load_pack_index(repo, stem) {
        Ok(i) => i,
        Err(e) => return Ok(vec![format!("corrupted pack index '{stem}': {e:#}")]),
    };
    for w in index.entries.windows(2) {
        if (w[0].0, w[0].1) >= (w[1].0, w[1].1) {
            errors.push(format!("misordered pack index '{stem}'"));
            break;
        }
    }
    let path = format!("objects/pack/ostpack-{stem}.data");
    let f = repo
        .dir()
        .open(&path)
        .with_context(|| format!("Opening pack {path}"))?;
    let mut f = f.into_std();
    let mut hasher = Sha256::new()?;
    let mut buf = [0u8; 8192];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[0..n])?;
    }
    let actual = hasher.finish()?.to_hex();
    if actual != stem {
        errors.push(format!(
            "corrupted pack '{stem}', actual checksum is {actual}"
        ));
    }
    Ok(errors)
}
