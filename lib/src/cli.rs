//! # Commandline parsing
//!
//! The CLI surface is exported from the library so other tools can embed
//! it; the `otrepo` binary is a thin wrapper over [`run_from_iter`].

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::checkout::checkout;
use crate::fsck::{FsckOptions, fsck};
use crate::ingest::{CommitOptions, commit_directory};
use crate::pack::{RepackOptions, repack};
use crate::pull::pull;
use crate::repo::Repo;
use crate::tar::commit_tar;
use crate::vfs::{CommitFile, FileType, read_commit};

/// Parse a byte count that may be suffixed with `k`, `m`, or `g`.
fn parse_size(s: &str) -> Result<u64, String> {
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&s[..s.len() - 1], 10),
        Some(b'm') | Some(b'M') => (&s[..s.len() - 1], 20),
        Some(b'g') | Some(b'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: u64 = digits.parse().map_err(|e| format!("parsing '{s}': {e}"))?;
    n.checked_shl(shift)
        .ok_or_else(|| format!("size '{s}' is out of range"))
}

#[derive(Debug, Parser)]
#[clap(name = "otrepo", version)]
/// Content-addressed object store for filesystem trees.
pub(crate) struct Opt {
    /// Path to the repository
    #[clap(long, global = true, default_value = ".")]
    repo: Utf8PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Cmd {
    /// Initialize a new repository
    Init {
        /// Storage mode: bare or archive
        #[clap(long, default_value = "bare")]
        mode: String,
    },
    /// Import a directory or tar archive and update a branch
    Commit {
        /// Branch to update
        #[clap(long)]
        branch: String,
        /// One-line summary
        #[clap(long, short = 's')]
        subject: String,
        /// Full description
        #[clap(long, default_value = "")]
        body: String,
        /// Directory tree or tar archive to import
        path: Utf8PathBuf,
    },
    /// Stream one file's content to stdout
    Cat {
        /// Revision to read from
        rev: String,
        /// Path inside the snapshot
        path: String,
    },
    /// List file paths
    Ls {
        /// Print directories recursively
        #[clap(long, short = 'R')]
        recursive: bool,
        /// Print checksums
        #[clap(long, short = 'C')]
        checksum: bool,
        /// Print extended attributes
        #[clap(long, short = 'X')]
        xattrs: bool,
        /// Print only filenames, NUL separated
        #[clap(long)]
        nul_filenames_only: bool,
        /// Revision to list
        rev: String,
        /// Paths inside the snapshot
        #[clap(required = true)]
        paths: Vec<String>,
    },
    /// Check out a commit; the destination must not exist
    Checkout {
        /// Revision to materialize
        rev: String,
        /// Destination directory
        destination: Utf8PathBuf,
    },
    /// Check the repository for consistency
    Fsck {
        /// Remove corrupted objects
        #[clap(long)]
        delete: bool,
        /// Don't display informational messages
        #[clap(long, short = 'q')]
        quiet: bool,
    },
    /// Print the checksum a rev resolves to
    RevParse {
        /// Revision to resolve
        rev: String,
    },
    /// Fetch objects from a configured remote and update the tracking ref
    Pull {
        /// Remote name from the repository config
        remote: String,
        /// Branch to fetch
        branch: String,
    },
    /// Consolidate loose objects into packs
    Repack {
        /// Maximum uncompressed pack size; may be suffixed with k, m, or g
        #[clap(long, value_parser = parse_size)]
        pack_size: Option<u64>,
        /// Per-entry compression: gzip or none
        #[clap(long, default_value = "gzip")]
        internal_compression: String,
        /// Keep the loose copies of packed objects
        #[clap(long)]
        keep_loose: bool,
    },
}

fn format_xattrs(info: &crate::vfs::FileInfo) -> String {
    let mut buf = String::from("{ ");
    for (name, value) in &info.xattrs {
        buf.push_str(&format!(
            "{}={} ",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(value)
        ));
    }
    buf.push_str("} ");
    buf
}

fn print_one_file(
    node: &CommitFile,
    opt_checksum: bool,
    opt_xattrs: bool,
    nul_only: bool,
    out: &mut impl Write,
) -> Result<()> {
    let path = node.path();
    if nul_only {
        out.write_all(path.as_str().as_bytes())?;
        out.write_all(b"\0")?;
        return Ok(());
    }
    let info = node.query_info()?;
    let type_c = match info.file_type {
        FileType::Regular => '-',
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::CharDevice => 'c',
        FileType::BlockDevice => 'b',
        FileType::Fifo => 'p',
    };
    let mut buf = format!(
        "{type_c}0{:04o} {} {} {:6} ",
        info.mode & !libc::S_IFMT,
        info.uid,
        info.gid,
        info.size
    );
    if opt_checksum {
        if let Some((tree, meta)) = node.tree_checksums()? {
            buf.push_str(&format!("{tree} {meta} "));
        } else if let Some(c) = node.file_checksum()? {
            buf.push_str(&format!("{c} "));
        }
    }
    if opt_xattrs {
        buf.push_str(&format_xattrs(&info));
    }
    buf.push_str(path.as_str());
    if info.file_type == FileType::Symlink {
        buf.push_str(&format!(" -> {}", info.symlink_target));
    }
    writeln!(out, "{buf}")?;
    Ok(())
}

fn print_directory_recurse(
    node: &CommitFile,
    opt_checksum: bool,
    opt_xattrs: bool,
    nul_only: bool,
    out: &mut impl Write,
) -> Result<()> {
    for child in node.enumerate_children()? {
        print_one_file(&child, opt_checksum, opt_xattrs, nul_only, out)?;
        if child.is_dir()? {
            print_directory_recurse(&child, opt_checksum, opt_xattrs, nul_only, out)?;
        }
    }
    Ok(())
}

/// Parse a command from the given argument iterator and run it.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    match opt.cmd {
        Cmd::Init { mode } => {
            Repo::create(&opt.repo, mode.parse()?)?;
            Ok(())
        }
        Cmd::Commit {
            branch,
            subject,
            body,
            path,
        } => {
            let repo = Repo::open(&opt.repo)?;
            let copts = CommitOptions {
                branch,
                subject,
                body,
                ..Default::default()
            };
            let meta = std::fs::symlink_metadata(path.as_std_path())
                .with_context(|| format!("Examining {path}"))?;
            let commit = if meta.is_dir() {
                commit_directory(&repo, &path, &copts, None)?
            } else {
                let f = std::fs::File::open(path.as_std_path())
                    .with_context(|| format!("Opening {path}"))?;
                commit_tar(&repo, std::io::BufReader::new(f), &copts, None)?
            };
            println!("{commit}");
            Ok(())
        }
        Cmd::Cat { rev, path } => {
            let repo = Arc::new(Repo::open(&opt.repo)?);
            let root = read_commit(&repo, &rev)?;
            let mut content = root.resolve_relative_path(&path).read()?;
            let stdout = std::io::stdout();
            let mut stdout = stdout.lock();
            std::io::copy(&mut content, &mut stdout)?;
            stdout.flush()?;
            Ok(())
        }
        Cmd::Ls {
            recursive,
            checksum,
            xattrs,
            nul_filenames_only,
            rev,
            paths,
        } => {
            let repo = Arc::new(Repo::open(&opt.repo)?);
            let root = read_commit(&repo, &rev)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for path in paths {
                let node = root.resolve_relative_path(&path);
                node.ensure_resolved()?;
                print_one_file(&node, checksum, xattrs, nul_filenames_only, &mut out)?;
                if recursive && node.is_dir()? {
                    print_directory_recurse(&node, checksum, xattrs, nul_filenames_only, &mut out)?;
                }
            }
            out.flush()?;
            Ok(())
        }
        Cmd::Checkout { rev, destination } => {
            let repo = Arc::new(Repo::open(&opt.repo)?);
            checkout(&repo, &rev, &destination, None)
        }
        Cmd::Fsck { delete, quiet } => {
            let repo = Repo::open(&opt.repo)?;
            let result = fsck(&repo, &FsckOptions { delete }, None)?;
            for e in &result.errors {
                eprintln!("ERROR: {e}");
            }
            if !quiet {
                println!("Total Objects: {}", result.n_objects);
                println!("Total Packs: {}", result.n_packs);
            }
            if !result.is_ok() {
                return Err(anyhow!("Encountered filesystem consistency errors"));
            }
            Ok(())
        }
        Cmd::RevParse { rev } => {
            let repo = Repo::open(&opt.repo)?;
            let resolved = repo
                .resolve_rev(&rev, false)?
                .expect("resolved without allow_noent");
            println!("{resolved}");
            Ok(())
        }
        Cmd::Pull { remote, branch } => {
            let repo = Repo::open(&opt.repo)?;
            let commit = pull(&repo, &remote, &branch, None)?;
            println!("{commit}");
            Ok(())
        }
        Cmd::Repack {
            pack_size,
            internal_compression,
            keep_loose,
        } => {
            let repo = Repo::open(&opt.repo)?;
            let mut ropts = RepackOptions {
                compression: internal_compression.parse()?,
                delete_loose: !keep_loose,
                ..Default::default()
            };
            if let Some(size) = pack_size {
                ropts.pack_size = size;
            }
            let stats = repack(&repo, &ropts, None)?;
            println!("Packed {} objects into {} packs", stats.n_objects, stats.n_packs);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("50M").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("x").is_err());
    }

    #[test]
    fn test_cli_parses() {
        Opt::try_parse_from(["otrepo", "init", "--mode=archive"]).unwrap();
        Opt::try_parse_from([
            "otrepo",
            "--repo=/srv/repo",
            "commit",
            "--branch=main",
            "-s",
            "Initial",
            "/some/tree",
        ])
        .unwrap();
        Opt::try_parse_from(["otrepo", "ls", "-RC", "main", "/"]).unwrap();
        Opt::try_parse_from(["otrepo", "repack", "--pack-size=64k"]).unwrap();
        // ls requires at least one path
        assert!(Opt::try_parse_from(["otrepo", "ls", "main"]).is_err());
    }
}
