//! Named mutable pointers into the immutable object graph.
//!
//! A ref is a text file under `refs/heads/<name>` or
//! `refs/remotes/<remote>/<name>` holding one 64-hex checksum, or a
//! symbolic pointer line `ref: <relpath>` which is chased on read.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::Error;
use crate::checksum::Checksum;
use crate::repo::Repo;

fn parse_rev_file(repo: &Repo, path: &Utf8Path, allow_noent: bool) -> Result<Option<Checksum>> {
    let contents = match repo.dir().read_to_string(path.as_std_path()) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if allow_noent {
                return Ok(None);
            }
            return Err(Error::NotFound(format!("Couldn't open ref '{path}'")).into());
        }
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("Couldn't open ref '{path}'")));
        }
    };
    let contents = contents.trim_end();
    if let Some(target) = contents.strip_prefix("ref: ") {
        return parse_rev_file(repo, &Utf8Path::new("refs/heads").join(target), allow_noent);
    }
    let checksum = Checksum::from_hex(contents)
        .with_context(|| format!("Invalid ref contents in '{path}'"))?;
    Ok(Some(checksum))
}

impl Repo {
    /// Resolve a revision string to a commit checksum.
    ///
    /// Accepted forms: a 64-hex literal, a branch name (`refs/heads/<rev>`),
    /// `<remote>/<branch>` (`refs/remotes/<rev>`), and any of those followed
    /// by `^` for the commit's parent.  With `allow_noent`, a missing ref
    /// resolves to `None` rather than an error.
    #[context("Resolving rev {rev}")]
    pub fn resolve_rev(&self, rev: &str, allow_noent: bool) -> Result<Option<Checksum>> {
        if rev.is_empty() {
            return Err(Error::InvalidInput("empty rev".into()).into());
        }
        if rev.contains("..") {
            return Err(Error::InvalidInput(format!("invalid rev '{rev}'")).into());
        }
        if rev.len() == 64 {
            return Ok(Some(Checksum::from_hex(rev)?));
        }
        if let Some(base) = rev.strip_suffix('^') {
            let Some(resolved) = self.resolve_rev(base, allow_noent)? else {
                return Ok(None);
            };
            let commit = self.load_commit(&resolved)?;
            return match commit.parent {
                Some(parent) => Ok(Some(parent)),
                None => Err(Error::NotFound(format!("Commit {resolved} has no parent")).into()),
            };
        }
        let path = match rev.split_once('/') {
            None => Utf8Path::new("refs/heads").join(rev),
            Some((remote, branch))
                if !remote.is_empty() && !branch.is_empty() && !branch.contains('/') =>
            {
                Utf8Path::new("refs/remotes").join(rev)
            }
            Some(_) => {
                return Err(Error::InvalidInput(format!("invalid rev '{rev}'")).into());
            }
        };
        parse_rev_file(self, &path, allow_noent)
    }

    /// Create or update a ref to point at `checksum`.  Local branches live
    /// under `refs/heads`; passing a remote targets `refs/remotes/<remote>`.
    #[context("Writing ref {name}")]
    pub fn write_ref(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: &Checksum,
    ) -> Result<()> {
        let dir: Utf8PathBuf = match remote {
            None => "refs/heads".into(),
            Some(remote) => Utf8Path::new("refs/remotes").join(remote),
        };
        self.dir().create_dir_all(dir.as_std_path())?;
        let path = dir.join(name);
        self.dir()
            .atomic_write(path.as_std_path(), format!("{checksum}\n").as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::RepoMode;
    use camino::Utf8Path;

    fn testrepo() -> (tempfile::TempDir, Repo) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("repo");
        let repo = Repo::create(&path, RepoMode::Archive).unwrap();
        (td, repo)
    }

    fn checksum(fill: u8) -> Checksum {
        Checksum::from_bytes(&[fill; 32]).unwrap()
    }

    #[test]
    fn test_write_and_resolve() {
        let (_td, repo) = testrepo();
        let c = checksum(1);
        repo.write_ref(None, "main", &c).unwrap();
        assert_eq!(repo.resolve_rev("main", false).unwrap(), Some(c));
        // Hex literals pass through without touching the filesystem
        assert_eq!(
            repo.resolve_rev(&c.to_hex(), false).unwrap(),
            Some(c)
        );
        // Remote-tracking refs resolve via refs/remotes
        let c2 = checksum(2);
        repo.write_ref(Some("origin"), "main", &c2).unwrap();
        assert_eq!(repo.resolve_rev("origin/main", false).unwrap(), Some(c2));
    }

    #[test]
    fn test_missing_and_invalid() {
        let (_td, repo) = testrepo();
        assert_eq!(repo.resolve_rev("nosuch", true).unwrap(), None);
        assert!(repo.resolve_rev("nosuch", false).is_err());
        for bad in ["", "a/b/c", "a..b", "/x", "x/"] {
            assert!(repo.resolve_rev(bad, true).is_err(), "{bad:?}");
        }
        // Corrupt ref contents are rejected, not returned
        repo.dir()
            .write("refs/heads/bad", b"this is not a checksum\n")
            .unwrap();
        assert!(repo.resolve_rev("bad", false).is_err());
    }

    #[test]
    fn test_symbolic_ref() {
        let (_td, repo) = testrepo();
        let c = checksum(3);
        repo.write_ref(None, "main", &c).unwrap();
        repo.dir().write("refs/heads/HEAD", b"ref: main\n").unwrap();
        assert_eq!(repo.resolve_rev("HEAD", false).unwrap(), Some(c));
    }

    #[test]
    fn test_trailing_whitespace_tolerated() {
        let (_td, repo) = testrepo();
        let c = checksum(4);
        repo.dir()
            .write("refs/heads/ws", format!("{c}  \n").as_bytes())
            .unwrap();
        assert_eq!(repo.resolve_rev("ws", false).unwrap(), Some(c));
    }
}
