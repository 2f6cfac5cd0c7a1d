//! Helpers bridging the blocking core with Tokio.

use anyhow::Result;
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::checksum::Checksum;
use crate::vfs::{LocalFile, TreeNode};

fn flatten_join<T>(r: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match r {
        Ok(x) => x,
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}

/// Compute the file-object checksum of a live filesystem entry on the
/// blocking worker pool.  The returned future completes when the checksum
/// is ready; cancelling `cancellable` resolves it early with
/// [`Error::Cancelled`] (the worker's partial state is simply dropped).
pub async fn checksum_file_async(
    path: Utf8PathBuf,
    cancellable: CancellationToken,
) -> Result<Checksum> {
    let token = cancellable.clone();
    let handle = tokio::task::spawn_blocking(move || -> Result<Checksum> {
        if token.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("no parent for '{path}'")))?;
        let name = path
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("no file name in '{path}'")))?;
        let root = LocalFile::new_root(parent)?;
        let node = root
            .lookup(name)?
            .ok_or_else(|| Error::NotFound(format!("No such file or directory: {path}")))?;
        node.file_checksum()?
            .ok_or_else(|| Error::IsDirectory(path.to_string()).into())
    });
    tokio::select! {
        r = handle => flatten_join(r),
        _ = cancellable.cancelled() => Err(Error::Cancelled.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[tokio::test]
    async fn test_checksum_file_async() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let f = base.join("data");
        std::fs::write(f.as_std_path(), b"async hashing").unwrap();
        let token = CancellationToken::new();
        let c1 = checksum_file_async(f.clone(), token.clone()).await.unwrap();
        let c2 = checksum_file_async(f.clone(), token.clone()).await.unwrap();
        assert_eq!(c1, c2);

        let missing = base.join("nosuch");
        assert!(
            checksum_file_async(missing, token.clone())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let f = base.join("data");
        std::fs::write(f.as_std_path(), b"x").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = checksum_file_async(f, token).await.unwrap_err();
        assert!(
            err.chain()
                .any(|e| matches!(e.downcast_ref(), Some(Error::Cancelled)))
        );
    }
}
