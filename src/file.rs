use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs::File;

/// A TemporaryFile wraps a normal [tokio::fs::File], but will attempt to
/// delete the file when this handle is dropped. File i/o can be done using
/// `as_mut` or `as_ref`.
pub struct TemporaryFile {
    inner: File,
    path: PathBuf,
}

impl TemporaryFile {
    /// Create a new, empty, uniquely named file in `dir`.
    pub async fn create(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.part", uuid::Uuid::new_v4()));
        Ok(TemporaryFile {
            inner: File::options().read(true).write(true).create_new(true).open(&path).await?,
            path,
        })
    }

    /// Return the path on the filesystem.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the file back to zero bytes and rewind.
    pub async fn reset(&mut self) -> Result<()> {
        use tokio::io::AsyncSeekExt;

        self.inner.set_len(0).await?;
        self.inner.seek(std::io::SeekFrom::Start(0)).await?;
        Ok(())
    }
}

impl AsMut<File> for TemporaryFile {
    fn as_mut(&mut self) -> &mut File {
        &mut self.inner
    }
}

impl AsRef<File> for TemporaryFile {
    fn as_ref(&self) -> &File {
        &self.inner
    }
}

impl Drop for TemporaryFile {
    fn drop(&mut self) {
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async {
                    tracing::trace!(path = format!("{:?}", path), "removing dropped file");
                    let _ = tokio::fs::remove_file(path).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
