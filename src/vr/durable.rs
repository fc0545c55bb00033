//! Durable checkpoint storage for the replication state blob.

use std::path::{Path, PathBuf};

use crate::utils::MetaError;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Whole-blob checkpoint store. Log records are framed and persisted by the
/// external log writer; this hub only keeps the state machine's own
/// checkpoint, written to a temp file and atomically renamed into place.
pub(crate) struct CheckpointHub {
    /// Path of the checkpoint file.
    path: PathBuf,

    /// Whether to fsync after writing.
    sync_write: bool,
}

impl CheckpointHub {
    /// Prepares the checkpoint backing location.
    pub(crate) async fn new_and_setup(
        path: &Path,
        sync_write: bool,
    ) -> Result<Self, MetaError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty()
                && !fs::try_exists(parent).await?
            {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(CheckpointHub {
            path: path.to_path_buf(),
            sync_write,
        })
    }

    /// Loads the current checkpoint blob, `None` when none was written yet.
    pub(crate) async fn load(&self) -> Result<Option<String>, MetaError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let mut file = File::open(&self.path).await?;
        let mut blob = String::new();
        file.read_to_string(&mut blob).await?;
        Ok(Some(blob))
    }

    /// Persists a checkpoint blob: write to `<path>.tmp`, then rename over
    /// the live file so readers never observe a torn checkpoint.
    pub(crate) async fn save(&self, blob: &[u8]) -> Result<(), MetaError> {
        let tmp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(blob).await?;
        if self.sync_write {
            file.sync_data().await?;
        }
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod durable_tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load() -> Result<(), MetaError> {
        let path = Path::new("/tmp/vrmeta.test.ckpt");
        let _ = fs::remove_file(path).await;

        let hub = CheckpointHub::new_and_setup(path, true).await?;
        assert_eq!(hub.load().await?, None);

        hub.save(b"vrview 0 0\n").await?;
        assert_eq!(hub.load().await?, Some("vrview 0 0\n".into()));

        // overwrites atomically
        hub.save(b"vrview 0 1\n").await?;
        assert_eq!(hub.load().await?, Some("vrview 0 1\n".into()));
        Ok(())
    }
}
