use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::debug;

use crate::error::{BranchError, Result};
use crate::model::{sanitize_name, CoordinationRecord};
use crate::store::traits::{CoordinationStore, StoreLock};

/// Coordination records as JSON files in a directory shared by all workers
/// of one session.
///
/// `neon_{key}.json` holds the record and the adjacent `neon_{key}.lock` is
/// held with an exclusive advisory lock. The OS drops the lock when the
/// holding process dies, so a crashed creator cannot wedge the others.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| BranchError::io(dir.display(), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("neon_{}.json", sanitize_name(key)))
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("neon_{}.lock", sanitize_name(key)))
    }
}

struct FileLock {
    file: File,
    path: PathBuf,
}

impl StoreLock for FileLock {}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released lock {}", self.path.display());
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[async_trait::async_trait]
impl CoordinationStore for FileStore {
    async fn try_lock(&self, key: &str) -> Result<Option<Box<dyn StoreLock>>> {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BranchError::io(path.display(), e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("Acquired lock {}", path.display());
                Ok(Some(Box::new(FileLock { file, path })))
            }
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(BranchError::io(path.display(), e)),
        }
    }

    async fn read_record(&self, key: &str) -> Result<Option<CoordinationRecord>> {
        let path = self.record_path(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BranchError::io(path.display(), e)),
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| BranchError::json(path.display(), e))
    }

    async fn write_record(&self, key: &str, record: &CoordinationRecord) -> Result<()> {
        let path = self.record_path(key);
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        let text = serde_json::to_vec_pretty(record).map_err(|e| BranchError::json(path.display(), e))?;

        let mut file = File::create(&tmp).map_err(|e| BranchError::io(tmp.display(), e))?;
        file.write_all(&text)
            .and_then(|_| file.sync_all())
            .map_err(|e| BranchError::io(tmp.display(), e))?;
        fs::rename(&tmp, &path).map_err(|e| BranchError::io(path.display(), e))?;
        Ok(())
    }

    async fn remove_record(&self, key: &str) -> Result<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BranchError::io(path.display(), e)),
        }
    }
}
