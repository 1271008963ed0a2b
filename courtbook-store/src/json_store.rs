use chrono::Utc;
use courtbook_core::{StoreError, StoreResult, Table, TableGuard, TableStore, WriteMode};
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Flat-file table store: one pretty-printed JSON document per table inside
/// `root`.
///
/// Writers take an advisory lock on a sidecar `{table}.lock` file (the data
/// file itself is swapped by rename, so it cannot carry the lock), write
/// `{table}.tmp`, fsync it and rename it over the live file.
#[derive(Debug, Clone)]
pub struct FileTableStore {
    root: PathBuf,
    lock_timeout: Duration,
    backups: bool,
}

impl FileTableStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Root { path: root.clone(), source })?;
        Ok(Self { root, lock_timeout: Duration::from_secs(5), backups: true })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// With backups disabled, `WriteMode::Backup` behaves like `Replace`.
    pub fn with_backups(mut self, enabled: bool) -> Self {
        self.backups = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, table: Table) -> PathBuf {
        self.root.join(table.file_name())
    }

    fn sibling(&self, table: Table, suffix: &str) -> PathBuf {
        self.root.join(format!("{}.{}", table.file_name(), suffix))
    }
}

impl TableStore for FileTableStore {
    fn read(&self, table: Table) -> StoreResult<Value> {
        read_table(table, &self.path(table))
    }

    fn lock(&self, table: Table) -> StoreResult<Box<dyn TableGuard + '_>> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.sibling(table, "lock"))
            .map_err(|source| StoreError::Lock { table, source })?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(StoreError::LockTimeout {
                            table,
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(source) => return Err(StoreError::Lock { table, source }),
            }
        }
        debug!("Locked {} after {:?}", table, started.elapsed());

        Ok(Box::new(FileGuard {
            table,
            path: self.path(table),
            tmp_path: self.sibling(table, "tmp"),
            backups: self.backups,
            lock_file,
        }))
    }
}

struct FileGuard {
    table: Table,
    path: PathBuf,
    tmp_path: PathBuf,
    backups: bool,
    lock_file: File,
}

impl FileGuard {
    fn backup(&self) -> StoreResult<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        // Microsecond stamp; the counter only kicks in for writes within the
        // same microsecond. Runs under the table lock, so the name is ours.
        let stamp = Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
        let base = format!("{}.bak.{}", self.table.file_name(), stamp);
        let mut backup = self.path.with_file_name(&base);
        let mut n = 1;
        while backup.exists() {
            backup = self.path.with_file_name(format!("{}-{}", base, n));
            n += 1;
        }
        fs::copy(&self.path, &backup).map_err(|source| StoreError::Io { table: self.table, source })?;
        info!("Backed up {} to {}", self.table, backup.display());
        Ok(Some(backup))
    }
}

impl TableGuard for FileGuard {
    fn table(&self) -> Table {
        self.table
    }

    fn read(&self) -> StoreResult<Value> {
        read_table(self.table, &self.path)
    }

    fn write(&mut self, value: &Value, mode: WriteMode) -> StoreResult<()> {
        let table = self.table;
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode { table, source })?;

        if mode == WriteMode::Backup && self.backups {
            self.backup()?;
        }

        if let Err(source) = write_synced(&self.tmp_path, &bytes) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(StoreError::Io { table, source });
        }
        if let Err(source) = fs::rename(&self.tmp_path, &self.path) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(StoreError::Io { table, source });
        }
        debug!("Wrote {} ({} bytes)", table, bytes.len());
        Ok(())
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn read_table(table: Table, path: &Path) -> StoreResult<Value> {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Value::Object(Map::new())),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { table, source }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
        Err(source) => Err(StoreError::Io { table, source }),
    }
}
