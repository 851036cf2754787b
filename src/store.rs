use crate::types::Row;
use crate::{RescrapeError, StoreError, StoreErrorKind, StoreOp};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Positional row storage over named sheets.
///
/// Each call is atomic on its own; there are no multi-row transactions, so callers
/// that delete several rows must order the deletes themselves.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// All data rows of `sheet`, in sheet order. Index 0 is the first data row.
    async fn read_all(&self, sheet: &str) -> Result<Vec<Row>, StoreError>;
    async fn append(&self, sheet: &str, row: Row) -> Result<(), StoreError>;
    async fn update(&self, sheet: &str, index: usize, row: Row) -> Result<(), StoreError>;
    /// Removes the row at `index`; later rows shift up by one.
    async fn delete(&self, sheet: &str, index: usize) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: RowStore + ?Sized> RowStore for Arc<T> {
    async fn read_all(&self, sheet: &str) -> Result<Vec<Row>, StoreError> {
        (**self).read_all(sheet).await
    }

    async fn append(&self, sheet: &str, row: Row) -> Result<(), StoreError> {
        (**self).append(sheet, row).await
    }

    async fn update(&self, sheet: &str, index: usize, row: Row) -> Result<(), StoreError> {
        (**self).update(sheet, index, row).await
    }

    async fn delete(&self, sheet: &str, index: usize) -> Result<(), StoreError> {
        (**self).delete(sheet, index).await
    }
}

/// An in-process workbook. The CLI persists it as JSON: `{"Main": [rows], "Error": [rows]}`.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    sheets: Mutex<BTreeMap<String, Vec<Row>>>,
    /// Sheets whose appends reject a FinalURL that is already present.
    unique_url_sheets: HashSet<String>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(self, name: &str, rows: Vec<Row>) -> Self {
        if let Ok(mut sheets) = self.sheets.lock() {
            sheets.insert(name.to_string(), rows);
        }
        self
    }

    /// Makes appends to `sheet` fail with `DuplicateUrl` when the FinalURL is already there.
    pub fn reject_duplicate_urls(mut self, sheet: &str) -> Self {
        self.unique_url_sheets.insert(sheet.to_string());
        self
    }

    /// A copy of the rows currently in `sheet`.
    pub fn rows(&self, sheet: &str) -> Vec<Row> {
        self.sheets
            .lock()
            .map(|sheets| sheets.get(sheet).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Loads a workbook file written by [`MemoryRowStore::save`].
    pub fn load(path: &Path) -> Result<Self, RescrapeError> {
        let data = fs::read_to_string(path)?;
        let sheets: BTreeMap<String, Vec<Row>> = serde_json::from_str(&data)?;
        info!(path = %path.display(), sheets = sheets.len(), "Loaded workbook");
        Ok(Self {
            sheets: Mutex::new(sheets),
            unique_url_sheets: HashSet::new(),
        })
    }

    /// Writes the workbook to `path` through a temporary file, so a crash never leaves half a file.
    pub fn save(&self, path: &Path) -> Result<(), RescrapeError> {
        let snapshot = self
            .sheets
            .lock()
            .map(|sheets| sheets.clone())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "workbook lock poisoned"))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Saved workbook");
        Ok(())
    }

    fn with_sheets<T>(
        &self,
        sheet: &str,
        index: Option<usize>,
        op: StoreOp,
        f: impl FnOnce(&mut BTreeMap<String, Vec<Row>>) -> Result<T, StoreErrorKind>,
    ) -> Result<T, StoreError> {
        let error = |kind| StoreError {
            sheet: sheet.to_string(),
            index,
            op,
            kind,
        };
        let mut sheets = self
            .sheets
            .lock()
            .map_err(|_| error(StoreErrorKind::Transport("workbook lock poisoned".into())))?;
        f(&mut sheets).map_err(error)
    }
}

fn no_such_sheet(sheet: &str) -> StoreErrorKind {
    StoreErrorKind::Transport(format!("no sheet named '{}'", sheet))
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn read_all(&self, sheet: &str) -> Result<Vec<Row>, StoreError> {
        self.with_sheets(sheet, None, StoreOp::ReadAll, |sheets| {
            sheets.get(sheet).cloned().ok_or_else(|| no_such_sheet(sheet))
        })
    }

    async fn append(&self, sheet: &str, row: Row) -> Result<(), StoreError> {
        let unique = self.unique_url_sheets.contains(sheet);
        self.with_sheets(sheet, None, StoreOp::Append, |sheets| {
            let rows = sheets.entry(sheet.to_string()).or_default();
            if unique && rows.iter().any(|r| r.final_url == row.final_url) {
                return Err(StoreErrorKind::DuplicateUrl(row.final_url));
            }
            rows.push(row);
            Ok(())
        })
    }

    async fn update(&self, sheet: &str, index: usize, row: Row) -> Result<(), StoreError> {
        self.with_sheets(sheet, Some(index), StoreOp::Update, |sheets| {
            let rows = sheets.get_mut(sheet).ok_or_else(|| no_such_sheet(sheet))?;
            let len = rows.len();
            let slot = rows
                .get_mut(index)
                .ok_or(StoreErrorKind::IndexOutOfRange { len })?;
            *slot = row;
            Ok(())
        })
    }

    async fn delete(&self, sheet: &str, index: usize) -> Result<(), StoreError> {
        self.with_sheets(sheet, Some(index), StoreOp::Delete, |sheets| {
            let rows = sheets.get_mut(sheet).ok_or_else(|| no_such_sheet(sheet))?;
            if index >= rows.len() {
                return Err(StoreErrorKind::IndexOutOfRange { len: rows.len() });
            }
            rows.remove(index);
            Ok(())
        })
    }
}

/// Exclusive marker file held for the duration of a batch run.
///
/// Index-based mutations from two concurrent runs would corrupt row identity,
/// so a second run fails to acquire the lock instead. The file records the owner's
/// PID; a lock left behind by a dead process, or older than `stale_after`, is taken over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: impl Into<PathBuf>, stale_after: Duration) -> Result<Self, RescrapeError> {
        let path = path.into();
        match Self::create(&path) {
            Err(RescrapeError::IoError(e)) if e.kind() == ErrorKind::AlreadyExists => {
                if !is_stale(&path, stale_after) {
                    return Err(RescrapeError::IoError(e));
                }
                warn!(path = %path.display(), "Taking over stale run lock");
                fs::remove_file(&path)?;
                Self::create(&path)
            }
            other => other,
        }
    }

    fn create(path: &Path) -> Result<Self, RescrapeError> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A lock is stale when its owner is known to be gone or it has outlived `stale_after`.
fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let owner = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    if let Some(pid) = owner {
        if process_alive(pid) == Some(false) {
            info!(pid, "Run lock owner is gone");
            return true;
        }
    }

    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= stale_after)
}

/// `None` where liveness cannot be checked.
fn process_alive(pid: u32) -> Option<bool> {
    if cfg!(target_os = "linux") {
        Some(Path::new("/proc").join(pid.to_string()).exists())
    } else {
        None
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
