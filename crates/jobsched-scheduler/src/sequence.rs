use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::info;
use uuid::Uuid;

use crate::error::{poison_err, Result, SchedulerError};

/// Width of counter-based ids. Zero padding keeps lexicographic order equal
/// to numeric order, which the natural-order tie-break and the canonical
/// duplicate rule both rely on.
const ID_WIDTH: usize = 16;

/// Source of instance ids and resolved group ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Result<String>;
}

fn format_id(n: u64) -> String {
    format!("{:0width$}", n, width = ID_WIDTH)
}

/// Monotonic counter persisted in a single file.
///
/// The file holds the last issued value as decimal text and is rewritten
/// (temp file + rename) before each id is handed out, so a restarted process
/// never reissues an id.
pub struct FileSequence {
    path: PathBuf,
    last: Mutex<u64>,
}

impl FileSequence {
    /// Open (or create) the counter at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let last = match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse::<u64>().map_err(|e| {
                SchedulerError::Storage(format!(
                    "corrupt sequence file {}: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                0
            }
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), last, "sequence opened");
        Ok(Self {
            path,
            last: Mutex::new(last),
        })
    }

    fn persist(&self, value: u64) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, value.to_string())?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl IdGenerator for FileSequence {
    fn next_id(&self) -> Result<String> {
        let mut last = self.last.lock().map_err(poison_err)?;
        let next = *last + 1;
        self.persist(next)?;
        *last = next;
        Ok(format_id(next))
    }
}

/// Time-ordered UUIDv7 ids. Nothing is persisted.
#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> Result<String> {
        Ok(Uuid::now_v7().to_string())
    }
}

/// Process-local counter, for tests and the memory backend.
#[derive(Debug, Default)]
pub struct CounterIdGenerator {
    last: AtomicU64,
}

impl CounterIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for CounterIdGenerator {
    fn next_id(&self) -> Result<String> {
        Ok(format_id(self.last.fetch_add(1, Ordering::SeqCst) + 1))
    }
}
