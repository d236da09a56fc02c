use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Optimistic-concurrency conflicts are never errors: mutators report them as
/// `Ok(false)` so the caller can re-read and decide.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column or masters file could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sequence file or other filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// In-process storage failure (poisoned lock, corrupt index, bad row).
    #[error("Storage error: {0}")]
    Storage(String),

    /// A maker failed to produce occurrences for a master.
    #[error("Schedule make failed for master {master_id}: {reason}")]
    Make { master_id: String, reason: String },

    /// A maker failed because of an underlying storage error.
    #[error("Schedule make failed for master {master_id}: {source}")]
    MakeStorage {
        master_id: String,
        #[source]
        source: Box<SchedulerError>,
    },

    /// The master's `schedule_type` resolves to no maker and no default is configured.
    #[error("No schedule maker for type {schedule_type:?} (master {master_id})")]
    NoMaker {
        master_id: String,
        schedule_type: String,
    },

    /// A maker alias or pattern in the configuration is unusable.
    #[error("Invalid maker configuration: {0}")]
    InvalidMakerConfig(String),

    /// A state code outside the closed enum.
    #[error("Unknown state: {0}")]
    UnknownState(String),

    /// A control-state request that can never be made (e.g. requesting `failed`).
    #[error("Illegal control state transition to {target} for schedule {id}")]
    IllegalTransition { id: String, target: String },

    /// No schedule with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    /// No master with the given ID exists in the store.
    #[error("Schedule master not found: {id}")]
    MasterNotFound { id: String },

    /// A control listener rejected a control-state notification.
    #[error("Control listener failed for schedule {id}: {reason}")]
    Listener { id: String, reason: String },
}

/// Coarse classification used by callers that only care which layer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Storage, IO and parse failures on read/write/generate paths.
    Manage,
    /// Maker invocation failures.
    Make,
    /// Illegal transitions, unknown codes, missing ids, listener failures.
    StateControl,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Database(_)
            | SchedulerError::Serialization(_)
            | SchedulerError::Io(_)
            | SchedulerError::Storage(_)
            | SchedulerError::MasterNotFound { .. } => ErrorKind::Manage,
            SchedulerError::Make { .. }
            | SchedulerError::MakeStorage { .. }
            | SchedulerError::NoMaker { .. }
            | SchedulerError::InvalidMakerConfig(_) => ErrorKind::Make,
            SchedulerError::UnknownState(_)
            | SchedulerError::IllegalTransition { .. }
            | SchedulerError::ScheduleNotFound { .. }
            | SchedulerError::Listener { .. } => ErrorKind::StateControl,
        }
    }

    /// Short error code string for log lines.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Io(_) => "IO_ERROR",
            SchedulerError::Storage(_) => "STORAGE_ERROR",
            SchedulerError::Make { .. } | SchedulerError::MakeStorage { .. } => "MAKE_FAILED",
            SchedulerError::NoMaker { .. } => "NO_MAKER",
            SchedulerError::InvalidMakerConfig(_) => "INVALID_MAKER_CONFIG",
            SchedulerError::UnknownState(_) => "UNKNOWN_STATE",
            SchedulerError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            SchedulerError::ScheduleNotFound { .. } => "SCHEDULE_NOT_FOUND",
            SchedulerError::MasterNotFound { .. } => "MASTER_NOT_FOUND",
            SchedulerError::Listener { .. } => "LISTENER_FAILED",
        }
    }

    /// Wrap a storage-layer failure raised while making occurrences for `master_id`.
    pub fn make_storage(master_id: impl Into<String>, source: SchedulerError) -> Self {
        SchedulerError::MakeStorage {
            master_id: master_id.into(),
            source: Box::new(source),
        }
    }
}

/// Converts a lock poison error to a storage error.
pub(crate) fn poison_err<T>(_: std::sync::PoisonError<T>) -> SchedulerError {
    SchedulerError::Storage("lock poisoned".to_string())
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
