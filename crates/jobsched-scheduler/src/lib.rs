//! `jobsched-scheduler`: schedule instances, dependency eligibility and
//! state control over pluggable storage.
//!
//! # Overview
//!
//! Masters ([`ScheduleMaster`]) are templates. The [`generator`] turns them
//! into time-stamped instances ([`Schedule`]) for one date, using the
//! [`maker`] registered for each master's `schedule_type`. Executors ask the
//! [`resolver`] which instances may start now, then report progress through
//! the [`mutator`]. Two daemons watch the store in the background: one
//! re-delivers pause/resume/abort requests to control listeners, the other
//! flags instances that overran their `max_delay_time`.
//!
//! # Storage adapters
//!
//! | Adapter              | Backing                                        |
//! |----------------------|------------------------------------------------|
//! | [`MemoryRepository`] | `RwLock` over a map plus ordered indexes       |
//! | [`SqliteRepository`] | rusqlite, times as epoch milliseconds          |
//!
//! Both satisfy the same [`Repository`] contract; conditional writes
//! return `Ok(false)` on a lost race instead of an error.

pub mod cluster;
pub mod daemon;
pub mod db;
pub mod error;
pub mod generator;
pub mod listener;
pub mod maker;
pub mod manager;
pub mod memory;
pub mod monitor;
pub mod mutator;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod sequence;
pub mod sqlite;
pub mod types;

pub use cluster::{ClusterGate, ClusterRole};
pub use error::{ErrorKind, Result, SchedulerError};
pub use listener::{ControlListeners, ScheduleControlListener};
pub use maker::{MakerRegistry, ScheduleMaker};
pub use manager::ScheduleManager;
pub use memory::MemoryRepository;
pub use monitor::{Monitor, MonitorStatus, TimeoverEvent};
pub use query::{Expectation, SchedulePatch, ScheduleQuery};
pub use repository::Repository;
pub use sequence::{CounterIdGenerator, FileSequence, IdGenerator, UuidIdGenerator};
pub use sqlite::SqliteRepository;
pub use types::{
    CheckState, ControlState, GroupDependency, MasterDependency, Schedule, ScheduleMaster,
    ScheduleState,
};
