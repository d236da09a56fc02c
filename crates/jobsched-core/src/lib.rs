//! `jobsched-core`: configuration shared by the scheduler library and the server.

pub mod config;
pub mod error;

pub use config::{
    ClusterConfig, DatabaseConfig, GeneratorConfig, JobschedConfig, MonitorConfig,
    SequenceConfig, SequenceKind, StorageBackend,
};
pub use error::{ConfigError, Result};
