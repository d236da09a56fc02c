use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Short error code string for log lines and exit diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Invalid(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
