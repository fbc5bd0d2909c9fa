use thiserror::Error;

/// Process-level errors raised before the engine is running.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The configuration file or environment overrides are unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Short error code string for CLI surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
