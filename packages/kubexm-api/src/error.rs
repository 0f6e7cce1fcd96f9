use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid host range pattern: {0}")]
    InvalidRange(String),

    #[error("Reversed host range bounds: {0}")]
    ReversedRange(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Cluster config defect: {0}")]
    Defect(String),
}

impl ConfigError {
    pub fn defect<E: std::fmt::Display>(e: E) -> Self {
        Self::Defect(e.to_string())
    }
}
