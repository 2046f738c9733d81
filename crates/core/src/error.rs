//! Error types for the core library

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl Error {
    /// Whether a retry of the same operation could succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Archive(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(io.is_transient());
        assert!(Error::Archive("missing".to_string()).is_transient());
        assert!(!Error::TaskNotFound("x".to_string()).is_transient());
        assert!(!Error::InvalidInput("x".to_string()).is_transient());
    }
}
