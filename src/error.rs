//! Central error types for relock.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic
//! `Display` and `From` implementations. The analysis engine itself is
//! infallible (unresolvable constructs are skipped, not reported); these
//! errors come from loading, parsing, and rendering.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum Error {
    /// IO operation failed, with the path that failed
    #[error("IO error at {}: {error}", path.display())]
    Io {
        error: std::io::Error,
        path: PathBuf,
    },

    /// Failed to parse a Go source file
    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    /// Tree-sitter grammar/configuration error
    #[error("Tree-sitter error: {0}")]
    TreeSitter(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Convenience type alias for Results using relock's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an IO error with path context.
    #[inline]
    pub fn io(error: std::io::Error, path: impl AsRef<Path>) -> Self {
        Error::Io {
            error,
            path: path.as_ref().to_path_buf(),
        }
    }
}
