//! Error taxonomy for configuration synchronization

use std::path::PathBuf;

/// Errors raised while rendering, writing or validating proxy configuration
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A template could not be read or parsed, or was never loaded
    #[error("template {name} unavailable: {message}")]
    Template { name: String, message: String },

    /// The data handed to a template does not fit it (e.g. a missing field)
    #[error("render {template} failure: {message}")]
    Render { template: String, message: String },

    /// The parent directory of a config file could not be created
    #[error("check or create dir {} failure: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading, renaming or writing a config file failed
    #[error("{action} {} failure: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external validator rejected the configuration tree
    #[error("config check error: {output}")]
    Validation { output: String },

    /// The normalization filter could not be run to completion
    #[error("{program} failure: {message}")]
    Subprocess { program: String, message: String },

    /// A routing domain that cannot be used as a directory name
    #[error("invalid routing domain {0:?}")]
    InvalidDomain(String),

    /// Invalid synchronizer configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A commit task panicked or was torn down with the runtime
    #[error("commit task failure: {0}")]
    Commit(String),
}

impl SyncError {
    /// Whether this error is a validator rejection (the tree was rolled back)
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation { .. })
    }

    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message() {
        let err = SyncError::Validation {
            output: "unknown directive \"lisen\"".to_string(),
        };
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "config check error: unknown directive \"lisen\""
        );
    }

    #[test]
    fn test_io_error_includes_path() {
        let err = SyncError::io(
            "rename",
            "/run/nginx/conf/nginx.conf",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(!err.is_validation());
        let msg = err.to_string();
        assert!(msg.starts_with("rename /run/nginx/conf/nginx.conf failure"));
    }

    #[test]
    fn test_create_dir_error_has_source() {
        let err = SyncError::CreateDir {
            path: PathBuf::from("/run/nginx/conf/http/acme"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
