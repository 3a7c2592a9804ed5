use std::path::PathBuf;

use thiserror::Error;

use crate::archive::NamespaceReport;

/// Failures raised while enumerating, fetching or persisting pages.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to call MediaWiki API at {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("MediaWiki API request failed with HTTP {status}: {body}")]
    Server { status: u16, body: String },

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no revision found for title: {title}")]
    NotFound { title: String },

    #[error("MediaWiki API error [{code}]: {info}")]
    Api { code: String, info: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ArchiveError {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { source, .. } => source.is_timeout() || source.is_connect(),
            Self::Server { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error while {action}: {source}")]
    Sqlite {
        action: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn sqlite(action: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Sqlite { action, source }
    }

    pub(crate) fn io(action: &'static str, path: PathBuf) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }
}

/// A run stopped by an enumeration failure, with the namespaces finished before it.
#[derive(Debug, Error)]
#[error("enumerating namespace {namespace} failed: {source}")]
pub struct RunAborted {
    pub namespace: i32,
    pub completed: Vec<NamespaceReport>,
    #[source]
    pub source: ArchiveError,
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_message_carries_status_and_body() {
        let error = ArchiveError::Server {
            status: 503,
            body: "overloaded".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("overloaded"));
        assert!(error.is_transient());
    }

    #[test]
    fn client_errors_and_not_found_are_not_transient() {
        let forbidden = ArchiveError::Server {
            status: 403,
            body: String::new(),
        };
        assert!(!forbidden.is_transient());
        let missing = ArchiveError::NotFound {
            title: "Nope".to_string(),
        };
        assert!(!missing.is_transient());
        assert_eq!(missing.to_string(), "no revision found for title: Nope");
    }

    #[test]
    fn io_error_names_the_path() {
        let error = StorageError::io("write", PathBuf::from("/tmp/out/x.txt"))(
            std::io::Error::other("disk full"),
        );
        assert!(error.to_string().contains("/tmp/out/x.txt"));
        assert!(error.to_string().contains("disk full"));
    }
}
