//! Error types for the read-through cache engine

use std::fmt;
use std::io;
use std::sync::Arc;

#[derive(Debug)]
pub enum CacheError {
    /// Invalid construction parameters (journal path, cache dir, upstream URL)
    Config(String),
    /// An entry ID was not present in the index
    EntryNotFound,
    /// The entry is marked `no cache`; the caller should fall back to pass-through
    NoCache,
    /// The upstream fetch could not be initiated
    Upstream(String),
    /// Reading the upstream body failed mid-stream; observed by every attached reader
    UpstreamRead(Arc<io::Error>),
    /// Append to a response buffer whose completion flag is already set
    AlreadyCompleted,
    /// The metadata journal could not be written
    Journal(Box<io::Error>),
    Json(serde_json::Error),
    Io(Box<io::Error>),
    /// An entry was found in a state the dispatcher does not expect (malformed journal)
    State(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CacheError::EntryNotFound => write!(f, "Cache entry not found"),
            CacheError::NoCache => write!(f, "Entry is not cached"),
            CacheError::Upstream(msg) => write!(f, "Upstream request failed: {}", msg),
            CacheError::UpstreamRead(err) => write!(f, "Failed to read from upstream: {}", err),
            CacheError::AlreadyCompleted => {
                write!(f, "Response buffer has already been completed")
            }
            CacheError::Journal(err) => write!(f, "Failed to write journal: {}", err),
            CacheError::Json(err) => write!(f, "JSON error: {}", err),
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::State(msg) => write!(f, "Unexpected entry state: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::UpstreamRead(err) => Some(err.as_ref()),
            CacheError::Journal(err) => Some(err.as_ref()),
            CacheError::Json(err) => Some(err),
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json(err)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = CacheError::Config("journal file path is empty".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: journal file path is empty"
        );
    }

    #[test]
    fn test_no_cache_display() {
        let err = CacheError::NoCache;
        assert_eq!(format!("{}", err), "Entry is not cached");
    }

    #[test]
    fn test_upstream_read_wraps_cause() {
        let cause = Arc::new(io::Error::other("connection reset"));
        let err = CacheError::UpstreamRead(cause);
        assert!(format!("{}", err).contains("connection reset"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: CacheError = io::Error::other("disk full").into();
        assert!(matches!(err, CacheError::Io(_)));
        assert!(format!("{}", err).contains("disk full"));
    }

    #[test]
    fn test_error_is_debug() {
        let err = CacheError::EntryNotFound;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("EntryNotFound"));
    }
}
