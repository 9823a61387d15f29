use std::path::PathBuf;

use thiserror::Error;

use crate::recorder::codec::CodecError;

/// Errors surfaced to callers of the accounting engine.
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("stats service not ready: first poll has not completed")]
    NotReady,

    #[error("stats service is shut down")]
    ShutDown,

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid time range: start {start} is after end {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("uid {caller_uid} may not access stats for uid {uid} tag {tag}")]
    AccessDenied { caller_uid: i32, uid: i32, tag: i32 },

    #[error("corrupt stats shard {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("encoding stats shard: {0}")]
    Encode(#[source] CodecError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StatsError {
    /// Wraps an I/O error with a short description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if the error came from a shard that failed validation.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display_includes_context() {
        let err = StatsError::io(
            "reading shard dev.0-",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "reading shard dev.0-: gone");
        assert!(!err.is_corrupt());
    }

    #[test]
    fn test_corrupt_is_detected() {
        let err = StatsError::Corrupt {
            path: PathBuf::from("/tmp/uid.1-2"),
            source: CodecError::ChecksumMismatch,
        };
        assert!(err.is_corrupt());
        assert!(err.to_string().contains("/tmp/uid.1-2"));
    }
}
