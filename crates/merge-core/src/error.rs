use std::io;
use std::path::PathBuf;

/// Shared error taxonomy for every `merge-core` module.
///
/// Most per-path and per-pair failures encountered while walking, hashing, linking, or
/// deduplicating are logged and skipped rather than propagated through this type; it exists for
/// the failures that abort an entire operation (manifest ingestion, argument validation) or that
/// carry a distinct recovery path (`Permission`, `Corruption`).
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed manifest line {line_no} in {path:?}: {reason}")]
    Parse {
        path: PathBuf,
        line_no: usize,
        reason: String,
    },

    #[error("permission denied opening {path:?} read-write")]
    Permission { path: PathBuf },

    #[error("dedup range on {path:?} reported DIFFERS against its leader")]
    Corruption { path: PathBuf },
}

impl MergeError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MergeError::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
