//! # Error Taxonomy
//!
//! Fallible operations across the crate return `eyre::Result`, matching the
//! rest of the storage layer's plumbing. Failures that callers need to branch
//! on are raised as a typed [`StorageError`] inside the report, so a caller
//! can distinguish "document does not exist" from a genuine I/O failure:
//!
//! ```ignore
//! match col.read(id) {
//!     Err(e) if e.downcast_ref::<StorageError>() == Some(&StorageError::NoDoc(id)) => ...,
//!     other => ...,
//! }
//! ```
//!
//! Filesystem failures (open, truncate, rename, mmap) are not given their own
//! variant; they surface as wrapped `std::io::Error` chains with path context
//! attached at the call site.

use thiserror::Error;

/// Typed failures raised by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The document's reserved room (2x its serialized size) exceeds the
    /// configured per-document limit.
    #[error("document too large: needs {given} bytes of room, limit is {max}")]
    DocTooLarge { given: usize, max: usize },

    /// No live document exists under this id, or the record it points at
    /// fails header validation.
    #[error("document `{0}` does not exist")]
    NoDoc(u64),

    #[error("collection `{0}` already exists")]
    CollectionExists(String),

    #[error("collection `{0}` does not exist")]
    CollectionMissing(String),

    #[error("path `{0}` is already indexed")]
    IndexExists(String),

    #[error("path `{0}` is not indexed")]
    IndexMissing(String),
}

/// True when the report wraps [`StorageError::NoDoc`], regardless of id.
pub fn is_no_doc(err: &eyre::Report) -> bool {
    matches!(err.downcast_ref::<StorageError>(), Some(StorageError::NoDoc(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::bail;

    fn fails_with_no_doc() -> eyre::Result<()> {
        bail!(StorageError::NoDoc(42));
    }

    #[test]
    fn downcast_recovers_the_kind() {
        let err = fails_with_no_doc().unwrap_err();
        assert_eq!(err.downcast_ref::<StorageError>(), Some(&StorageError::NoDoc(42)));
        assert!(is_no_doc(&err));
    }

    #[test]
    fn doc_too_large_message_names_both_sizes() {
        let msg = StorageError::DocTooLarge { given: 4096, max: 2048 }.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("2048"));
    }
}
