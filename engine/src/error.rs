//! Error taxonomy for the versioning engine.
//!
//! Every public operation returns `Result<T, VersionError>`. No `thiserror`:
//! the engine hand-writes `Display`/`Error`/`From` the way the rest of the
//! crate does.

/// Errors the versioning engine can raise.
#[derive(Debug)]
pub enum VersionError {
    /// A write/allocate-mode fix was attempted by a read-only transaction.
    ReadOnlyTransaction,
    /// The transaction's cancel flag was observed inside `sync` or `verify`.
    Cancel,
    /// An invariant was violated (stale descriptor, wrong lock-name, etc).
    Unexpected(String),
    /// Header quorum could not be formed, or the PBCT / older-chain is broken.
    LogItemCorrupted(String),
    /// Propagated I/O error from a collaborator or the OS file layer.
    Io(std::io::Error),
}

impl std::fmt::Display for VersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnlyTransaction => {
                write!(f, "write/allocate fix attempted by a read-only transaction")
            }
            Self::Cancel => write!(f, "operation canceled"),
            Self::Unexpected(msg) => write!(f, "unexpected: {msg}"),
            Self::LogItemCorrupted(msg) => write!(f, "log item corrupted: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for VersionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VersionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type VersionResult<T> = Result<T, VersionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_kind() {
        assert!(
            VersionError::ReadOnlyTransaction
                .to_string()
                .contains("read-only")
        );
        assert!(VersionError::Cancel.to_string().contains("canceled"));
        assert!(
            VersionError::Unexpected("stale".into())
                .to_string()
                .contains("stale")
        );
        assert!(
            VersionError::LogItemCorrupted("bad pbct".into())
                .to_string()
                .contains("bad pbct")
        );
    }

    #[test]
    fn io_error_round_trips_through_from() {
        let io = std::io::Error::other("disk gone");
        let err: VersionError = io.into();
        assert!(matches!(err, VersionError::Io(_)));
    }
}
