use thiserror::Error;

/// Primary error type for Quarry storage operations.
///
/// Every failure a VFS entry point can report is one of these variants; the
/// engine-facing status integer is derived through [`QuarryError::error_code`].
/// Invariant breaches (e.g. a journal write with no sibling database entry)
/// are *not* represented here — those are programmer errors and panic.
#[derive(Error, Debug)]
pub enum QuarryError {
    /// The file has no block-0 record and CREATE was not requested, or the
    /// backing store could not be opened at all.
    #[error("unable to open file: '{path}'")]
    CannotOpen { path: String },

    /// The block store was created by an incompatible schema version and no
    /// one-step upgrade path applies.
    #[error("block store schema mismatch: found v{found}, expected v{expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    /// A read past the logical end of file. The caller's buffer tail has
    /// already been zero-filled when this is reported.
    #[error("short read: requested {requested} bytes, got {got}")]
    ShortRead { requested: usize, got: usize },

    /// A lock escalation was denied without blocking other progress.
    #[error("file is locked")]
    Busy,

    /// The key/value substrate aborted a transaction or otherwise failed.
    /// Never retried locally; the enclosing VFS operation reports it.
    #[error("storage I/O error: {detail}")]
    Io { detail: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Engine status codes for the VFS boundary.
///
/// Numeric values match the embedded engine's public interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// File is locked.
    Busy = 5,
    /// Disk I/O error.
    IoErr = 10,
    /// Unable to open file.
    CantOpen = 14,
    /// Read returned fewer bytes than requested (extended I/O code).
    IoErrShortRead = 522,
}

impl QuarryError {
    /// Map this error to the engine status code for the VFS boundary.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::CannotOpen { .. } | Self::SchemaMismatch { .. } => ErrorCode::CantOpen,
            Self::ShortRead { .. } => ErrorCode::IoErrShortRead,
            Self::Busy => ErrorCode::Busy,
            Self::Io { .. } => ErrorCode::IoErr,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Create an I/O error from a substrate failure detail.
    pub fn io(detail: impl Into<String>) -> Self {
        Self::Io {
            detail: detail.into(),
        }
    }

    /// Create a cannot-open error for a path.
    pub fn cannot_open(path: impl Into<String>) -> Self {
        Self::CannotOpen { path: path.into() }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using [`QuarryError`].
pub type Result<T> = std::result::Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = QuarryError::cannot_open("/main.db");
        assert_eq!(err.to_string(), "unable to open file: '/main.db'");

        let err = QuarryError::ShortRead {
            requested: 4096,
            got: 100,
        };
        assert_eq!(err.to_string(), "short read: requested 4096 bytes, got 100");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            QuarryError::cannot_open("x").error_code(),
            ErrorCode::CantOpen
        );
        assert_eq!(
            QuarryError::SchemaMismatch {
                found: 9,
                expected: 2
            }
            .error_code(),
            ErrorCode::CantOpen
        );
        assert_eq!(QuarryError::Busy.error_code(), ErrorCode::Busy);
        assert_eq!(QuarryError::io("abort").error_code(), ErrorCode::IoErr);
        assert_eq!(
            QuarryError::ShortRead {
                requested: 8,
                got: 0
            }
            .error_code(),
            ErrorCode::IoErrShortRead
        );
        assert_eq!(
            QuarryError::internal("bug").error_code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn error_code_values() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::Busy as i32, 5);
        assert_eq!(ErrorCode::IoErr as i32, 10);
        assert_eq!(ErrorCode::CantOpen as i32, 14);
        assert_eq!(ErrorCode::IoErrShortRead as i32, 522);
    }

    #[test]
    fn is_transient() {
        assert!(QuarryError::Busy.is_transient());
        assert!(!QuarryError::io("abort").is_transient());
        assert!(!QuarryError::cannot_open("x").is_transient());
    }
}
