//! Error taxonomy surfaced to callers (spec §6, §7).

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Typed error taxonomy for every fallible operation in this crate.
///
/// Kept as a flat enum (mirroring `csa-core::error::AppError`) rather than a
/// hierarchy of error types per component, so callers can match on `Kind`
/// without needing to know which subsystem produced it.
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    /// Command, `cwd`, or a `Stdio::File` path does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Command exists but is not executable (where determinable).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Generic I/O failure: pipe, dup2, exec, handshake corruption, etc.
    #[error("I/O error: {0}")]
    Io(String),

    /// Feature absent on the current platform (e.g. `chdir` file action).
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Caller invoked an operation in an invalid state (`exitCode()` on a
    /// live process, `Waiter` construction before `destroy`).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A blocking call was interrupted.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// An async call was cancelled.
    #[error("cancelled: {0}")]
    Cancellation(String),

    /// Multiple independent failures occurred in one pass (e.g. several feed
    /// callbacks threw during one `dispatchBytes`); `primary` is reported,
    /// the rest are attached as context.
    #[error("{primary}{}", format_suppressed(.suppressed))]
    Composite {
        primary: Box<ProcessError>,
        suppressed: Vec<ProcessError>,
    },
}

fn format_suppressed(suppressed: &[ProcessError]) -> String {
    if suppressed.is_empty() {
        String::new()
    } else {
        format!(" ({} suppressed error(s))", suppressed.len())
    }
}

impl ProcessError {
    /// Build a `Composite` error from a primary failure and zero or more
    /// suppressed follow-on failures, collapsing to the primary alone when
    /// there is nothing to suppress.
    pub fn composite(primary: ProcessError, suppressed: Vec<ProcessError>) -> ProcessError {
        if suppressed.is_empty() {
            primary
        } else {
            ProcessError::Composite {
                primary: Box::new(primary),
                suppressed,
            }
        }
    }

    /// Wrap a raw `io::Error` as a generic `Io` variant with context.
    pub fn io(context: impl fmt::Display, err: std::io::Error) -> ProcessError {
        ProcessError::Io(format!("{context}: {err}"))
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ProcessError::FileNotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => ProcessError::AccessDenied(err.to_string()),
            _ => ProcessError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_expected_shape() {
        let err = ProcessError::FileNotFound("/no/such/binary".into());
        assert_eq!(err.to_string(), "file not found: /no/such/binary");
    }

    #[test]
    fn composite_with_no_suppressed_collapses_to_primary() {
        let primary = ProcessError::Io("boom".into());
        let err = ProcessError::composite(primary, vec![]);
        assert!(matches!(err, ProcessError::Io(_)));
    }

    #[test]
    fn composite_with_suppressed_reports_count() {
        let primary = ProcessError::Io("boom".into());
        let suppressed = vec![ProcessError::Io("also boom".into())];
        let err = ProcessError::composite(primary, suppressed);
        assert!(err.to_string().contains("1 suppressed"));
    }

    #[test]
    fn io_error_not_found_classified() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: ProcessError = io_err.into();
        assert!(matches!(err, ProcessError::FileNotFound(_)));
    }
}
