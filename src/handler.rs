//! Exception handling policy for dispatcher and destroy-time failures
//! (spec §4.4, §9).

use crate::error::ProcessError;

/// Decides what happens to an error raised while feeding a consumer
/// callback, or while tearing a process down.
///
/// Returning `true` swallows the error (the stream keeps running, if it
/// can); returning `false` propagates it — the stream transitions to
/// `stopped` and the error is surfaced to whoever is waiting on it
/// (`waitFor`, the output collector, `destroy`).
pub trait ExceptionHandler: Send + Sync {
    fn on_exception(&self, context: &str, error: &ProcessError) -> bool;
}

/// Default policy: swallow everything. Matches the teacher's "log and
/// move on" behavior for feed callback failures — a consumer callback
/// throwing should not itself crash the dispatcher loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreHandler;

impl ExceptionHandler for IgnoreHandler {
    fn on_exception(&self, context: &str, error: &ProcessError) -> bool {
        tracing::warn!(context, %error, "swallowed exception from process feed callback");
        true
    }
}

/// Propagating policy: never swallow. Available to callers who want a
/// feed callback failure to stop the stream and surface through
/// `waitFor`/`destroy` instead of being logged and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropagateHandler;

impl ExceptionHandler for PropagateHandler {
    fn on_exception(&self, _context: &str, _error: &ProcessError) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_handler_swallows() {
        let err = ProcessError::Io("boom".into());
        assert!(IgnoreHandler.on_exception("feed.stdout", &err));
    }

    #[test]
    fn propagate_handler_rethrows() {
        let err = ProcessError::Io("boom".into());
        assert!(!PropagateHandler.on_exception("feed.stdout", &err));
    }
}
