//! `OutputDispatcher` (C4): routes a stream's byte segments and decoded
//! lines to every feed currently attached to it, and exposes `awaitStop`
//! so callers can block until a stream is done (spec §4.4).
//!
//! Each stream (stdout/stderr) is served by at most one reader task, so
//! the [`LineScanner`] itself needs no synchronization: it is owned
//! exclusively by that task and passed in by `&mut` on every call. The
//! `Mutex` here only ever guards the feed set and the `stopped` flag,
//! which `attach` (any task) and `dispatch_bytes` (the stream's one
//! reader task) both touch.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{ProcessError, Result};
use crate::feed::Feed;
use crate::line_scanner::LineScanner;
use crate::handler::ExceptionHandler;
use crate::wait_loop::WaitLoop;

const AWAIT_STOP_SLEEP_SLICE: Duration = Duration::from_millis(5);

struct StreamInner {
    feeds: Arc<Vec<Feed>>,
    stopped: bool,
}

/// Per-stream dispatch state. One instance serves stdout, another stderr.
pub struct StreamDispatch {
    context: &'static str,
    is_pipe: bool,
    started: AtomicBool,
    start_notify: Notify,
    stop_notify: Notify,
    inner: Mutex<StreamInner>,
}

impl StreamDispatch {
    /// `is_pipe` mirrors whether this stream's stdio was actually `Pipe`;
    /// when it isn't, dispatch never runs, so `started`/`stopped` start
    /// out already true — `awaitStop` returns immediately (spec §4.4 "or
    /// the stream was never started").
    pub fn new(context: &'static str, is_pipe: bool) -> StreamDispatch {
        StreamDispatch {
            context,
            is_pipe,
            started: AtomicBool::new(!is_pipe),
            start_notify: Notify::new(),
            stop_notify: Notify::new(),
            inner: Mutex::new(StreamInner { feeds: Arc::new(Vec::new()), stopped: !is_pipe }),
        }
    }

    /// Attach one or more feeds. No-op if this stream isn't a pipe, is
    /// already stopped, or `feeds` is empty. Feeds already present
    /// (compared by identity) are not added twice.
    pub fn attach(&self, feeds: Vec<Feed>) {
        if !self.is_pipe || feeds.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return;
        }
        let had_feeds = !inner.feeds.is_empty();
        let mut next: Vec<Feed> = (*inner.feeds).clone();
        for feed in feeds {
            if !next.iter().any(|existing| existing.ptr_eq(&feed)) {
                next.push(feed);
            }
        }
        inner.feeds = Arc::new(next);
        let now_has_feeds = !inner.feeds.is_empty();
        drop(inner);

        if !had_feeds && now_has_feeds && !self.started.swap(true, Ordering::SeqCst) {
            self.start_notify.notify_waiters();
        }
    }

    pub(crate) fn context_label(&self) -> &'static str {
        self.context
    }

    /// Whether at least one feed has ever been attached (used by the
    /// reader task's start barrier).
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Block (async) until a feed has been attached, so the reader does
    /// not start consuming the pipe before anyone can see the data.
    pub async fn await_start(&self) {
        let notified = self.start_notify.notified();
        if self.has_started() {
            return;
        }
        notified.await;
    }

    /// Current feed snapshot, cheap to clone (reference-counted).
    fn snapshot(&self) -> Arc<Vec<Feed>> {
        self.inner.lock().unwrap().feeds.clone()
    }

    /// Dispatch one byte segment (`Some`) or EOS (`None`) to every
    /// currently-attached feed. `scanner` is owned by the caller (the
    /// stream's one reader task) and lazily created the first time a
    /// `Feed::Line` is observed in the snapshot.
    ///
    /// On EOS, or on an error the handler does not swallow, the feed set
    /// is cleared and the stream transitions to `stopped`.
    pub fn dispatch_bytes(
        &self,
        bytes: Option<&[u8]>,
        scanner: &mut Option<LineScanner>,
        handler: &dyn ExceptionHandler,
    ) -> Result<()> {
        let snapshot = self.snapshot();
        let mut errors: Vec<ProcessError> = Vec::new();

        if !snapshot.is_empty() || scanner.is_some() {
            self.dispatch_raw(&snapshot, bytes, &mut errors);
            self.dispatch_lines(&snapshot, bytes, scanner, &mut errors);
        }

        let combined = combine_errors(errors);
        let mut unswallowed = None;
        if let Some(err) = combined {
            if !handler.on_exception(self.context, &err) {
                unswallowed = Some(err);
            }
        }

        let is_eos = bytes.is_none();
        if is_eos || unswallowed.is_some() {
            self.stop();
        }

        match unswallowed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn dispatch_raw(&self, snapshot: &[Feed], bytes: Option<&[u8]>, errors: &mut Vec<ProcessError>) {
        let mut shared_segment = None;
        for feed in snapshot {
            if let Feed::Raw(raw) = feed {
                let segment = shared_segment
                    .get_or_insert_with(|| bytes.map(crate::segment::OutputSegment::from_bytes))
                    .clone();
                if let Err(e) = raw.call(segment) {
                    errors.push(e);
                }
            }
        }
    }

    fn dispatch_lines(
        &self,
        snapshot: &[Feed],
        bytes: Option<&[u8]>,
        scanner: &mut Option<LineScanner>,
        errors: &mut Vec<ProcessError>,
    ) {
        let has_line_feed = snapshot.iter().any(Feed::is_line);
        if !has_line_feed && scanner.is_none() {
            return;
        }
        let line_scanner = scanner.get_or_insert_with(LineScanner::new);
        let line_errors = RefCell::new(Vec::new());
        let sink = |line: Option<String>| -> Result<()> {
            for feed in snapshot {
                if let Feed::Line(lf) = feed {
                    if let Err(e) = lf.call(line.clone()) {
                        line_errors.borrow_mut().push(e);
                    }
                }
            }
            Ok(())
        };
        let scan_result = match bytes {
            Some(b) => line_scanner.on_data(b, sink),
            None => line_scanner.close(sink),
        };
        if let Err(e) = scan_result {
            errors.push(e);
        }
        errors.extend(line_errors.into_inner());
    }

    fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.feeds = Arc::new(Vec::new());
        inner.stopped = true;
        drop(inner);
        self.stop_notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// `true` once no more dispatch will ever happen on this stream:
    /// either it never started (non-pipe), or it has already stopped.
    fn is_done(&self) -> bool {
        !self.has_started() || self.is_stopped()
    }

    /// Async `awaitStop`: returns once no more dispatch will happen.
    pub async fn await_stop(&self) {
        if self.is_done() {
            return;
        }
        WaitLoop::poll_until(AWAIT_STOP_SLEEP_SLICE, || self.is_done().then_some(())).await
    }

    /// Blocking `awaitStop`, for synchronous callers (`destroy`).
    pub fn await_stop_blocking(&self) {
        if self.is_done() {
            return;
        }
        WaitLoop::poll_until_blocking(AWAIT_STOP_SLEEP_SLICE, || self.is_done().then_some(()))
    }
}

fn combine_errors(mut errors: Vec<ProcessError>) -> Option<ProcessError> {
    if errors.is_empty() {
        return None;
    }
    let primary = errors.remove(0);
    Some(ProcessError::composite(primary, errors))
}

/// The pair of stream dispatchers a `Process` owns.
pub struct OutputDispatcher {
    pub stdout: StreamDispatch,
    pub stderr: StreamDispatch,
}

impl OutputDispatcher {
    pub fn new(stdout_is_pipe: bool, stderr_is_pipe: bool) -> OutputDispatcher {
        OutputDispatcher {
            stdout: StreamDispatch::new("feed.stdout", stdout_is_pipe),
            stderr: StreamDispatch::new("feed.stderr", stderr_is_pipe),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{LineFeed, RawFeed};
    use crate::handler::IgnoreHandler;
    use crate::segment::OutputSegment;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn non_pipe_stream_is_immediately_done() {
        let stream = StreamDispatch::new("feed.stdout", false);
        assert!(stream.is_done());
    }

    #[test]
    fn raw_feed_receives_segment_and_eos() {
        let stream = StreamDispatch::new("feed.stdout", true);
        let seen: Arc<StdMutex<Vec<Option<Vec<u8>>>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        stream.attach(vec![Feed::Raw(RawFeed::new(move |seg: Option<OutputSegment>| {
            seen2.lock().unwrap().push(seg.map(|s| s.to_bytes()));
            Ok(())
        }))]);
        assert!(stream.has_started());

        let mut scanner = None;
        stream.dispatch_bytes(Some(b"hello"), &mut scanner, &IgnoreHandler).unwrap();
        stream.dispatch_bytes(None, &mut scanner, &IgnoreHandler).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Some(b"hello".to_vec()));
        assert_eq!(seen[1], None);
        assert!(stream.is_stopped());
    }

    #[test]
    fn line_feed_splits_into_lines_and_eos() {
        let stream = StreamDispatch::new("feed.stdout", true);
        let seen: Arc<StdMutex<Vec<Option<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        stream.attach(vec![Feed::Line(LineFeed::new(move |line| {
            seen2.lock().unwrap().push(line);
            Ok(())
        }))]);

        let mut scanner = None;
        stream.dispatch_bytes(Some(b"first\nsecond"), &mut scanner, &IgnoreHandler).unwrap();
        stream.dispatch_bytes(None, &mut scanner, &IgnoreHandler).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Some("first".to_string()), Some("second".to_string()), None]
        );
    }

    #[test]
    fn attach_after_stop_is_a_no_op() {
        let stream = StreamDispatch::new("feed.stdout", true);
        let mut scanner = None;
        stream.attach(vec![Feed::Raw(RawFeed::new(|_| Ok(())))]);
        stream.dispatch_bytes(None, &mut scanner, &IgnoreHandler).unwrap();
        assert!(stream.is_stopped());

        let late_calls = Arc::new(StdMutex::new(0));
        let late_calls2 = late_calls.clone();
        stream.attach(vec![Feed::Raw(RawFeed::new(move |_| {
            *late_calls2.lock().unwrap() += 1;
            Ok(())
        }))]);
        assert_eq!(*late_calls.lock().unwrap(), 0);
    }

    #[test]
    fn duplicate_attach_of_same_feed_is_deduped() {
        let stream = StreamDispatch::new("feed.stdout", true);
        let calls = Arc::new(StdMutex::new(0));
        let calls2 = calls.clone();
        let feed = Feed::Raw(RawFeed::new(move |_| {
            *calls2.lock().unwrap() += 1;
            Ok(())
        }));
        stream.attach(vec![feed.clone()]);
        stream.attach(vec![feed]);

        let mut scanner = None;
        stream.dispatch_bytes(Some(b"x"), &mut scanner, &IgnoreHandler).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn unswallowed_error_stops_the_stream_and_is_returned() {
        struct Propagate;
        impl ExceptionHandler for Propagate {
            fn on_exception(&self, _: &str, _: &ProcessError) -> bool {
                false
            }
        }
        let stream = StreamDispatch::new("feed.stdout", true);
        stream.attach(vec![Feed::Raw(RawFeed::new(|_| {
            Err(ProcessError::Io("boom".into()))
        }))]);

        let mut scanner = None;
        let result = stream.dispatch_bytes(Some(b"x"), &mut scanner, &Propagate);
        assert!(result.is_err());
        assert!(stream.is_stopped());
    }

    #[tokio::test]
    async fn await_stop_returns_once_stream_stops() {
        let stream = Arc::new(StreamDispatch::new("feed.stdout", true));
        stream.attach(vec![Feed::Raw(RawFeed::new(|_| Ok(())))]);

        let waiter = stream.clone();
        let handle = tokio::spawn(async move {
            waiter.await_stop().await;
        });

        let mut scanner = None;
        stream.dispatch_bytes(None, &mut scanner, &IgnoreHandler).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
