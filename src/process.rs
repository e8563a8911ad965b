//! `Process` (C6): the public handle returned by a spawn. Owns the
//! `StdioHandle`, the two reader workers, and the `OutputDispatcher`.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;

use crate::dispatcher::{OutputDispatcher, StreamDispatch};
use crate::error::{ProcessError, Result};
use crate::feed::Feed;
use crate::handle::StdioHandle;
use crate::handler::ExceptionHandler;
use crate::input::WriteStream;
use crate::spawn;
use crate::stdio::StdioConfig;
use crate::wait_loop::WaitLoop;

const READER_BUF_SIZE: usize = 8 * 1024;
const DEFAULT_WAIT_SLEEP_SLICE: Duration = Duration::from_millis(100);

/// No exit observed yet.
const NOT_EXITED: i32 = i32::MIN;

struct Shared {
    pid: libc::pid_t,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    stdio: StdioConfig,
    destroy_signal: i32,
    start_time: Instant,
    handler: Arc<dyn ExceptionHandler>,
    dispatcher: OutputDispatcher,
    handle: Mutex<Option<StdioHandle>>,
    exit_code: AtomicI32,
    destroying: AtomicBool,
}

impl Shared {
    fn exit_code_or_null(&self) -> Option<i32> {
        match self.exit_code.load(Ordering::SeqCst) {
            NOT_EXITED => None,
            code => Some(code),
        }
    }

    fn is_alive(&self) -> bool {
        self.exit_code_or_null().is_none() && signal::kill(Pid::from_raw(self.pid), None).is_ok()
    }

    /// Deliver `destroy_signal`, close the handle, let the readers observe
    /// EOF. Idempotent; errors are routed through `handler` with
    /// `context="destroy"`.
    fn destroy_protected(&self) {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_alive() {
            let sig = Signal::try_from(self.destroy_signal).ok();
            if let Err(errno) = signal::kill(Pid::from_raw(self.pid), sig) {
                let err = ProcessError::io("kill", std::io::Error::from_raw_os_error(errno as i32));
                self.handler.on_exception("destroy", &err);
            }
        }
        if let Some(mut handle) = self.handle.lock().unwrap().take() {
            handle.close();
        }
    }
}

/// A spawned child process.
pub struct Process {
    shared: Arc<Shared>,
    pub input: Option<WriteStream>,
}

impl Process {
    /// Runs the full spawn sequence (spec §4.5 step 5 onward): spawn via
    /// `SpawnEngine`, build the `Process`, close child-side fds, spawn the
    /// reaper and the reader workers.
    pub fn spawn(
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
        stdio: StdioConfig,
        destroy_signal: i32,
        handler: Arc<dyn ExceptionHandler>,
    ) -> Result<Process> {
        let mut handle = StdioHandle::open(&stdio)?;
        let env_pairs: Vec<(String, String)> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let outcome = spawn::spawn(&command, &args, cwd.as_deref(), &env_pairs, &mut handle)?;

        let stdout_parent = handle.take_stdout_parent();
        let stderr_parent = handle.take_stderr_parent();
        let stdin_parent = handle.take_stdin_parent();

        let dispatcher = OutputDispatcher::new(stdout_parent.is_some(), stderr_parent.is_some());

        let shared = Arc::new(Shared {
            pid: outcome.pid,
            command,
            args,
            cwd,
            env,
            stdio,
            destroy_signal,
            start_time: Instant::now(),
            handler,
            dispatcher,
            handle: Mutex::new(Some(handle)),
            exit_code: AtomicI32::new(NOT_EXITED),
            destroying: AtomicBool::new(false),
        });

        spawn_reaper(shared.clone());
        if let Some(fd) = stdout_parent {
            spawn_reader(shared.clone(), fd, ReaderSide::Stdout);
        }
        if let Some(fd) = stderr_parent {
            spawn_reader(shared.clone(), fd, ReaderSide::Stderr);
        }

        let input = match stdin_parent {
            Some(fd) => Some(WriteStream::new(fd)?),
            None => None,
        };

        Ok(Process { shared, input })
    }

    pub fn pid(&self) -> i32 {
        self.shared.pid
    }

    pub fn command(&self) -> &str {
        &self.shared.command
    }

    pub fn args(&self) -> &[String] {
        &self.shared.args
    }

    pub fn cwd(&self) -> Option<&std::path::Path> {
        self.shared.cwd.as_deref()
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.shared.env
    }

    pub fn stdio(&self) -> &StdioConfig {
        &self.shared.stdio
    }

    pub fn destroy_signal(&self) -> i32 {
        self.shared.destroy_signal
    }

    pub fn start_time(&self) -> Instant {
        self.shared.start_time
    }

    pub fn exit_code_or_null(&self) -> Option<i32> {
        self.shared.exit_code_or_null()
    }

    pub fn exit_code(&self) -> Result<i32> {
        self.exit_code_or_null()
            .ok_or_else(|| ProcessError::IllegalState("process has not exited".into()))
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Attach feeds to stdout.
    pub fn stdout(&self, feeds: Vec<Feed>) {
        self.shared.dispatcher.stdout.attach(feeds);
    }

    /// Attach feeds to stderr.
    pub fn stderr(&self, feeds: Vec<Feed>) {
        self.shared.dispatcher.stderr.attach(feeds);
    }

    pub fn stdout_dispatch(&self) -> &StreamDispatch {
        &self.shared.dispatcher.stdout
    }

    pub fn stderr_dispatch(&self) -> &StreamDispatch {
        &self.shared.dispatcher.stderr
    }

    /// Blocking wait, unbounded.
    pub fn wait_for(&self) -> i32 {
        WaitLoop::poll_until_blocking(DEFAULT_WAIT_SLEEP_SLICE, || self.shared.exit_code_or_null())
    }

    /// Blocking wait, bounded.
    pub fn wait_for_timeout(&self, timeout: Duration) -> Option<i32> {
        WaitLoop::wait_for_blocking(timeout, DEFAULT_WAIT_SLEEP_SLICE, || self.shared.exit_code_or_null())
    }

    /// Cooperative wait, unbounded.
    pub async fn wait_for_async(&self) -> i32 {
        WaitLoop::poll_until(DEFAULT_WAIT_SLEEP_SLICE, || self.shared.exit_code_or_null()).await
    }

    /// Cooperative wait, bounded.
    pub async fn wait_for_async_timeout(&self, timeout: Duration) -> Option<i32> {
        WaitLoop::wait_for(timeout, DEFAULT_WAIT_SLEEP_SLICE, || self.shared.exit_code_or_null()).await
    }

    /// Idempotent. Delivers `destroy_signal`, closes the handle; the reader
    /// workers observe EOF and drive both dispatcher streams to `stopped`.
    pub fn destroy(&self) {
        self.shared.destroy_protected();
    }

    pub fn close(&self) {
        self.destroy();
    }
}

fn spawn_reaper(shared: Arc<Shared>) {
    tokio::task::spawn_blocking(move || {
        let code = match wait::waitpid(Pid::from_raw(shared.pid), None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
            Ok(_) | Err(_) => -1,
        };
        shared.exit_code.store(code, Ordering::SeqCst);
    });
}

#[derive(Clone, Copy)]
enum ReaderSide {
    Stdout,
    Stderr,
}

impl ReaderSide {
    fn dispatch(self, shared: &Shared) -> &StreamDispatch {
        match self {
            ReaderSide::Stdout => &shared.dispatcher.stdout,
            ReaderSide::Stderr => &shared.dispatcher.stderr,
        }
    }
}

fn spawn_reader(shared: Arc<Shared>, fd: std::os::fd::OwnedFd, side: ReaderSide) {
    tokio::spawn(async move {
        side.dispatch(&shared).await_start().await;

        let async_fd = match AsyncFd::new(fd) {
            Ok(a) => a,
            Err(e) => {
                let err = ProcessError::io("register reader fd", e);
                shared.handler.on_exception(side.dispatch(&shared).context_label(), &err);
                let mut scanner = None;
                let _ = side.dispatch(&shared).dispatch_bytes(None, &mut scanner, shared.handler.as_ref());
                return;
            }
        };

        let mut buf = [0u8; READER_BUF_SIZE];
        let mut scanner = None;
        loop {
            let mut guard = match async_fd.readable().await {
                Ok(g) => g,
                Err(_) => break,
            };
            let read_result = guard.try_io(|inner| {
                let raw = inner.as_raw_fd();
                // SAFETY: `buf` is a valid, appropriately-sized buffer.
                let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n >= 0 { Ok(n as usize) } else { Err(std::io::Error::last_os_error()) }
            });

            match read_result {
                Ok(Ok(0)) => {
                    let _ = side.dispatch(&shared).dispatch_bytes(None, &mut scanner, shared.handler.as_ref());
                    break;
                }
                Ok(Ok(n)) => {
                    if side
                        .dispatch(&shared)
                        .dispatch_bytes(Some(&buf[..n]), &mut scanner, shared.handler.as_ref())
                        .is_err()
                    {
                        // Handler did not swallow: deferred, non-immediate
                        // teardown (spec §4.6 "onError" — the reader thread
                        // is the throwing thread, so destroy is deferred).
                        let shared2 = shared.clone();
                        tokio::spawn(async move { shared2.destroy_protected() });
                        break;
                    }
                }
                Ok(Err(e)) => {
                    let err = ProcessError::io("read stream", e);
                    shared.handler.on_exception(side.dispatch(&shared).context_label(), &err);
                    let _ = side.dispatch(&shared).dispatch_bytes(None, &mut scanner, shared.handler.as_ref());
                    break;
                }
                Err(_would_block) => continue,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{LineFeed, RawFeed};
    use crate::handler::IgnoreHandler;
    use crate::stdio::{OutputModeHint, Stdio};
    use std::sync::Mutex as StdMutex;

    fn spawn_sh(script: &str) -> Process {
        let stdio =
            StdioConfig::build(Stdio::Null, Stdio::Pipe, Stdio::Pipe, Some(OutputModeHint { has_input: false }))
                .unwrap();
        Process::spawn(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            None,
            HashMap::new(),
            stdio,
            libc::SIGTERM,
            Arc::new(IgnoreHandler),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn spawn_and_wait_reports_exit_code() {
        let process = spawn_sh("exit 7");
        let code = process.wait_for_async().await;
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn stdout_line_feed_receives_output_then_eos() {
        let process = spawn_sh("echo hello; echo world");
        let lines: Arc<StdMutex<Vec<Option<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let lines2 = lines.clone();
        process.stdout(vec![Feed::Line(LineFeed::new(move |line| {
            lines2.lock().unwrap().push(line);
            Ok(())
        }))]);
        process.wait_for_async().await;
        process.stdout_dispatch().await_stop().await;
        let lines = lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![Some("hello".to_string()), Some("world".to_string()), None]
        );
    }

    #[tokio::test]
    async fn stderr_raw_feed_receives_bytes() {
        let process = spawn_sh("echo oops 1>&2");
        let seen: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        process.stderr(vec![Feed::Raw(RawFeed::new(move |seg| {
            if let Some(seg) = seg {
                seen2.lock().unwrap().extend(seg.to_bytes());
            }
            Ok(())
        }))]);
        process.wait_for_async().await;
        process.stderr_dispatch().await_stop().await;
        assert_eq!(seen.lock().unwrap().as_slice(), b"oops\n");
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_kills_a_long_running_child() {
        let process = spawn_sh("sleep 30");
        assert!(process.is_alive());
        process.destroy();
        process.destroy();
        let code = process.wait_for_async().await;
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn chdir_to_nonexistent_directory_is_a_spawn_error() {
        let stdio = StdioConfig::build(Stdio::Null, Stdio::Null, Stdio::Null, None).unwrap();
        let err = Process::spawn(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "true".to_string()],
            Some(PathBuf::from("/no/such/directory")),
            HashMap::new(),
            stdio,
            libc::SIGTERM,
            Arc::new(IgnoreHandler),
        )
        .unwrap_err();
        match err {
            ProcessError::FileNotFound(msg) => {
                assert!(msg.contains("changeDir"), "message was: {msg}");
                assert!(msg.contains("/no/such/directory"), "message was: {msg}");
            }
            other => panic!("expected FileNotFound, got {other:?}"),
        }
    }
}
