//! `OutputCollector` (C7): drives a `Process` to completion in one call and
//! returns a composed `OutputRecord`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::feed::{Feed, RawFeed};
use crate::handler::IgnoreHandler;
use crate::process::Process;
use crate::segment::OutputSegment;
use crate::stdio::{OutputModeHint, StdioConfig};
use crate::wait_loop::WaitLoop;

pub const DEFAULT_MAX_BUFFER: usize = 1 << 16;
pub const MIN_MAX_BUFFER: usize = 32 * 1024;
pub const MAX_MAX_BUFFER: usize = i32::MAX as usize;
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 250;
pub const MIN_TIMEOUT_MILLIS: u64 = 250;

const POST_EXIT_GRACE_TICKS: u32 = 5;
const PHASE_B_SLEEP_SLICE: Duration = Duration::from_millis(100);
const PHASE_A_SLACK: Duration = Duration::from_millis(25);

/// Either raw bytes or a UTF-8 string to feed the child's stdin. At most one
/// is set; setting one clears the other (spec §4.7: "at most one, last-set
/// wins").
pub enum Input {
    Bytes(Vec<u8>),
    Utf8(String),
}

/// Options recognized by [`collect`].
pub struct OutputOptions {
    pub max_buffer: usize,
    pub timeout: Duration,
    pub input: Option<Input>,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions {
            max_buffer: DEFAULT_MAX_BUFFER,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MILLIS),
            input: None,
        }
    }
}

impl OutputOptions {
    fn normalized_max_buffer(&self) -> usize {
        self.max_buffer.clamp(MIN_MAX_BUFFER, MAX_MAX_BUFFER)
    }

    fn normalized_timeout(&self) -> Duration {
        self.timeout.max(Duration::from_millis(MIN_TIMEOUT_MILLIS))
    }
}

/// Stable-column textual process summary (spec §4.6 "ProcessInfo").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub exit_code: Option<i32>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdio: StdioConfig,
    pub destroy_signal: i32,
}

impl std::fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "pid: {}", self.pid)?;
        writeln!(
            f,
            "exitCode: {}",
            self.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "not exited".to_string())
        )?;
        writeln!(f, "command: {}", self.command)?;
        writeln!(f, "args: {}", self.args.join(" "))?;
        writeln!(f, "cwd: {}", self.cwd.as_ref().map(|p| p.display().to_string()).unwrap_or_default())?;
        writeln!(f, "stdio: {:?}", self.stdio)?;
        write!(f, "destroySignal: {}", self.destroy_signal)
    }
}

/// The composed result of [`collect`].
pub struct OutputRecord {
    pub stdout: OutputSegment,
    pub stderr: OutputSegment,
    pub process_error: Option<String>,
    pub process_info: ProcessInfo,
}

/// Capped raw feed that accumulates consolidated segments until `max_buffer`
/// is reached, then keeps counting without copying further bytes.
struct OutputFeedBuffer {
    max_buffer: usize,
    segments: Mutex<Vec<Option<OutputSegment>>>,
    total: AtomicUsize,
    max_size_exceeded: AtomicBool,
    has_ended: AtomicBool,
}

impl OutputFeedBuffer {
    fn new(max_buffer: usize) -> Arc<OutputFeedBuffer> {
        Arc::new(OutputFeedBuffer {
            max_buffer,
            segments: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            max_size_exceeded: AtomicBool::new(false),
            has_ended: AtomicBool::new(false),
        })
    }

    fn on_segment(&self, segment: Option<OutputSegment>) -> Result<()> {
        match segment {
            None => {
                self.has_ended.store(true, Ordering::SeqCst);
            }
            Some(seg) => {
                let already = self.total.load(Ordering::SeqCst);
                if already >= self.max_buffer {
                    self.max_size_exceeded.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                let allowed = (self.max_buffer - already).min(seg.size());
                let kept = if allowed == seg.size() {
                    seg
                } else {
                    self.max_size_exceeded.store(true, Ordering::SeqCst);
                    let mut bytes = vec![0u8; allowed];
                    seg.copy_into(&mut bytes, 0, 0, allowed);
                    OutputSegment::from_bytes(&bytes)
                };
                self.total.fetch_add(kept.size(), Ordering::SeqCst);
                self.segments.lock().unwrap().push(Some(kept));
            }
        }
        Ok(())
    }

    fn has_ended(&self) -> bool {
        self.has_ended.load(Ordering::SeqCst)
    }

    fn max_size_exceeded(&self) -> bool {
        self.max_size_exceeded.load(Ordering::SeqCst)
    }

    /// Consolidate and reset.
    fn do_final(&self) -> Result<OutputSegment> {
        let parts = std::mem::take(&mut *self.segments.lock().unwrap());
        Ok(OutputSegment::consolidate(parts)?.unwrap_or_else(OutputSegment::empty))
    }
}

/// Drives `command`/`args`/`cwd`/`env` through spawn, capture, and teardown
/// in one call (spec §4.7).
pub async fn collect(
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    destroy_signal: i32,
    options: OutputOptions,
) -> Result<OutputRecord> {
    let max_buffer = options.normalized_max_buffer();
    let timeout = options.normalized_timeout();

    let stdio = StdioConfig::build(
        Default::default(),
        Default::default(),
        Default::default(),
        Some(OutputModeHint { has_input: options.input.is_some() }),
    )?;

    let process = Process::spawn(
        command,
        args,
        cwd,
        env,
        stdio,
        destroy_signal,
        Arc::new(IgnoreHandler),
    )?;

    let stdout_buf = OutputFeedBuffer::new(max_buffer);
    let stderr_buf = OutputFeedBuffer::new(max_buffer);
    attach_buffer(&process, Side::Stdout, stdout_buf.clone());
    attach_buffer(&process, Side::Stderr, stderr_buf.clone());

    if let Some(input) = options.input {
        if let Some(writer) = &process.input {
            write_input(writer, input).await?;
            writer.close().await;
        }
    }

    let phase_a_budget = timeout.saturating_sub(PHASE_A_SLACK);
    WaitLoop::wait_for(phase_a_budget, Duration::from_millis(5), || {
        let stdout_started = process.stdout_dispatch().has_started();
        let stderr_started = process.stderr_dispatch().has_started();
        (stdout_started && stderr_started).then_some(())
    })
    .await;

    let phase_b_deadline = tokio::time::Instant::now() + timeout;
    let mut observed_exit = false;
    let mut post_exit_ticks = 0u32;
    loop {
        if stdout_buf.max_size_exceeded() || stderr_buf.max_size_exceeded() {
            break;
        }
        if process.exit_code_or_null().is_some() {
            observed_exit = true;
            if stdout_buf.has_ended() && stderr_buf.has_ended() {
                break;
            }
            post_exit_ticks += 1;
            if post_exit_ticks >= POST_EXIT_GRACE_TICKS {
                break;
            }
        }
        if tokio::time::Instant::now() >= phase_b_deadline {
            break;
        }
        tokio::time::sleep(PHASE_B_SLEEP_SLICE).await;
    }

    process.destroy();

    process.stdout_dispatch().await_stop().await;
    process.stderr_dispatch().await_stop().await;
    let exit_code = process.wait_for_async().await;

    let max_buffer_exceeded = stdout_buf.max_size_exceeded() || stderr_buf.max_size_exceeded();
    let process_error = if max_buffer_exceeded {
        Some(format!("maxBuffer[{max_buffer}] exceeded"))
    } else if !observed_exit {
        Some("waitFor timed out".to_string())
    } else {
        None
    };

    Ok(OutputRecord {
        stdout: stdout_buf.do_final()?,
        stderr: stderr_buf.do_final()?,
        process_error,
        process_info: ProcessInfo {
            pid: process.pid(),
            exit_code: Some(exit_code),
            command: process.command().to_string(),
            args: process.args().to_vec(),
            cwd: process.cwd().map(PathBuf::from),
            stdio: process.stdio().clone(),
            destroy_signal: process.destroy_signal(),
        },
    })
}

enum Side {
    Stdout,
    Stderr,
}

fn attach_buffer(process: &Process, side: Side, buf: Arc<OutputFeedBuffer>) {
    let feed = Feed::Raw(RawFeed::new(move |segment| buf.on_segment(segment)));
    match side {
        Side::Stdout => process.stdout(vec![feed]),
        Side::Stderr => process.stderr(vec![feed]),
    }
}

async fn write_input(writer: &crate::input::WriteStream, input: Input) -> Result<()> {
    match input {
        Input::Bytes(bytes) => writer.write_all(&bytes).await,
        Input::Utf8(text) => writer.write_all(text.as_bytes()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_stdout_and_stderr_and_exit_code() {
        let record = collect(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "echo out; echo err 1>&2; exit 3".to_string()],
            None,
            HashMap::new(),
            libc::SIGTERM,
            OutputOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(record.stdout.utf8().as_ref(), "out\n");
        assert_eq!(record.stderr.utf8().as_ref(), "err\n");
        assert_eq!(record.process_info.exit_code, Some(3));
        assert_eq!(record.process_error, None);
        assert!(record.process_info.to_string().contains("exitCode: 3"));
    }

    #[tokio::test]
    async fn writes_input_and_closes_stdin() {
        let record = collect(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "cat".to_string()],
            None,
            HashMap::new(),
            libc::SIGTERM,
            OutputOptions { input: Some(Input::Utf8("ping".to_string())), ..OutputOptions::default() },
        )
        .await
        .unwrap();

        assert_eq!(record.stdout.utf8().as_ref(), "ping");
    }

    #[tokio::test]
    async fn max_buffer_exceeded_is_reported() {
        let record = collect(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "yes | head -c 200000".to_string()],
            None,
            HashMap::new(),
            libc::SIGTERM,
            OutputOptions { max_buffer: MIN_MAX_BUFFER, ..OutputOptions::default() },
        )
        .await
        .unwrap();

        assert_eq!(record.process_error.as_deref(), Some("maxBuffer[32768] exceeded"));
        assert!(record.stdout.size() <= MIN_MAX_BUFFER);
    }

    #[tokio::test]
    async fn timeout_exhaustion_reports_wait_for_timed_out() {
        let record = collect(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "sleep 2; exit 42".to_string()],
            None,
            HashMap::new(),
            libc::SIGTERM,
            OutputOptions { timeout: Duration::from_millis(250), ..OutputOptions::default() },
        )
        .await
        .unwrap();

        assert_eq!(record.process_error.as_deref(), Some("waitFor timed out"));
        assert_eq!(record.stdout.utf8().as_ref(), "");
        assert_eq!(record.process_info.exit_code, Some(128 + libc::SIGTERM));
    }
}
