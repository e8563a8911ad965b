//! Public entry point: assembles command/args/env/cwd/stdio/signal/handler
//! and either spawns a live [`Process`] or drives an [`OutputRecord`] via
//! the collector.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::collector::{self, Input, OutputOptions, OutputRecord};
use crate::current::Current;
use crate::error::Result;
use crate::handler::{ExceptionHandler, IgnoreHandler};
use crate::process::Process;
use crate::stdio::{Stdio, StdioConfig};

/// Builds a child-process invocation.
pub struct ProcessBuilder {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    destroy_signal: i32,
    handler: Arc<dyn ExceptionHandler>,
}

impl ProcessBuilder {
    pub fn new(command: impl Into<String>) -> ProcessBuilder {
        ProcessBuilder {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: Current::environment(),
            stdin: Stdio::default(),
            stdout: Stdio::default(),
            stderr: Stdio::default(),
            destroy_signal: libc::SIGTERM,
            handler: Arc::new(IgnoreHandler),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.env.clear();
        self
    }

    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    /// `destroy_signal` must be `SIGTERM` or `SIGKILL` (spec §4.6 "Signal
    /// surface").
    pub fn destroy_signal(mut self, signal: i32) -> Self {
        self.destroy_signal = signal;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Spawn and return a live handle; the caller owns stdout/stderr/input
    /// wiring from here.
    pub fn spawn(self) -> Result<Process> {
        let stdio = StdioConfig::build(self.stdin, self.stdout, self.stderr, None)?;
        Process::spawn(self.command, self.args, self.cwd, self.env, stdio, self.destroy_signal, self.handler)
    }

    /// Drive the process to completion and collect its output in one call
    /// (spec §4.7). Consumes any `stdin`/`stdout`/`stderr` overrides — the
    /// collector always forces output mode.
    pub async fn output(self, input: Option<Input>) -> Result<OutputRecord> {
        self.output_with(OutputOptions { input, ..OutputOptions::default() }).await
    }

    pub async fn output_with(self, options: OutputOptions) -> Result<OutputRecord> {
        collector::collect(self.command, self.args, self.cwd, self.env, self.destroy_signal, options).await
    }
}
