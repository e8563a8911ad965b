//! Cross-platform child-process spawning, stdio plumbing, and output
//! dispatch.
//!
//! The public surface is [`ProcessBuilder`], which assembles a command
//! invocation and either [`ProcessBuilder::spawn`]s a live [`Process`] (for
//! callers that want to stream stdout/stderr themselves via [`Feed`]s) or
//! drives it to completion with [`ProcessBuilder::output`] and gets back a
//! single [`OutputRecord`].
//!
//! Internals, bottom-up:
//! - [`stdio`] / [`handle`]: validate the three-stream configuration, then
//!   open the actual descriptors and build the dup2 plan a spawn replays.
//! - [`spawn`]: the engine itself — `posix_spawn` fast path, fork+exec
//!   fallback, CLOEXEC self-pipe handshake.
//! - [`segment`] / [`feed`] / [`line_scanner`] / [`dispatcher`]: the output
//!   pipeline — byte segments, consumer callbacks, UTF-8 line splitting, and
//!   the per-stream router that ties them together.
//! - [`process`]: the public handle, its reader workers, and the reaper.
//! - [`collector`]: one-shot output capture (`output()`'s implementation).
//! - [`wait_loop`]: the bounded-poll primitive everything above waits with.
//!
//! This crate currently implements the engine for Unix targets only; see
//! `DESIGN.md` for why a Windows backend is not part of this pass.

#[cfg(not(unix))]
compile_error!("childproc currently implements its spawn engine for unix targets only");

pub mod builder;
pub mod collector;
pub mod current;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod handle;
pub mod handler;
pub mod input;
pub mod line_scanner;
pub mod process;
pub mod segment;
pub mod spawn;
pub mod stdio;
pub mod wait_loop;

pub use builder::ProcessBuilder;
pub use collector::{Input, OutputOptions, OutputRecord, ProcessInfo};
pub use current::Current;
pub use error::{ProcessError, Result};
pub use feed::{Feed, LineFeed, RawFeed};
pub use handler::{ExceptionHandler, IgnoreHandler};
pub use process::Process;
pub use segment::OutputSegment;
pub use stdio::{Stdio, StdioConfig};
