//! `Stdio`/`StdioConfig` (C1): validate and normalize the three-stream
//! configuration before a spawn.

use std::path::{Path, PathBuf};

use crate::error::{ProcessError, Result};

/// User intent for one of the three standard streams.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Stdio {
    /// Child shares the parent's descriptor directly.
    Inherit,
    /// Parent owns a pipe to/from the child (default).
    Pipe,
    /// Child's stream is bound to the platform bit-bucket (`/dev/null`/`NUL`).
    Null,
    /// Child's stream is bound to a file; `append` is meaningful for output
    /// streams only (silently demoted to `false` for stdin, spec §3).
    File { path: PathBuf, append: bool },
}

impl Default for Stdio {
    fn default() -> Self {
        Stdio::Pipe
    }
}

/// Signals "output mode is active" to `StdioConfig::build`, and whether the
/// caller supplied input data (spec §4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputModeHint {
    pub has_input: bool,
}

/// The validated, normalized `(stdin, stdout, stderr)` triple a spawn will
/// actually use.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StdioConfig {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl StdioConfig {
    /// Validate and normalize `(stdin, stdout, stderr)` per spec §4.1.
    pub fn build(
        stdin: Stdio,
        stdout: Stdio,
        stderr: Stdio,
        output_mode: Option<OutputModeHint>,
    ) -> Result<StdioConfig> {
        let stdin = Self::normalize_stdin(stdin, output_mode)?;
        let stdout = Self::normalize_output(stdout, output_mode)?;
        let stderr = Self::normalize_output(stderr, output_mode)?;

        Self::reject_stdin_collision(&stdin, &stdout, &stderr)?;
        Self::ensure_output_parent_dirs(&stdout)?;
        Self::ensure_output_parent_dirs(&stderr)?;

        Ok(StdioConfig { stdin, stdout, stderr })
    }

    fn normalize_stdin(stdin: Stdio, output_mode: Option<OutputModeHint>) -> Result<Stdio> {
        let stdin = match (&output_mode, &stdin) {
            (Some(hint), _) if hint.has_input => Stdio::Pipe,
            (Some(_), Stdio::Pipe) => Stdio::Null,
            _ => stdin,
        };
        match stdin {
            Stdio::File { path, .. } => {
                validate_file_name(&path)?;
                // `append` is only meaningful for output streams.
                Ok(Stdio::File { path, append: false })
            }
            other => Ok(other),
        }
    }

    fn normalize_output(stdio: Stdio, output_mode: Option<OutputModeHint>) -> Result<Stdio> {
        if output_mode.is_some() {
            return Ok(Stdio::Pipe);
        }
        if let Stdio::File { path, .. } = &stdio {
            validate_file_name(path)?;
        }
        Ok(stdio)
    }

    fn ensure_output_parent_dirs(stdio: &Stdio) -> Result<()> {
        if let Stdio::File { path, .. } = stdio {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| ProcessError::io(format!("mkdirs {}", parent.display()), e))?;
                }
            }
        }
        Ok(())
    }

    /// A `File` stdin that shares the canonical path of the `File` stdout or
    /// stderr is rejected. A shared *output* file (stdout == stderr) is
    /// legal and handled by `StdioHandle::open` (merged descriptor).
    fn reject_stdin_collision(stdin: &Stdio, stdout: &Stdio, stderr: &Stdio) -> Result<()> {
        let Stdio::File { path: stdin_path, .. } = stdin else {
            return Ok(());
        };
        for output in [stdout, stderr] {
            if let Stdio::File { path: out_path, .. } = output {
                if paths_canonically_equal(stdin_path, out_path) {
                    return Err(ProcessError::Io(format!(
                        "stdin file {} collides with an output file",
                        stdin_path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Whether two paths resolve to the same file, falling back to a lexical
/// comparison when canonicalization fails (e.g. the file does not exist
/// yet, which is legal for an output `File` stdio).
pub(crate) fn paths_canonically_equal(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}

fn validate_file_name(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ProcessError::Io("stdio file path must not be empty".into()));
    }
    Ok(())
}
