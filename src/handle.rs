//! `StdioHandle` (C2): owns the parent-side endpoints and the dup2 plan for
//! a spawn. Unix-only — on Windows, stream wiring is delegated to
//! `std::process::Command` (the `CreateProcess` oracle, spec §6), which
//! needs no explicit dup2 plan.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::error::{ProcessError, Result};
use crate::stdio::{Stdio, StdioConfig, paths_canonically_equal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StdSlot {
    Stdin,
    Stdout,
    Stderr,
}

impl StdSlot {
    fn std_fd(self) -> RawFd {
        match self {
            StdSlot::Stdin => libc::STDIN_FILENO,
            StdSlot::Stdout => libc::STDOUT_FILENO,
            StdSlot::Stderr => libc::STDERR_FILENO,
        }
    }
}

/// Ordered mapping of parent-owned fds onto the child's three standard fds
/// (spec: "dup2 plan").
pub type DupPlan = Vec<(RawFd, RawFd)>;

/// Owns every descriptor opened for one spawn: the parent-side pipe ends
/// `Process` reads/writes after spawn, and the child-side fds that only
/// need to survive until the dup2 plan has run in the child.
pub struct StdioHandle {
    stdin_parent: Option<OwnedFd>,
    stdout_parent: Option<OwnedFd>,
    stderr_parent: Option<OwnedFd>,
    child_fds: Vec<OwnedFd>,
    dup_plan: DupPlan,
    closed: bool,
}

impl StdioHandle {
    fn empty() -> StdioHandle {
        StdioHandle {
            stdin_parent: None,
            stdout_parent: None,
            stderr_parent: None,
            child_fds: Vec::new(),
            dup_plan: Vec::new(),
            closed: false,
        }
    }

    /// Open every configured slot. On any failure, everything opened so far
    /// is closed before the error is returned (spec §4.2 / §7 "at-most-once
    /// release").
    pub fn open(config: &StdioConfig) -> Result<StdioHandle> {
        let mut handle = StdioHandle::empty();
        match handle.open_all(config) {
            Ok(()) => Ok(handle),
            Err(e) => {
                handle.close();
                Err(e)
            }
        }
    }

    fn open_all(&mut self, config: &StdioConfig) -> Result<()> {
        self.open_slot(StdSlot::Stdin, &config.stdin)?;

        if let (
            Stdio::File { path: out_path, append: out_append },
            Stdio::File { path: err_path, .. },
        ) = (&config.stdout, &config.stderr)
        {
            if paths_canonically_equal(out_path, err_path) {
                let fd = open_output_file(out_path, *out_append)?;
                let raw = fd.as_raw_fd();
                self.child_fds.push(fd);
                self.dup_plan.push((raw, StdSlot::Stdout.std_fd()));
                self.dup_plan.push((raw, StdSlot::Stderr.std_fd()));
                return Ok(());
            }
        }

        self.open_slot(StdSlot::Stdout, &config.stdout)?;
        self.open_slot(StdSlot::Stderr, &config.stderr)?;
        Ok(())
    }

    fn open_slot(&mut self, slot: StdSlot, stdio: &Stdio) -> Result<()> {
        let dest = slot.std_fd();
        match stdio {
            Stdio::Inherit => {}
            Stdio::Pipe => {
                let (read_fd, write_fd) = create_pipe()?;
                let (parent_fd, child_fd) = if slot == StdSlot::Stdin {
                    (write_fd, read_fd)
                } else {
                    (read_fd, write_fd)
                };
                let child_raw = child_fd.as_raw_fd();
                self.set_parent(slot, parent_fd);
                self.child_fds.push(child_fd);
                self.dup_plan.push((child_raw, dest));
            }
            Stdio::Null => {
                let fd = open_null(slot != StdSlot::Stdin)?;
                let raw = fd.as_raw_fd();
                self.child_fds.push(fd);
                self.dup_plan.push((raw, dest));
            }
            Stdio::File { path, append } => {
                let fd = if slot == StdSlot::Stdin {
                    open_input_file(path)?
                } else {
                    open_output_file(path, *append)?
                };
                let raw = fd.as_raw_fd();
                self.child_fds.push(fd);
                self.dup_plan.push((raw, dest));
            }
        }
        Ok(())
    }

    fn set_parent(&mut self, slot: StdSlot, fd: OwnedFd) {
        match slot {
            StdSlot::Stdin => self.stdin_parent = Some(fd),
            StdSlot::Stdout => self.stdout_parent = Some(fd),
            StdSlot::Stderr => self.stderr_parent = Some(fd),
        }
    }

    /// The ordered dup2 plan the spawn engine replays in the child (either
    /// via `posix_spawn_file_actions_adddup2` or a raw `dup2` loop after
    /// `fork`).
    pub(crate) fn dup_plan(&self) -> &DupPlan {
        &self.dup_plan
    }

    /// Take the parent-side stdin pipe (write end), if stdin was `Pipe`.
    pub(crate) fn take_stdin_parent(&mut self) -> Option<OwnedFd> {
        self.stdin_parent.take()
    }

    /// Take the parent-side stdout pipe (read end), if stdout was `Pipe`.
    pub(crate) fn take_stdout_parent(&mut self) -> Option<OwnedFd> {
        self.stdout_parent.take()
    }

    /// Take the parent-side stderr pipe (read end), if stderr was `Pipe`.
    pub(crate) fn take_stderr_parent(&mut self) -> Option<OwnedFd> {
        self.stderr_parent.take()
    }

    /// Close the child-side descriptors; called by the spawn engine in the
    /// parent immediately after a successful spawn, since only the child
    /// needs them from that point on.
    pub(crate) fn close_child_fds(&mut self) {
        self.child_fds.clear();
    }

    /// Close every remaining owned descriptor. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.child_fds.clear();
        self.stdin_parent.take();
        self.stdout_parent.take();
        self.stderr_parent.take();
        self.closed = true;
    }
}

impl Drop for StdioHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn create_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: `fds` is a valid, appropriately-sized out-parameter.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if rc != 0 {
        return Err(ProcessError::io("pipe2", std::io::Error::last_os_error()));
    }
    // SAFETY: `pipe2` returned two freshly-opened, uniquely-owned fds.
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

fn open_null(write: bool) -> Result<OwnedFd> {
    open_raw(Path::new("/dev/null"), write, false)
}

fn open_input_file(path: &Path) -> Result<OwnedFd> {
    if !path.exists() {
        return Err(ProcessError::FileNotFound(format!(
            "stdin file not found: {}",
            path.display()
        )));
    }
    open_raw(path, false, false)
}

fn open_output_file(path: &Path, append: bool) -> Result<OwnedFd> {
    open_raw(path, true, append)
}

fn open_raw(path: &Path, write: bool, append: bool) -> Result<OwnedFd> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ProcessError::Io(format!("invalid path: {}", path.display())))?;

    let flags = if write {
        let mut f = libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC;
        f |= if append { libc::O_APPEND } else { libc::O_TRUNC };
        f
    } else {
        libc::O_RDONLY | libc::O_CLOEXEC
    };

    // SAFETY: `c_path` is a valid NUL-terminated C string for the duration
    // of this call.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o644) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        return Err(match err.kind() {
            std::io::ErrorKind::NotFound => {
                ProcessError::FileNotFound(format!("{}: {}", path.display(), err))
            }
            std::io::ErrorKind::PermissionDenied => {
                ProcessError::AccessDenied(format!("{}: {}", path.display(), err))
            }
            _ => ProcessError::io(format!("open {}", path.display()), err),
        });
    }
    // SAFETY: `open` returned a freshly-opened, uniquely-owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
