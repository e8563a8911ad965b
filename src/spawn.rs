//! `SpawnEngine` (C5): builds `argv`/`envp`, picks fast-spawn (`posix_spawn`)
//! vs fork+exec, runs the CLOEXEC handshake, and classifies failures into
//! [`ProcessError`].

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{ProcessError, Result};
use crate::handle::StdioHandle;

/// One-byte tag identifying which step of the fork+exec child failed,
/// prefixed to the 4-byte big-endian errno written to the self-pipe.
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum FailureKind {
    Dup2 = 0x01,
    Chdir = 0x02,
    Exec = 0x03,
}

impl FailureKind {
    fn label(self) -> &'static str {
        match self {
            FailureKind::Dup2 => "dup2",
            FailureKind::Chdir => "chdir",
            FailureKind::Exec => "exec",
        }
    }
}

pub struct SpawnOutcome {
    pub pid: libc::pid_t,
}

/// Spawn `command` with `args`, `cwd`, and `env`, running the dup2 plan from
/// `handle` in the child. On success, closes the handle's child-side fds
/// (the parent no longer needs them) and returns the child pid.
pub fn spawn(
    command: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &[(String, String)],
    handle: &mut StdioHandle,
) -> Result<SpawnOutcome> {
    let argv = build_c_strings(std::iter::once(command).chain(args.iter().map(String::as_str)))?;
    let envp = build_c_strings(env.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().iter().map(String::as_str))?;

    // `posix_spawn_file_actions_addchdir_np` only registers the path; it
    // never stats it, so a bad `cwd` surfaces through the same return code
    // as a missing command on the fast-spawn path, and as a generic `Io` on
    // the fork+exec path unless the chdir failure is reclassified below.
    // Checking here, before either path runs, gives both a message that
    // actually names the directory.
    if let Some(cwd) = cwd {
        if !cwd.is_dir() {
            return Err(ProcessError::FileNotFound(format!(
                "changeDir failed: {} is not a directory",
                cwd.display()
            )));
        }
    }

    let result = if cfg!(target_os = "linux") {
        fast_spawn(command, cwd, &argv, &envp, handle)
    } else {
        fork_exec(command, cwd, &argv, &envp, handle)
    };

    match result {
        Ok(pid) => {
            handle.close_child_fds();
            Ok(SpawnOutcome { pid })
        }
        Err(e) => {
            handle.close();
            Err(e)
        }
    }
}

fn build_c_strings<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Vec<CString>> {
    parts
        .map(|s| CString::new(s).map_err(|_| ProcessError::Io(format!("argument contains a NUL byte: {s:?}"))))
        .collect()
}

fn argv_ptrs(argv: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Linux fast-spawn path using `posix_spawn`/`posix_spawnp` plus the glibc
/// `posix_spawn_file_actions_addchdir_np` extension for `cwd`.
#[cfg(target_os = "linux")]
fn fast_spawn(
    command: &str,
    cwd: Option<&Path>,
    argv: &[CString],
    envp: &[CString],
    handle: &StdioHandle,
) -> Result<libc::pid_t> {
    use std::mem::MaybeUninit;

    // SAFETY: `file_actions` is a valid out-parameter for `posix_spawn_file_actions_init`,
    // and is destroyed exactly once below regardless of which path returns.
    let mut file_actions = unsafe {
        let mut fa = MaybeUninit::<libc::posix_spawn_file_actions_t>::uninit();
        libc::posix_spawn_file_actions_init(fa.as_mut_ptr());
        fa.assume_init()
    };
    let result = (|| -> Result<libc::pid_t> {
        if let Some(cwd) = cwd {
            let c_cwd = CString::new(cwd.as_os_str().as_bytes())
                .map_err(|_| ProcessError::Io(format!("invalid cwd: {}", cwd.display())))?;
            // SAFETY: `file_actions` was just initialized above and is still live.
            let rc = unsafe { libc::posix_spawn_file_actions_addchdir_np(&mut file_actions, c_cwd.as_ptr()) };
            if rc != 0 {
                return Err(io_error_from_errno("chdir", rc));
            }
        }

        for &(child_fd, dest_fd) in handle.dup_plan() {
            // SAFETY: same invariant as above; fds come from `StdioHandle`'s
            // own open fds, valid for the lifetime of this call.
            let rc = unsafe { libc::posix_spawn_file_actions_adddup2(&mut file_actions, child_fd, dest_fd) };
            if rc != 0 {
                return Err(io_error_from_errno("dup2 file action", rc));
            }
        }

        let mut pid: libc::pid_t = 0;
        let argv_ptrs = argv_ptrs(argv);
        let envp_ptrs = argv_ptrs(envp);
        let c_command = CString::new(command)
            .map_err(|_| ProcessError::Io(format!("command contains a NUL byte: {command:?}")))?;

        // SAFETY: `argv_ptrs`/`envp_ptrs` are null-terminated arrays of valid
        // C strings kept alive for the duration of this call; `pid` is a
        // valid out-parameter.
        let rc = unsafe {
            if command.contains('/') {
                libc::posix_spawn(
                    &mut pid,
                    c_command.as_ptr(),
                    &file_actions,
                    std::ptr::null(),
                    argv_ptrs.as_ptr() as *const *mut libc::c_char,
                    envp_ptrs.as_ptr() as *const *mut libc::c_char,
                )
            } else {
                libc::posix_spawnp(
                    &mut pid,
                    c_command.as_ptr(),
                    &file_actions,
                    std::ptr::null(),
                    argv_ptrs.as_ptr() as *const *mut libc::c_char,
                    envp_ptrs.as_ptr() as *const *mut libc::c_char,
                )
            }
        };

        if rc != 0 || pid <= 0 {
            return Err(classify_spawn_error(command, rc));
        }
        Ok(pid)
    })();

    // SAFETY: `file_actions` was initialized above and not yet destroyed.
    unsafe {
        libc::posix_spawn_file_actions_destroy(&mut file_actions);
    }
    result
}

#[cfg(not(target_os = "linux"))]
fn fast_spawn(
    command: &str,
    cwd: Option<&Path>,
    argv: &[CString],
    envp: &[CString],
    handle: &StdioHandle,
) -> Result<libc::pid_t> {
    fork_exec(command, cwd, argv, envp, handle)
}

/// Portable fork+exec fallback with the CLOEXEC self-pipe handshake
/// (spec §4.5 step 4).
fn fork_exec(
    command: &str,
    cwd: Option<&Path>,
    argv: &[CString],
    envp: &[CString],
    handle: &StdioHandle,
) -> Result<libc::pid_t> {
    let (pipe_read, pipe_write) = open_cloexec_pipe()?;

    // SAFETY: `fork` is called with no other threads known to hold locks
    // that the (very narrow, async-signal-safe) child path below might
    // need; the child only calls dup2/chdir/execve/_exit before any
    // allocation that could deadlock on a forked mutex.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ProcessError::io("fork", std::io::Error::last_os_error()));
    }

    if pid == 0 {
        drop(pipe_read);
        run_child(command, cwd, argv, envp, handle, pipe_write.as_raw_fd());
        unreachable!("run_child always calls _exit");
    }

    drop(pipe_write);
    read_handshake(pipe_read, pid).map_err(|err| reclassify_child_failure(command, cwd, err))
}

/// The self-pipe handshake reports every child-side failure as a generic
/// `Io`. A chdir failure is reclassified into `FileNotFound` naming `cwd`
/// (the preflight check in `spawn` should already catch this case, but a
/// directory can be removed between that check and the fork, so this stays
/// as a second line of defense). On the fork+exec path (non-Linux only) an
/// exec failure is also re-resolved against `PATH` to recover the typed
/// `FileNotFound`/`AccessDenied` distinction `classify_spawn_error` gets for
/// free from `posix_spawn`'s return code.
fn reclassify_child_failure(command: &str, cwd: Option<&Path>, err: ProcessError) -> ProcessError {
    let is_chdir_failure = matches!(&err, ProcessError::Io(msg) if msg.starts_with("Child process chdir failure"));
    if is_chdir_failure {
        let cwd_display = cwd.map(Path::display).map(|d| d.to_string()).unwrap_or_default();
        return ProcessError::FileNotFound(format!("changeDir failed: {cwd_display}"));
    }

    reclassify_exec_failure(command, err)
}

/// On the fork+exec path (non-Linux only) re-resolve `command` against
/// `PATH` to recover the typed `FileNotFound`/`AccessDenied` distinction
/// `classify_spawn_error` gets for free from `posix_spawn`'s return code.
#[cfg(not(target_os = "linux"))]
fn reclassify_exec_failure(command: &str, err: ProcessError) -> ProcessError {
    let is_exec_failure = matches!(&err, ProcessError::Io(msg) if msg.starts_with("Child process exec failure"));
    if !is_exec_failure {
        return err;
    }
    match resolve_on_path(command) {
        None => ProcessError::FileNotFound(format!("command not found: {command}")),
        Some(path) => match is_executable_file(&path) {
            Ok(true) => err,
            Ok(false) => ProcessError::AccessDenied(format!("command not executable: {command}")),
            Err(_) => err,
        },
    }
}

#[cfg(target_os = "linux")]
fn reclassify_exec_failure(_command: &str, err: ProcessError) -> ProcessError {
    err
}

/// Whether `path` has any of the executable permission bits set, using
/// `anyhow::Context` to attach the path to a bare `stat` failure the way
/// `pty_fork.rs` annotates its own filesystem calls.
#[cfg(not(target_os = "linux"))]
fn is_executable_file(path: &Path) -> anyhow::Result<bool> {
    use anyhow::Context;
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(metadata.permissions().mode() & 0o111 != 0)
}

/// Runs entirely in the forked child. Never returns: either `execve`
/// succeeds (process image is replaced) or it writes an error record and
/// calls `_exit`.
fn run_child(command: &str, cwd: Option<&Path>, argv: &[CString], envp: &[CString], handle: &StdioHandle, error_fd: RawFd) -> ! {
    for &(child_fd, dest_fd) in handle.dup_plan() {
        // SAFETY: async-signal-safe libc call; fds were opened by the parent
        // before fork and are still valid in the child's copy of the table.
        if unsafe { libc::dup2(child_fd, dest_fd) } < 0 {
            write_failure_and_exit(error_fd, FailureKind::Dup2);
        }
    }

    if let Some(cwd) = cwd {
        let Ok(c_cwd) = CString::new(cwd.as_os_str().as_bytes()) else {
            write_failure_and_exit(error_fd, FailureKind::Chdir);
        };
        // SAFETY: async-signal-safe libc call.
        if unsafe { libc::chdir(c_cwd.as_ptr()) } != 0 {
            write_failure_and_exit(error_fd, FailureKind::Chdir);
        }
    }

    let argv_ptrs = argv_ptrs(argv);
    let envp_ptrs = argv_ptrs(envp);
    let c_command = match CString::new(command) {
        Ok(c) => c,
        Err(_) => write_failure_and_exit(error_fd, FailureKind::Exec),
    };

    // SAFETY: async-signal-safe libc calls; pointer arrays outlive the call.
    unsafe {
        if command.contains('/') {
            libc::execve(
                c_command.as_ptr(),
                argv_ptrs.as_ptr() as *const *mut libc::c_char,
                envp_ptrs.as_ptr() as *const *mut libc::c_char,
            );
        } else {
            libc::execvpe(
                c_command.as_ptr(),
                argv_ptrs.as_ptr() as *const *mut libc::c_char,
                envp_ptrs.as_ptr() as *const *mut libc::c_char,
            );
        }
    }
    write_failure_and_exit(error_fd, FailureKind::Exec);
}

/// Writes the 5-byte `(errno: i32 BE, kind: u8)` record and exits. Never
/// returns.
fn write_failure_and_exit(fd: RawFd, kind: FailureKind) -> ! {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let mut record = [0u8; 5];
    record[..4].copy_from_slice(&errno.to_be_bytes());
    record[4] = kind as u8;
    let mut written = 0usize;
    while written < record.len() {
        // SAFETY: `record[written..]` is a valid buffer; async-signal-safe.
        let rc = unsafe {
            libc::write(
                fd,
                record[written..].as_ptr() as *const libc::c_void,
                record.len() - written,
            )
        };
        if rc <= 0 {
            break;
        }
        written += rc as usize;
    }
    // SAFETY: terminal call, no further Rust code runs in this process image.
    unsafe { libc::_exit(1) };
}

fn open_cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: `fds` is a valid two-element out-parameter.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if rc != 0 {
        return Err(ProcessError::io("self-pipe", std::io::Error::last_os_error()));
    }
    // SAFETY: `pipe2` returned two freshly-opened, uniquely-owned fds.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Reads the handshake result from the parent side of the self-pipe.
/// Blocks briefly (the pipe is non-blocking, so this polls) until either
/// EOF (exec succeeded) or a full 5-byte record arrives.
fn read_handshake(pipe_read: OwnedFd, pid: libc::pid_t) -> Result<libc::pid_t> {
    let mut buf = [0u8; 5];
    let mut filled = 0usize;
    loop {
        // SAFETY: `buf[filled..]` is a valid buffer of the given length.
        let rc = unsafe {
            libc::read(
                pipe_read.as_raw_fd(),
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if rc == 0 {
            // EOF: CLOEXEC closed the write end on successful execve.
            return Ok(pid);
        }
        if rc > 0 {
            filled += rc as usize;
            if filled == buf.len() {
                let errno = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let kind = match buf[4] {
                    0x01 => FailureKind::Dup2,
                    0x02 => FailureKind::Chdir,
                    _ => FailureKind::Exec,
                };
                let strerror = std::io::Error::from_raw_os_error(errno);
                return Err(ProcessError::Io(format!(
                    "Child process {} failure. {strerror}",
                    kind.label()
                )));
            }
            continue;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            std::thread::sleep(std::time::Duration::from_millis(1));
            continue;
        }
        return Err(ProcessError::Io(format!("self-pipe corrupted: {err}")));
    }
}

#[cfg(target_os = "linux")]
fn io_error_from_errno(context: &str, errno: i32) -> ProcessError {
    ProcessError::io(context, std::io::Error::from_raw_os_error(errno))
}

/// Pure classifier: `(spawn rc, command)` → the tightest typed error
/// (spec §4.5 "Error classification").
#[cfg(target_os = "linux")]
fn classify_spawn_error(command: &str, rc: libc::c_int) -> ProcessError {
    let path = Path::new(command);
    if rc == libc::ENOENT || (path.is_absolute() && !path.exists()) {
        return ProcessError::FileNotFound(format!("command not found: {command}"));
    }
    if rc == libc::EACCES {
        return ProcessError::AccessDenied(format!("command not executable: {command}"));
    }
    if path.is_absolute() && path.exists() && !is_executable(path) {
        return ProcessError::AccessDenied(format!("command not executable: {command}"));
    }
    ProcessError::io(format!("spawn {command}"), std::io::Error::from_raw_os_error(rc))
}

#[cfg(target_os = "linux")]
fn is_executable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `c_path` is a valid NUL-terminated C string for this call.
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

/// Resolves a relative command against `PATH`, mirroring `execvpe`'s search,
/// so `reclassify_exec_failure` can apply the same existence/permission
/// checks a PATH search would use.
#[cfg(not(target_os = "linux"))]
fn resolve_on_path(command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        return Some(PathBuf::from(command));
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::StdioConfig;

    #[test]
    fn spawn_true_succeeds_and_reaps_cleanly() {
        let cfg = StdioConfig::build(
            crate::stdio::Stdio::Null,
            crate::stdio::Stdio::Null,
            crate::stdio::Stdio::Null,
            None,
        )
        .unwrap();
        let mut handle = StdioHandle::open(&cfg).unwrap();
        let outcome = spawn("/bin/true", &[], None, &[], &mut handle).unwrap();
        assert!(outcome.pid > 0);

        let mut status = 0;
        // SAFETY: `outcome.pid` is a just-spawned, unreaped child of this process.
        unsafe { libc::waitpid(outcome.pid, &mut status, 0) };
    }

    #[test]
    fn spawn_nonexistent_absolute_command_is_file_not_found() {
        let cfg = StdioConfig::build(
            crate::stdio::Stdio::Null,
            crate::stdio::Stdio::Null,
            crate::stdio::Stdio::Null,
            None,
        )
        .unwrap();
        let mut handle = StdioHandle::open(&cfg).unwrap();
        let err = spawn("/no/such/binary-childproc-test", &[], None, &[], &mut handle).unwrap_err();
        assert!(matches!(err, ProcessError::FileNotFound(_)));
    }

    #[test]
    fn spawn_with_nonexistent_cwd_is_file_not_found_naming_the_directory() {
        let cfg = StdioConfig::build(
            crate::stdio::Stdio::Null,
            crate::stdio::Stdio::Null,
            crate::stdio::Stdio::Null,
            None,
        )
        .unwrap();
        let mut handle = StdioHandle::open(&cfg).unwrap();
        let cwd = Path::new("/no/such/directory-childproc-test");
        let err = spawn("/bin/true", &[], Some(cwd), &[], &mut handle).unwrap_err();
        match err {
            ProcessError::FileNotFound(msg) => {
                assert!(msg.contains("changeDir"), "message was: {msg}");
                assert!(msg.contains("/no/such/directory-childproc-test"), "message was: {msg}");
            }
            other => panic!("expected FileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn build_c_strings_rejects_interior_nul() {
        let err = build_c_strings(std::iter::once("bad\0arg")).unwrap_err();
        assert!(matches!(err, ProcessError::Io(_)));
    }
}
