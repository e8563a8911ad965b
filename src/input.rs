//! `WriteStream` (C9): the child's stdin side.

use std::fs::File;
use std::os::fd::OwnedFd;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::Mutex;

use crate::error::{ProcessError, Result};

enum Inner {
    Open(pipe::Sender),
    Closed,
}

/// Wraps the parent-side write end of the child's stdin pipe.
///
/// Writes are serialized through an async mutex so a cancelled write
/// leaves the stream in a well-defined state; `close()` is idempotent and
/// safe to call from a drop path or a cancellation handler (spec §4.9:
/// "cancellation leaves the stream closed to avoid stranded fds").
pub struct WriteStream {
    inner: Mutex<Inner>,
}

impl WriteStream {
    pub(crate) fn new(fd: OwnedFd) -> Result<WriteStream> {
        let sender = pipe::Sender::from_file(File::from(fd))
            .map_err(|e| ProcessError::io("register stdin fd", e))?;
        Ok(WriteStream { inner: Mutex::new(Inner::Open(sender)) })
    }

    /// `write(buf, offset, len)`: blocks until every byte is enqueued.
    pub async fn write(&self, buf: &[u8], offset: usize, len: usize) -> Result<()> {
        assert!(offset + len <= buf.len(), "write range out of bounds");
        let slice = &buf[offset..offset + len];
        let mut guard = self.inner.lock().await;
        let sender = match &mut *guard {
            Inner::Open(sender) => sender,
            Inner::Closed => return Err(ProcessError::Io("write to closed stdin".into())),
        };
        match sender.write_all(slice).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *guard = Inner::Closed;
                Err(ProcessError::io("write stdin", e))
            }
        }
    }

    /// `write(buf)` convenience.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.write(buf, 0, buf.len()).await
    }

    /// No-op: pipes here are unbuffered at this layer.
    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Idempotent; closes the write end so the child sees EOF on stdin.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        *guard = Inner::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd};

    fn make_pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[tokio::test]
    async fn write_then_close_allows_reader_to_see_eof() {
        let (read_fd, write_fd) = make_pipe_pair();
        let stream = WriteStream::new(write_fd).unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.close().await;

        let mut buf = [0u8; 64];
        let n =
            unsafe { libc::read(read_fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[tokio::test]
    async fn write_to_closed_stream_is_an_error() {
        let (_read_fd, write_fd) = make_pipe_pair();
        let stream = WriteStream::new(write_fd).unwrap();
        stream.close().await;
        let err = stream.write_all(b"x").await.unwrap_err();
        assert!(matches!(err, ProcessError::Io(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_read_fd, write_fd) = make_pipe_pair();
        let stream = WriteStream::new(write_fd).unwrap();
        stream.close().await;
        stream.close().await;
    }
}
