//! Local Unix stream socket listener serving one client at a time.

use std::{
    fs,
    io::{self, ErrorKind, Read, Result},
    os::{
        fd::AsFd,
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{CancelToken, Wait};

/// Listen backlog; a bridge serves exactly one client at a time.
const BACKLOG: i32 = 1;

/// Listener bound to a filesystem path.
///
/// The socket file is removed when the listener is dropped.
#[derive(Debug)]
pub struct LocalListener {
    listener: UnixListener,
    path: PathBuf,
}

impl LocalListener {
    /// Binds to `path`, removing a stale socket file left there beforehand.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => log::debug!("removed stale socket {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(path)?;
        rustix::net::listen(&listener, BACKLOG)?;
        listener.set_nonblocking(true)?;

        log::info!("listening on {}", path.display());
        Ok(Self { listener, path: path.to_path_buf() })
    }

    /// Path of the socket file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits up to `timeout` for a client to connect.
    ///
    /// Returns `Ok(None)` if no client connected within the timeout or cancellation
    /// was requested. The returned stream is in blocking mode.
    pub fn accept(&self, cancel: &CancelToken, timeout: Duration) -> Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => return Self::accepted(stream).map(Some),
            Err(err) if err.kind() == ErrorKind::WouldBlock => (),
            Err(err) => return Err(err),
        }

        match cancel.wait_readable(self.listener.as_fd(), Some(timeout))? {
            Wait::Ready => (),
            Wait::Cancelled | Wait::TimedOut => return Ok(None),
        }

        match self.listener.accept() {
            Ok((stream, _)) => Self::accepted(stream).map(Some),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn accepted(stream: UnixStream) -> Result<UnixStream> {
        stream.set_nonblocking(false)?;
        log::debug!("client connected");
        Ok(stream)
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("removed socket {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => log::warn!("cannot remove socket {}: {err}", self.path.display()),
        }
    }
}

/// Outcome of [`recv_exact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// The buffer was filled.
    Complete,
    /// The client closed the connection before sending anything.
    Closed,
    /// Cancellation was requested.
    Cancelled,
}

/// Receives exactly `buf.len()` bytes from a blocking stream, observing cancellation.
///
/// A connection closed after part of the buffer was received fails with
/// [`ErrorKind::UnexpectedEof`].
pub fn recv_exact(stream: &mut UnixStream, buf: &mut [u8], cancel: &CancelToken) -> Result<RecvStatus> {
    let mut pos = 0;
    while pos < buf.len() {
        match cancel.wait_readable(stream.as_fd(), None)? {
            Wait::Ready => (),
            Wait::Cancelled => return Ok(RecvStatus::Cancelled),
            Wait::TimedOut => continue,
        }

        match stream.read(&mut buf[pos..]) {
            Ok(0) if pos == 0 => return Ok(RecvStatus::Closed),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("connection closed after {pos} of {} bytes", buf.len()),
                ))
            }
            Ok(n) => pos += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => (),
            Err(err) => return Err(err),
        }
    }
    Ok(RecvStatus::Complete)
}

#[cfg(test)]
mod test {
    use std::{
        io::{ErrorKind, Write},
        os::unix::net::UnixStream,
        time::{Duration, Instant},
    };

    use super::{recv_exact, LocalListener, RecvStatus};
    use crate::CancelToken;

    #[test]
    fn bind_replaces_stale_socket_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = LocalListener::bind(&path).unwrap();
        let cancel = CancelToken::new().unwrap();
        assert!(listener.accept(&cancel, Duration::from_millis(10)).unwrap().is_none());

        let _client = UnixStream::connect(&path).unwrap();
        assert!(listener.accept(&cancel, Duration::from_secs(5)).unwrap().is_some());

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn accept_returns_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let listener = LocalListener::bind(dir.path().join("sock")).unwrap();
        let cancel = CancelToken::new().unwrap();
        cancel.cancel();

        let start = Instant::now();
        assert!(listener.accept(&cancel, Duration::from_secs(10)).unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn recv_exact_statuses() {
        let cancel = CancelToken::new().unwrap();
        let (mut a, mut b) = UnixStream::pair().unwrap();

        a.write_all(b"abcd").unwrap();
        let mut buf = [0; 4];
        assert_eq!(recv_exact(&mut b, &mut buf, &cancel).unwrap(), RecvStatus::Complete);
        assert_eq!(&buf, b"abcd");

        a.write_all(b"ab").unwrap();
        drop(a);
        let err = recv_exact(&mut b, &mut buf, &cancel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        assert_eq!(recv_exact(&mut b, &mut buf, &cancel).unwrap(), RecvStatus::Closed);

        let (_a, mut b) = UnixStream::pair().unwrap();
        cancel.cancel();
        assert_eq!(recv_exact(&mut b, &mut buf, &cancel).unwrap(), RecvStatus::Cancelled);
    }
}
