//! Cooperative cancellation.

use rustix::{
    event::{eventfd, poll, EventfdFlags, PollFd, PollFlags},
    io::Errno,
    time::Timespec,
};
use std::{
    fmt,
    io::Result,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

struct Inner {
    cancelled: AtomicBool,
    /// eventfd that becomes readable once cancelled.
    wake: OwnedFd,
}

/// Cancellation token shared between a worker and the controller stopping it.
///
/// Every blocking operation of this crate takes a token and observes it at its
/// checkpoints. Once cancelled a token stays cancelled.
///
/// The token also provides a wake-up file descriptor that becomes readable at the
/// moment of cancellation, so that waits on other file descriptors can include it
/// in their poll set.
#[derive(Clone)]
pub struct CancelToken(Arc<Inner>);

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancelToken").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// Outcome of waiting on a file descriptor with a [`CancelToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The file descriptor is readable or reports a condition that a read will surface.
    Ready,
    /// The token was cancelled.
    Cancelled,
    /// The timeout expired or the wait was interrupted by a signal.
    TimedOut,
}

impl CancelToken {
    /// Creates a new token that is not cancelled.
    pub fn new() -> Result<Self> {
        let wake = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self(Arc::new(Inner { cancelled: AtomicBool::new(false), wake })))
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        if self.0.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = rustix::io::write(&self.0.wake, &1u64.to_ne_bytes()) {
            log::warn!("cannot signal cancellation wake-up descriptor: {err}");
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// File descriptor that becomes readable when the token is cancelled.
    ///
    /// Never read from it; it stays readable for all waiters.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.0.wake.as_fd()
    }

    /// Waits until `fd` becomes readable, the token is cancelled or the timeout expires.
    ///
    /// `None` waits without a timeout.
    pub fn wait_readable(&self, fd: BorrowedFd<'_>, timeout: Option<Duration>) -> Result<Wait> {
        if self.is_cancelled() {
            return Ok(Wait::Cancelled);
        }

        let mut fds = [
            PollFd::from_borrowed_fd(fd, PollFlags::IN),
            PollFd::from_borrowed_fd(self.wake_fd(), PollFlags::IN),
        ];
        let timeout = timeout.map(timespec);
        match poll(&mut fds, timeout.as_ref()) {
            Ok(_) => (),
            Err(Errno::INTR) => return Ok(Wait::TimedOut),
            Err(err) => return Err(err.into()),
        }

        if !fds[1].revents().is_empty() || self.is_cancelled() {
            Ok(Wait::Cancelled)
        } else if !fds[0].revents().is_empty() {
            Ok(Wait::Ready)
        } else {
            Ok(Wait::TimedOut)
        }
    }

    /// Sleeps for the specified duration or until cancelled.
    ///
    /// Returns whether the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }

        let mut fds = [PollFd::from_borrowed_fd(self.wake_fd(), PollFlags::IN)];
        let timeout = timespec(duration);
        if let Err(err) = poll(&mut fds, Some(&timeout)) {
            log::trace!("cancellable sleep interrupted: {err}");
        }

        self.is_cancelled()
    }
}

/// Converts a duration into a poll timeout.
pub(crate) fn timespec(duration: Duration) -> Timespec {
    Timespec { tv_sec: duration.as_secs() as _, tv_nsec: duration.subsec_nanos() as _ }
}

#[cfg(test)]
mod test {
    use std::{
        io::Write,
        os::{fd::AsFd, unix::net::UnixStream},
        thread,
        time::{Duration, Instant},
    };

    use super::{CancelToken, Wait};

    #[test]
    fn cancel_is_sticky() {
        let token = CancelToken::new().unwrap();
        let other = token.clone();
        assert!(!token.is_cancelled());

        other.cancel();
        other.cancel();
        assert!(token.is_cancelled());
        assert!(token.sleep(Duration::from_secs(10)));
    }

    #[test]
    fn wait_readable_observes_data_timeout_and_cancel() {
        let token = CancelToken::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();

        let res = token.wait_readable(b.as_fd(), Some(Duration::from_millis(20))).unwrap();
        assert_eq!(res, Wait::TimedOut);

        a.write_all(b"x").unwrap();
        let res = token.wait_readable(b.as_fd(), Some(Duration::from_millis(20))).unwrap();
        assert_eq!(res, Wait::Ready);

        let remote = token.clone();
        let start = Instant::now();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let (_c, d) = UnixStream::pair().unwrap();
        let res = token.wait_readable(d.as_fd(), None).unwrap();
        assert_eq!(res, Wait::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }
}
