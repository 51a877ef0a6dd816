//! Endpoint transfers using Linux AIO.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{Error, ErrorKind, Result},
    mem::MaybeUninit,
    ops::Deref,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    pin::Pin,
    time::{Duration, Instant},
};

use super::{Buffer, Completed, Transfer};

mod sys;

/// Number of events the AIO context is created for.
const QUEUE_LENGTH: u32 = 4;

/// Time to wait for the completion event of a cancelled request.
const CANCEL_TIMEOUT: Duration = Duration::from_millis(100);

/// AIO context wrapper.
#[derive(Debug)]
struct Context(sys::ContextId);

impl Context {
    /// create an asynchronous I/O context
    fn new(nr_events: u32) -> Result<Self> {
        let mut id = 0;
        unsafe { sys::setup(nr_events, &mut id) }?;
        Ok(Self(id))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = unsafe { sys::destroy(self.0) } {
            log::error!("cannot destroy AIO context: {err}");
        }
    }
}

impl Deref for Context {
    type Target = sys::ContextId;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Submitted AIO request.
struct Op {
    /// IO control block.
    iocb: Pin<Box<sys::IoCb>>,
    /// Buffer referenced by [`Self::iocb`].
    buf: Buffer,
}

impl Op {
    /// Get pointer to IO control block.
    fn iocb_ptr(&mut self) -> *mut sys::IoCb {
        Pin::into_inner(self.iocb.as_mut()) as *mut _
    }

    /// Given received AIO event convert request to completion.
    fn complete(mut self, event: &sys::IoEvent) -> Completed {
        let result = match usize::try_from(event.res) {
            Ok(len) => {
                unsafe { self.buf.assume_init(len) };
                Ok(len)
            }
            Err(_) => Err(Error::from_raw_os_error(i32::try_from(-event.res).unwrap_or(libc::EIO))),
        };
        Completed::new(self.buf, result)
    }
}

/// Endpoint file accessed using Linux AIO.
///
/// One request is outstanding at most. A request that could not be cancelled in time
/// is kept together with its buffer until the kernel reports its completion.
pub struct AioEndpoint {
    // Must be dropped before the buffer of the outstanding request.
    ctx: Context,
    op: Option<Op>,
    abandoned: bool,
    file: File,
    path: PathBuf,
    next_id: u64,
}

impl fmt::Debug for AioEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AioEndpoint")
            .field("path", &self.path)
            .field("busy", &self.op.is_some())
            .field("abandoned", &self.abandoned)
            .finish()
    }
}

impl AioEndpoint {
    /// Opens the endpoint file at the specified path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        log::debug!("opened endpoint file {}", path.display());
        Ok(Self {
            ctx: Context::new(QUEUE_LENGTH)?,
            op: None,
            abandoned: false,
            file,
            path: path.to_path_buf(),
            next_id: 0,
        })
    }

    /// Path of the endpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetches the completion event of the outstanding request.
    fn get_event(&mut self, timeout: Duration) -> Result<Option<sys::IoEvent>> {
        let mut event = MaybeUninit::<sys::IoEvent>::uninit();
        let timeout = libc::timespec { tv_sec: timeout.as_secs() as _, tv_nsec: timeout.subsec_nanos() as _ };
        let n = match unsafe { sys::getevents(*self.ctx, 1, 1, event.as_mut_ptr(), &timeout) } {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(None);
        }

        let event = unsafe { event.assume_init() };
        match &self.op {
            Some(op) if op.iocb.data == event.data => Ok(Some(event)),
            _ => {
                log::warn!("{}: ignoring AIO event for unknown request {}", self.path.display(), event.data);
                Ok(None)
            }
        }
    }

    /// Releases an abandoned request if the kernel has completed it meanwhile.
    fn reap(&mut self) -> Result<()> {
        if self.get_event(Duration::ZERO)?.is_some() {
            log::debug!("{}: abandoned request completed", self.path.display());
            self.op = None;
            self.abandoned = false;
        }
        Ok(())
    }
}

impl Transfer for AioEndpoint {
    fn submit(&mut self, mut buf: Buffer) -> Result<()> {
        if self.abandoned {
            self.reap()?;
        }
        if self.op.is_some() {
            return Err(Error::new(ErrorKind::WouldBlock, "AIO request outstanding"));
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let opcode = match &buf {
            Buffer::Write(_) => sys::opcode::PWRITE,
            Buffer::Read(_) => sys::opcode::PREAD,
        };
        let iocb = sys::IoCb::new(opcode, self.file.as_raw_fd(), unsafe { buf.as_mut_ptr() }, buf.size() as u64, id);

        let mut op = Op { iocb: Box::pin(iocb), buf };
        let mut iocbs = [op.iocb_ptr()];
        match unsafe { sys::submit(*self.ctx, 1, iocbs.as_mut_ptr()) }? {
            1 => {
                self.op = Some(op);
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::WouldBlock, "AIO request not accepted")),
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<Completed>> {
        if self.op.is_none() || self.abandoned {
            return Ok(None);
        }

        match self.get_event(timeout)? {
            Some(event) => Ok(self.op.take().map(|op| op.complete(&event))),
            None => Ok(None),
        }
    }

    fn cancel(&mut self) -> Result<Option<Completed>> {
        if self.abandoned {
            self.reap()?;
            return Ok(None);
        }
        let Some(op) = self.op.as_mut() else { return Ok(None) };

        let mut event = MaybeUninit::<sys::IoEvent>::uninit();
        let event = match unsafe { sys::cancel(*self.ctx, op.iocb_ptr(), event.as_mut_ptr()) } {
            Ok(()) => Some(unsafe { event.assume_init() }),
            Err(err) => {
                // The kernel delivers the completion event asynchronously.
                log::trace!("{}: io_cancel: {err}", self.path.display());
                let deadline = Instant::now() + CANCEL_TIMEOUT;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if let Some(event) = self.get_event(remaining)? {
                        break Some(event);
                    }
                    if remaining.is_zero() {
                        break None;
                    }
                }
            }
        };

        match event {
            Some(event) => {
                let op = self.op.take().ok_or_else(|| Error::new(ErrorKind::Other, "request vanished"))?;
                if event.res >= 0 {
                    Ok(Some(op.complete(&event)))
                } else {
                    Ok(None)
                }
            }
            None => {
                log::warn!("{}: request not cancelled within {CANCEL_TIMEOUT:?}, abandoning it", self.path.display());
                self.abandoned = true;
                Err(Error::new(ErrorKind::TimedOut, "AIO request could not be cancelled"))
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.op.is_some()
    }
}

impl Drop for AioEndpoint {
    fn drop(&mut self) {
        if self.op.is_some() && !self.abandoned {
            let _ = self.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::{Bytes, BytesMut};
    use std::{fs, io::ErrorKind, time::Duration};

    use super::AioEndpoint;
    use crate::endpoint::{Buffer, Transfer};

    #[test]
    fn regular_file_transfers() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut ep = AioEndpoint::open(file.path()).unwrap();
        assert!(!ep.is_busy());

        ep.submit(Buffer::Write(Bytes::from_static(b"endpoint"))).unwrap();
        assert!(ep.is_busy());
        let err = ep.submit(Buffer::Write(Bytes::from_static(b"second"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        let done = ep.wait(Duration::from_secs(5)).unwrap().expect("write not completed");
        assert_eq!(*done.result().as_ref().unwrap(), 8);
        assert!(!ep.is_busy());
        assert_eq!(fs::read(file.path()).unwrap(), b"endpoint");

        ep.submit(Buffer::Read(BytesMut::with_capacity(16))).unwrap();
        let done = ep.wait(Duration::from_secs(5)).unwrap().expect("read not completed");
        let (buf, res) = done.into_parts();
        assert_eq!(res.unwrap(), 8);
        assert_eq!(&BytesMut::try_from(buf).unwrap()[..], b"endpoint");
    }

    #[test]
    fn wait_without_request() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut ep = AioEndpoint::open(file.path()).unwrap();
        assert!(ep.wait(Duration::from_millis(1)).unwrap().is_none());
        assert!(ep.cancel().unwrap().is_none());
    }
}
