//! Endpoint I/O layer.
//!
//! USB gadget endpoints are accessed through [`Transfer`] implementations that
//! support exactly one outstanding asynchronous transfer each.
//! [`Endpoint`] builds the blocking [`write`](Endpoint::write) and
//! [`read`](Endpoint::read) operations and the non-blocking
//! [`poll_read`](Endpoint::poll_read) slot on top of that primitive.
//! All of them observe a [`CancelToken`] at every poll iteration.
//!
//! Transfer buffers are owned by the transfer while it is in flight, thus a
//! cancelled transfer can never write into memory that has been reused.

use bytes::{Bytes, BytesMut};
use std::{
    fmt,
    io::{self, ErrorKind},
    mem,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::Poll,
    time::{Duration, Instant},
};

use crate::CancelToken;

mod aio;
pub use aio::AioEndpoint;

/// Default interval at which outstanding transfers are polled for completion.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interval at which readiness is polled by [`wait_ready`].
const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Data buffer of a transfer.
#[derive(Debug)]
pub enum Buffer {
    /// Initialized buffer for writing data.
    Write(Bytes),
    /// Possibly uninitialized buffer for reading data.
    ///
    /// Its capacity is the number of bytes requested.
    Read(BytesMut),
}

impl Buffer {
    /// Length or capacity of buffer.
    pub fn size(&self) -> usize {
        match self {
            Self::Write(buf) => buf.len(),
            Self::Read(buf) => buf.capacity(),
        }
    }

    /// Get pointer to buffer.
    ///
    /// ## Safety
    /// If this is a write buffer the pointer must only be read from.
    pub(crate) unsafe fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Self::Write(buf) => buf.as_ptr() as *mut _,
            Self::Read(buf) => buf.as_mut_ptr(),
        }
    }

    /// Assume buffer is initialized to given length.
    ///
    /// ## Safety
    /// The first `len` bytes of a read buffer must have been written.
    pub(crate) unsafe fn assume_init(&mut self, len: usize) {
        match self {
            Self::Write(_) => (),
            Self::Read(buf) => buf.set_len(len.min(buf.capacity())),
        }
    }
}

impl From<Bytes> for Buffer {
    fn from(buf: Bytes) -> Self {
        Self::Write(buf)
    }
}

impl From<BytesMut> for Buffer {
    fn from(buf: BytesMut) -> Self {
        Self::Read(buf)
    }
}

/// Buffer is not a read buffer.
#[derive(Debug, Clone)]
pub struct NotAReadBuffer;

impl TryFrom<Buffer> for BytesMut {
    type Error = NotAReadBuffer;
    fn try_from(buf: Buffer) -> std::result::Result<Self, NotAReadBuffer> {
        match buf {
            Buffer::Write(_) => Err(NotAReadBuffer),
            Buffer::Read(buf) => Ok(buf),
        }
    }
}

/// Completed transfer.
#[derive(Debug)]
pub struct Completed {
    buf: Buffer,
    result: io::Result<usize>,
}

impl Completed {
    /// Creates a completion.
    ///
    /// On success a read buffer must hold exactly the transferred bytes.
    pub fn new(buf: Buffer, result: io::Result<usize>) -> Self {
        Self { buf, result }
    }

    /// Number of bytes transferred or the transfer error.
    pub fn result(&self) -> &io::Result<usize> {
        &self.result
    }

    /// Splits into buffer and result.
    pub fn into_parts(self) -> (Buffer, io::Result<usize>) {
        (self.buf, self.result)
    }
}

/// Asynchronous transfer primitive of one endpoint handle.
///
/// At most one transfer may be outstanding at any time.
pub trait Transfer: Send {
    /// Submits a transfer.
    ///
    /// Fails with [`ErrorKind::WouldBlock`] if a transfer is already outstanding.
    fn submit(&mut self, buf: Buffer) -> io::Result<()>;

    /// Waits up to `timeout` for the outstanding transfer to complete.
    ///
    /// Returns `Ok(None)` if no transfer completed within the timeout or none is outstanding.
    fn wait(&mut self, timeout: Duration) -> io::Result<Option<Completed>>;

    /// Cancels the outstanding transfer and releases its buffer.
    ///
    /// Returns the completion if the transfer finished before it could be cancelled.
    fn cancel(&mut self) -> io::Result<Option<Completed>>;

    /// Whether a transfer is outstanding.
    fn is_busy(&self) -> bool;
}

/// Endpoint I/O error.
#[derive(Debug)]
pub enum TransferError {
    /// Cancellation was requested while the operation was in progress.
    Cancelled,
    /// The USB host has not configured the gadget.
    NotReady,
    /// The transfer completed with fewer bytes than requested.
    Short {
        /// Requested number of bytes.
        expected: usize,
        /// Transferred number of bytes.
        actual: usize,
    },
    /// The transfer failed.
    Io(io::Error),
}

impl TransferError {
    /// Whether this is [`TransferError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the current session must end because of this error.
    ///
    /// Short and failed transfers only lose the affected data.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::NotReady)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::NotReady => write!(f, "USB gadget is not configured by host"),
            Self::Short { expected, actual } => write!(f, "short transfer of {actual} of {expected} bytes"),
            Self::Io(err) => write!(f, "transfer failed: {err}"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<TransferError> for io::Error {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => io::Error::new(ErrorKind::Interrupted, err),
            TransferError::NotReady => io::Error::new(ErrorKind::NotConnected, err),
            TransferError::Short { .. } => io::Error::new(ErrorKind::UnexpectedEof, err),
            TransferError::Io(err) => err,
        }
    }
}

/// Whether the USB host has configured the gadget.
pub trait Readiness: Send + Sync {
    /// Returns `true` once the gadget is configured by the USB host.
    fn is_ready(&self) -> bool;
}

/// Readiness flag set by the component managing USB enumeration.
#[derive(Debug, Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    /// Creates a flag that is not ready.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the readiness.
    pub fn set(&self, ready: bool) {
        let prev = self.0.swap(ready, Ordering::SeqCst);
        if prev != ready {
            log::info!("USB gadget {}", if ready { "configured by host" } else { "deconfigured" });
        }
    }
}

impl Readiness for ReadyFlag {
    fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Waits until the USB host has configured the gadget.
///
/// Fails with [`TransferError::NotReady`] after `timeout`.
pub fn wait_ready(ready: &dyn Readiness, timeout: Duration, cancel: &CancelToken) -> Result<(), TransferError> {
    let deadline = Instant::now() + timeout;
    loop {
        if ready.is_ready() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::NotReady);
        }
        if cancel.sleep(READY_POLL_INTERVAL) {
            return Err(TransferError::Cancelled);
        }
    }
}

/// State of the asynchronous read slot of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No read outstanding.
    Idle,
    /// Read submitted and in flight.
    Pending,
    /// Read completed, result not yet retrieved.
    Ready,
}

enum Slot {
    Idle,
    Pending,
    Ready(Completed),
}

impl Slot {
    fn state(&self) -> SlotState {
        match self {
            Self::Idle => SlotState::Idle,
            Self::Pending => SlotState::Pending,
            Self::Ready(_) => SlotState::Ready,
        }
    }
}

/// USB gadget endpoint with cancellable blocking and pollable I/O.
pub struct Endpoint<T> {
    name: String,
    transfer: T,
    ready: Arc<dyn Readiness>,
    poll_interval: Duration,
    slot: Slot,
}

impl<T> fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("ready", &self.ready.is_ready())
            .field("slot", &self.slot.state())
            .finish()
    }
}

impl<T: Transfer> Endpoint<T> {
    /// Wraps a transfer primitive.
    pub fn new(name: impl Into<String>, transfer: T, ready: Arc<dyn Readiness>) -> Self {
        Self { name: name.into(), transfer, ready, poll_interval: DEFAULT_POLL_INTERVAL, slot: Slot::Idle }
    }

    /// Sets the interval at which outstanding transfers are polled for completion.
    ///
    /// It bounds the delay until cancellation is observed.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the USB host has configured the gadget.
    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Waits until the USB host has configured the gadget.
    pub fn wait_ready(&self, timeout: Duration, cancel: &CancelToken) -> Result<(), TransferError> {
        wait_ready(&*self.ready, timeout, cancel)
    }

    /// State of the asynchronous read slot.
    pub fn slot_state(&self) -> SlotState {
        self.slot.state()
    }

    fn check_ready(&self) -> Result<(), TransferError> {
        if self.ready.is_ready() {
            Ok(())
        } else {
            Err(TransferError::NotReady)
        }
    }

    fn check_idle(&self) -> Result<(), TransferError> {
        match self.slot {
            Slot::Idle => Ok(()),
            _ => Err(io::Error::new(ErrorKind::WouldBlock, format!("{}: asynchronous read outstanding", self.name))
                .into()),
        }
    }

    /// Writes `data` using one transfer and waits for its completion.
    ///
    /// Fails with [`TransferError::NotReady`] without submitting if the gadget is not
    /// configured, or if it is deconfigured while waiting.
    ///
    /// The whole buffer must be transferred, otherwise [`TransferError::Short`] is returned.
    pub fn write(&mut self, data: Bytes, cancel: &CancelToken) -> Result<usize, TransferError> {
        self.check_ready()?;
        self.check_idle()?;

        let expected = data.len();
        let (_, res) = self.transfer_blocking(Buffer::Write(data), cancel)?.into_parts();
        let actual = res?;
        log::trace!("{}: wrote {actual} bytes", self.name);

        if actual != expected {
            return Err(TransferError::Short { expected, actual });
        }
        Ok(actual)
    }

    /// Reads exactly `len` bytes using one transfer and waits for its completion.
    ///
    /// If fewer bytes arrive [`TransferError::Short`] is returned.
    pub fn read(&mut self, len: usize, cancel: &CancelToken) -> Result<BytesMut, TransferError> {
        self.check_ready()?;
        self.check_idle()?;

        let (buf, res) = self.transfer_blocking(Buffer::Read(BytesMut::with_capacity(len)), cancel)?.into_parts();
        let actual = res?;
        log::trace!("{}: read {actual} bytes", self.name);

        let buf = read_buffer(buf)?;
        if actual != len || buf.len() != len {
            return Err(TransferError::Short { expected: len, actual });
        }
        Ok(buf)
    }

    /// Submits a transfer and polls it to completion, observing cancellation.
    fn transfer_blocking(&mut self, buf: Buffer, cancel: &CancelToken) -> Result<Completed, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        self.transfer.submit(buf)?;

        loop {
            if cancel.is_cancelled() {
                self.abandon();
                return Err(TransferError::Cancelled);
            }
            if !self.ready.is_ready() {
                self.abandon();
                return Err(TransferError::NotReady);
            }

            match self.transfer.wait(self.poll_interval) {
                Ok(Some(done)) => return Ok(done),
                Ok(None) => (),
                Err(err) => {
                    self.abandon();
                    return Err(err.into());
                }
            }
        }
    }

    /// Cancels the outstanding transfer, discarding its result.
    fn abandon(&mut self) {
        match self.transfer.cancel() {
            Ok(Some(done)) => {
                log::debug!("{}: discarding transfer that completed during cancellation: {:?}", self.name, done.result())
            }
            Ok(None) => log::debug!("{}: transfer cancelled", self.name),
            Err(err) => log::warn!("{}: cancelling transfer failed: {err}", self.name),
        }
    }

    /// Polls an asynchronous read of up to `len` bytes without blocking.
    ///
    /// The first call submits the read and later calls check for its completion,
    /// returning [`Poll::Pending`] while it is in flight. A completed read is returned
    /// exactly once, then the slot becomes idle again.
    ///
    /// If cancellation is requested while the read is pending, it is cancelled and
    /// [`TransferError::Cancelled`] is returned. Likewise a pending read is cancelled
    /// when the gadget is deconfigured.
    pub fn poll_read(&mut self, len: usize, cancel: &CancelToken) -> Result<Poll<BytesMut>, TransferError> {
        if !self.ready.is_ready() {
            self.cancel_read();
            return Err(TransferError::NotReady);
        }

        if cancel.is_cancelled() {
            self.cancel_read();
            return Err(TransferError::Cancelled);
        }

        loop {
            match mem::replace(&mut self.slot, Slot::Idle) {
                Slot::Idle => {
                    self.transfer.submit(Buffer::Read(BytesMut::with_capacity(len)))?;
                    log::trace!("{}: asynchronous read of {len} bytes submitted", self.name);
                    self.slot = Slot::Pending;
                }
                Slot::Pending => match self.transfer.wait(Duration::ZERO) {
                    Ok(Some(done)) => self.slot = Slot::Ready(done),
                    Ok(None) => {
                        self.slot = Slot::Pending;
                        return Ok(Poll::Pending);
                    }
                    Err(err) => {
                        self.abandon();
                        return Err(err.into());
                    }
                },
                Slot::Ready(done) => {
                    let (buf, res) = done.into_parts();
                    let actual = res?;
                    log::trace!("{}: asynchronous read of {actual} bytes completed", self.name);
                    return Ok(Poll::Ready(read_buffer(buf)?));
                }
            }
        }
    }

    /// Cancels an outstanding asynchronous read and returns the slot to idle.
    ///
    /// A completed but not yet retrieved read is discarded.
    pub fn cancel_read(&mut self) {
        match mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Idle => (),
            Slot::Pending => self.abandon(),
            Slot::Ready(done) => log::debug!("{}: discarding completed read: {:?}", self.name, done.result()),
        }
    }
}

fn read_buffer(buf: Buffer) -> Result<BytesMut, TransferError> {
    BytesMut::try_from(buf)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "write buffer returned for read transfer").into())
}

/// Paths of the endpoint files used by PSOCK and PTUN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPaths {
    /// Data endpoint from device to host.
    pub data_in: PathBuf,
    /// Data endpoint from host to device.
    pub data_out: PathBuf,
    /// Tunnel endpoint from device to host.
    pub tun_in: PathBuf,
    /// Tunnel endpoint from host to device.
    pub tun_out: PathBuf,
}

impl EndpointPaths {
    /// Endpoint files `ep1` to `ep4` within the specified directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self { data_in: dir.join("ep1"), data_out: dir.join("ep2"), tun_in: dir.join("ep3"), tun_out: dir.join("ep4") }
    }
}

/// The four gadget endpoints used by PSOCK and PTUN.
///
/// Each endpoint is exclusively owned by the bridge it is handed to.
#[derive(Debug)]
pub struct EndpointSet<T = AioEndpoint> {
    /// Data endpoint from device to host.
    pub data_in: Endpoint<T>,
    /// Data endpoint from host to device.
    pub data_out: Endpoint<T>,
    /// Tunnel endpoint from device to host.
    pub tun_in: Endpoint<T>,
    /// Tunnel endpoint from host to device.
    pub tun_out: Endpoint<T>,
}

impl EndpointSet<AioEndpoint> {
    /// Opens the endpoint files.
    pub fn open(paths: &EndpointPaths, ready: Arc<dyn Readiness>) -> io::Result<Self> {
        Ok(Self {
            data_in: Endpoint::new("data-in", AioEndpoint::open(&paths.data_in)?, ready.clone()),
            data_out: Endpoint::new("data-out", AioEndpoint::open(&paths.data_out)?, ready.clone()),
            tun_in: Endpoint::new("tun-in", AioEndpoint::open(&paths.tun_in)?, ready.clone()),
            tun_out: Endpoint::new("tun-out", AioEndpoint::open(&paths.tun_out)?, ready),
        })
    }
}

#[cfg(test)]
mod test {
    use bytes::{Bytes, BytesMut};
    use std::{
        collections::VecDeque,
        io::{self, ErrorKind},
        sync::{Arc, Mutex},
        task::Poll,
        time::Duration,
    };

    use super::*;

    /// Scripted transfer: completions are released by the test.
    #[derive(Default)]
    struct Script {
        inflight: Option<Buffer>,
        released: VecDeque<Vec<u8>>,
        submitted: usize,
        cancelled: usize,
        write_limit: Option<usize>,
    }

    #[derive(Clone, Default)]
    struct Scripted(Arc<Mutex<Script>>);

    impl Scripted {
        fn release(&self, data: &[u8]) {
            self.0.lock().unwrap().released.push_back(data.to_vec());
        }
    }

    impl Transfer for Scripted {
        fn submit(&mut self, buf: Buffer) -> io::Result<()> {
            let mut s = self.0.lock().unwrap();
            if s.inflight.is_some() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "busy"));
            }
            s.submitted += 1;
            s.inflight = Some(buf);
            Ok(())
        }

        fn wait(&mut self, _timeout: Duration) -> io::Result<Option<Completed>> {
            let mut s = self.0.lock().unwrap();
            match s.inflight.take() {
                Some(Buffer::Write(data)) => {
                    let n = s.write_limit.unwrap_or(data.len()).min(data.len());
                    Ok(Some(Completed::new(Buffer::Write(data), Ok(n))))
                }
                Some(Buffer::Read(mut buf)) => match s.released.pop_front() {
                    Some(data) => {
                        let n = data.len().min(buf.capacity());
                        buf.extend_from_slice(&data[..n]);
                        Ok(Some(Completed::new(Buffer::Read(buf), Ok(n))))
                    }
                    None => {
                        s.inflight = Some(Buffer::Read(buf));
                        Ok(None)
                    }
                },
                None => Ok(None),
            }
        }

        fn cancel(&mut self) -> io::Result<Option<Completed>> {
            let mut s = self.0.lock().unwrap();
            if s.inflight.take().is_some() {
                s.cancelled += 1;
            }
            Ok(None)
        }

        fn is_busy(&self) -> bool {
            self.0.lock().unwrap().inflight.is_some()
        }
    }

    fn endpoint(ready: bool) -> (Endpoint<Scripted>, Scripted, ReadyFlag) {
        let flag = ReadyFlag::new();
        flag.set(ready);
        let script = Scripted::default();
        let ep = Endpoint::new("test", script.clone(), Arc::new(flag.clone())).with_poll_interval(Duration::from_millis(1));
        (ep, script, flag)
    }

    #[test]
    fn not_ready_fails_without_submitting() {
        let (mut ep, script, _flag) = endpoint(false);
        let cancel = CancelToken::new().unwrap();

        assert!(matches!(ep.write(Bytes::from_static(b"abc"), &cancel), Err(TransferError::NotReady)));
        assert!(matches!(ep.read(4, &cancel), Err(TransferError::NotReady)));
        assert!(matches!(ep.poll_read(4, &cancel), Err(TransferError::NotReady)));
        assert_eq!(script.0.lock().unwrap().submitted, 0);
    }

    #[test]
    fn zero_length_write_is_success() {
        let (mut ep, _script, _flag) = endpoint(true);
        let cancel = CancelToken::new().unwrap();
        assert_eq!(ep.write(Bytes::new(), &cancel).unwrap(), 0);
    }

    #[test]
    fn short_write_is_failure() {
        let (mut ep, script, _flag) = endpoint(true);
        script.0.lock().unwrap().write_limit = Some(2);
        let cancel = CancelToken::new().unwrap();

        match ep.write(Bytes::from_static(b"abcd"), &cancel) {
            Err(TransferError::Short { expected: 4, actual: 2 }) => (),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn read_requires_exact_length() {
        let (mut ep, script, _flag) = endpoint(true);
        let cancel = CancelToken::new().unwrap();

        script.release(b"0123");
        assert_eq!(&ep.read(4, &cancel).unwrap()[..], b"0123");

        script.release(b"01");
        assert!(matches!(ep.read(4, &cancel), Err(TransferError::Short { expected: 4, actual: 2 })));
    }

    #[test]
    fn cancelled_blocking_read_releases_transfer() {
        let (mut ep, script, _flag) = endpoint(true);
        let cancel = CancelToken::new().unwrap();

        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        assert!(ep.read(4, &cancel).unwrap_err().is_cancelled());
        canceller.join().unwrap();

        let s = script.0.lock().unwrap();
        assert_eq!(s.cancelled, 1);
        assert!(s.inflight.is_none());
    }

    #[test]
    fn cancelled_before_submit() {
        let (mut ep, script, _flag) = endpoint(true);
        let cancel = CancelToken::new().unwrap();
        cancel.cancel();

        assert!(ep.write(Bytes::from_static(b"x"), &cancel).unwrap_err().is_cancelled());
        assert_eq!(script.0.lock().unwrap().submitted, 0);
    }

    #[test]
    fn repeated_pending_polls_yield_result_once() {
        let (mut ep, script, _flag) = endpoint(true);
        let cancel = CancelToken::new().unwrap();

        for _ in 0..100 {
            assert_eq!(ep.poll_read(16, &cancel).unwrap(), Poll::Pending);
            assert_eq!(ep.slot_state(), SlotState::Pending);
        }
        assert_eq!(script.0.lock().unwrap().submitted, 1);

        script.release(b"frame");
        let data = match ep.poll_read(16, &cancel).unwrap() {
            Poll::Ready(data) => data,
            Poll::Pending => panic!("read not completed"),
        };
        assert_eq!(&data[..], b"frame");
        assert_eq!(ep.slot_state(), SlotState::Idle);

        // Next poll starts a new transfer instead of repeating the result.
        assert_eq!(ep.poll_read(16, &cancel).unwrap(), Poll::Pending);
        assert_eq!(script.0.lock().unwrap().submitted, 2);
    }

    #[test]
    fn cancel_while_pending_returns_to_idle() {
        let (mut ep, script, _flag) = endpoint(true);
        let cancel = CancelToken::new().unwrap();

        assert_eq!(ep.poll_read(16, &cancel).unwrap(), Poll::Pending);
        cancel.cancel();
        assert!(ep.poll_read(16, &cancel).unwrap_err().is_cancelled());
        assert_eq!(ep.slot_state(), SlotState::Idle);

        let s = script.0.lock().unwrap();
        assert_eq!(s.cancelled, 1);
        assert!(s.inflight.is_none());
    }

    #[test]
    fn blocking_io_refused_while_read_pending() {
        let (mut ep, _script, _flag) = endpoint(true);
        let cancel = CancelToken::new().unwrap();

        assert_eq!(ep.poll_read(16, &cancel).unwrap(), Poll::Pending);
        match ep.write(Bytes::from_static(b"x"), &cancel) {
            Err(TransferError::Io(err)) => assert_eq!(err.kind(), ErrorKind::WouldBlock),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn wait_ready_times_out_or_succeeds() {
        let flag = ReadyFlag::new();
        let cancel = CancelToken::new().unwrap();
        assert!(matches!(wait_ready(&flag, Duration::from_millis(10), &cancel), Err(TransferError::NotReady)));

        flag.set(true);
        wait_ready(&flag, Duration::from_millis(10), &cancel).unwrap();

        flag.set(false);
        cancel.cancel();
        assert!(wait_ready(&flag, Duration::from_secs(10), &cancel).unwrap_err().is_cancelled());
    }

    #[test]
    fn error_conversion() {
        let err: io::Error = TransferError::Cancelled.into();
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        let err: io::Error = TransferError::NotReady.into();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        let err: io::Error = TransferError::Short { expected: 2, actual: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn only_cancellation_and_deconfiguration_are_fatal() {
        assert!(TransferError::Cancelled.is_fatal());
        assert!(TransferError::NotReady.is_fatal());
        assert!(!TransferError::Short { expected: 2, actual: 1 }.is_fatal());
        assert!(!TransferError::Io(io::Error::new(ErrorKind::BrokenPipe, "gone")).is_fatal());
    }

    #[test]
    fn paths_in_dir() {
        let paths = EndpointPaths::in_dir("/dev/usb-ffs/bridge");
        assert_eq!(paths.data_in, std::path::Path::new("/dev/usb-ffs/bridge/ep1"));
        assert_eq!(paths.tun_out, std::path::Path::new("/dev/usb-ffs/bridge/ep4"));
    }

    #[test]
    fn read_buffer_conversion() {
        assert!(BytesMut::try_from(Buffer::Write(Bytes::new())).is_err());
        assert!(BytesMut::try_from(Buffer::Read(BytesMut::new())).is_ok());
    }
}
