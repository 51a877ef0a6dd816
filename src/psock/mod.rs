//! PSOCK bridge.
//!
//! Relays strictly synchronous request/ack transactions between one client
//! connected to a local Unix socket and the USB host.
//!
//! Each transaction consists of a [request header](proto::Header) with optional
//! payload, which is forwarded byte-for-byte to the data-in endpoint, followed by
//! an [ack](proto::Ack) with optional payload read from the data-out endpoint and
//! forwarded byte-for-byte back to the client.
//!
//! A client request with invalid magic closes the session, since the byte stream
//! cannot be resynchronized reliably. An invalid ack from the USB host is logged and
//! dropped; the client then receives no reply for its request. The payload of an
//! oversized ack is read and discarded.

use bytes::{Bytes, BytesMut};
use std::{
    io::{self, ErrorKind, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    endpoint::{Endpoint, Transfer, TransferError},
    listener::{recv_exact, LocalListener, RecvStatus},
    worker::Worker,
    CancelToken,
};

pub mod proto;
use proto::{Ack, Header};

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/sock0";

/// PSOCK bridge configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PsockConfig {
    /// Path of the local Unix socket.
    pub socket_path: PathBuf,
    /// Time to wait for the USB host to configure the gadget before giving up.
    pub ready_timeout: Duration,
    /// Time to wait for the worker to exit when stopping.
    pub stop_timeout: Duration,
    /// Interval at which the listening socket is polled for clients.
    pub accept_interval: Duration,
    /// Maximum payload length of a request or ack.
    pub max_payload: usize,
}

impl Default for PsockConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.into(),
            ready_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
            accept_interval: Duration::from_millis(100),
            max_payload: 2048,
        }
    }
}

impl PsockConfig {
    /// Sets the socket path.
    #[must_use]
    pub fn with_socket_path(mut self, socket_path: impl Into<PathBuf>) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    /// Sets the readiness timeout.
    #[must_use]
    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    /// Sets the stop timeout.
    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Sets the accept polling interval.
    #[must_use]
    pub fn with_accept_interval(mut self, accept_interval: Duration) -> Self {
        self.accept_interval = accept_interval;
        self
    }

    /// Sets the maximum payload length.
    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

/// Running PSOCK bridge.
///
/// The bridge is stopped when dropped.
#[derive(Debug)]
pub struct Psock {
    worker: Worker,
    listener: Arc<LocalListener>,
}

impl Psock {
    /// Binds the socket and starts the bridge worker.
    ///
    /// `data_in` transfers from device to host, `data_out` from host to device.
    pub fn start<T>(config: PsockConfig, data_in: Endpoint<T>, data_out: Endpoint<T>) -> io::Result<Self>
    where
        T: Transfer + 'static,
    {
        let listener = Arc::new(LocalListener::bind(&config.socket_path)?);
        let stop_timeout = config.stop_timeout;

        let bridge = Bridge { config, listener: listener.clone(), data_in, data_out };
        let worker = Worker::spawn("psock", move |cancel| bridge.run(&cancel))?.with_stop_timeout(stop_timeout);

        Ok(Self { worker, listener })
    }

    /// Path of the local socket.
    pub fn socket_path(&self) -> &Path {
        self.listener.path()
    }

    /// Whether the worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.worker.is_stopped()
    }

    /// Stops the bridge and removes the socket.
    pub fn stop(mut self) -> io::Result<()> {
        let timeout = self.worker.stop_timeout();
        self.worker.stop(timeout)
    }
}

/// Reason a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    /// Client disconnected or the session was closed because of an error.
    Closed,
    /// Stop requested.
    Cancelled,
    /// USB host deconfigured the gadget.
    NotReady,
}

/// State owned by the worker thread.
struct Bridge<T> {
    config: PsockConfig,
    listener: Arc<LocalListener>,
    data_in: Endpoint<T>,
    data_out: Endpoint<T>,
}

impl<T: Transfer> Bridge<T> {
    fn run(mut self, cancel: &CancelToken) {
        loop {
            log::info!("PSOCK waiting for USB host");
            match self.data_in.wait_ready(self.config.ready_timeout, cancel) {
                Ok(()) => (),
                Err(TransferError::Cancelled) => break,
                Err(err) => {
                    log::error!("PSOCK not serving: {err}");
                    break;
                }
            }

            if self.serve(cancel) == End::Cancelled {
                break;
            }
        }
        log::info!("PSOCK bridge exited");
    }

    /// Accepts and serves clients while the gadget is configured.
    ///
    /// Returns [`End::NotReady`] when the gadget has been deconfigured.
    fn serve(&mut self, cancel: &CancelToken) -> End {
        log::info!("PSOCK serving on {}", self.listener.path().display());

        while !cancel.is_cancelled() {
            if !self.data_in.is_ready() {
                return End::NotReady;
            }

            let mut stream = match self.listener.accept(cancel, self.config.accept_interval) {
                Ok(Some(stream)) => stream,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("PSOCK accept failed: {err}");
                    cancel.sleep(self.config.accept_interval);
                    continue;
                }
            };

            log::info!("PSOCK client connected");
            let end = match self.session(&mut stream, cancel) {
                Ok(end) => end,
                Err(err) => {
                    log::warn!("PSOCK session failed: {err}");
                    End::Closed
                }
            };
            log::info!("PSOCK client disconnected");

            if end != End::Closed {
                return end;
            }
        }
        End::Cancelled
    }

    /// Serves transactions of one client until it disconnects.
    fn session(&mut self, stream: &mut UnixStream, cancel: &CancelToken) -> io::Result<End> {
        let max_payload = self.config.max_payload;

        loop {
            let mut hdr = [0; Header::SIZE];
            match recv_exact(stream, &mut hdr, cancel)? {
                RecvStatus::Complete => (),
                RecvStatus::Closed => return Ok(End::Closed),
                RecvStatus::Cancelled => return Ok(End::Cancelled),
            }

            let header = Header::parse(&hdr);
            if !header.is_valid() {
                log::warn!("PSOCK request with bad magic {:#010x}, closing session", header.magic);
                return Ok(End::Closed);
            }

            let len = header.len as usize;
            if len > max_payload {
                log::warn!("PSOCK request payload of {len} bytes exceeds maximum of {max_payload} bytes, closing session");
                return Ok(End::Closed);
            }

            let mut payload = BytesMut::zeroed(len);
            if len > 0 {
                match recv_exact(stream, &mut payload, cancel)? {
                    RecvStatus::Complete => (),
                    RecvStatus::Closed => {
                        return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed before payload"))
                    }
                    RecvStatus::Cancelled => return Ok(End::Cancelled),
                }
            }
            log::debug!("PSOCK request cmd={} len={len}", header.cmd);

            if let Err(err) = self.forward(Bytes::copy_from_slice(&hdr), payload.freeze(), cancel) {
                match usb_failure(err) {
                    Some(end) => return Ok(end),
                    None => continue,
                }
            }

            let reply = match self.receive_ack(cancel) {
                Ok(Some(reply)) => reply,
                Ok(None) => continue,
                Err(err) => match usb_failure(err) {
                    Some(end) => return Ok(end),
                    None => continue,
                },
            };

            stream.write_all(&reply)?;
        }
    }

    /// Forwards a request to the USB host.
    fn forward(&mut self, hdr: Bytes, payload: Bytes, cancel: &CancelToken) -> Result<(), TransferError> {
        self.data_in.write(hdr, cancel)?;
        if !payload.is_empty() {
            self.data_in.write(payload, cancel)?;
        }
        Ok(())
    }

    /// Receives an ack with its payload from the USB host.
    ///
    /// Returns `Ok(None)` if the ack is invalid.
    fn receive_ack(&mut self, cancel: &CancelToken) -> Result<Option<BytesMut>, TransferError> {
        let mut reply = self.data_out.read(Ack::SIZE, cancel)?;

        let mut data = [0; Ack::SIZE];
        data.copy_from_slice(&reply);
        let ack = Ack::parse(&data);
        if !ack.is_valid() {
            log::warn!("PSOCK ack with bad magic {:#010x} dropped", ack.magic);
            return Ok(None);
        }

        let len = ack.len as usize;
        let max_payload = self.config.max_payload;
        if len > max_payload {
            log::warn!("PSOCK ack payload of {len} bytes exceeds maximum of {max_payload} bytes, discarding it");
            self.discard(len, cancel)?;
            return Ok(None);
        }

        if len > 0 {
            let payload = self.data_out.read(len, cancel)?;
            reply.extend_from_slice(&payload);
        }
        log::debug!("PSOCK ack cmd={} ack={} len={len}", ack.cmd, ack.ack);

        Ok(Some(reply))
    }

    /// Reads and discards `len` bytes from data-out so that the next ack stays aligned.
    fn discard(&mut self, mut len: usize, cancel: &CancelToken) -> Result<(), TransferError> {
        let chunk = self.config.max_payload.max(1);
        while len > 0 {
            let n = len.min(chunk);
            self.data_out.read(n, cancel)?;
            len -= n;
        }
        Ok(())
    }
}

/// Logs a USB transfer error and returns how the session ends, if it must.
fn usb_failure(err: TransferError) -> Option<End> {
    if !err.is_fatal() {
        log::warn!("PSOCK transaction dropped: {err}");
        return None;
    }
    if err.is_cancelled() {
        return Some(End::Cancelled);
    }
    log::warn!("PSOCK USB host deconfigured the gadget");
    Some(End::NotReady)
}
