//! PTUN bridge.
//!
//! Tunnels Ethernet frames between one client connected to a local Unix socket
//! and the USB host. Both directions are serviced by a single worker thread:
//! the client socket is peeked without blocking and the tunnel-out endpoint is
//! polled through its asynchronous read slot, so neither direction blocks the other.
//!
//! Frames are relayed using the [tunnel framing](frame). Invalid frames from the
//! USB host are dropped and the session continues. An oversized frame from the client
//! closes the session, since the rest of its stream cannot be delimited.

use bytes::BytesMut;
use rustix::{
    io::Errno,
    net::{recv, RecvFlags},
};
use std::{
    io::{self, Read, Write},
    os::{fd::AsFd, unix::net::UnixStream},
    path::{Path, PathBuf},
    sync::Arc,
    task::Poll,
    time::Duration,
};

use crate::{
    endpoint::{Endpoint, Transfer, TransferError},
    listener::LocalListener,
    worker::Worker,
    CancelToken,
};

pub mod frame;
use frame::{EthernetHeader, BUFFER_SIZE, MAX_FRAME};

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/ptun";

/// Pause after a failed USB transfer before polling again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// PTUN bridge configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PtunConfig {
    /// Path of the local Unix socket.
    pub socket_path: PathBuf,
    /// Time to wait for the USB host to configure the gadget before giving up.
    pub ready_timeout: Duration,
    /// Time to wait for the worker to exit when stopping.
    pub stop_timeout: Duration,
    /// Interval at which the listening socket is polled for clients.
    pub accept_interval: Duration,
    /// Time to wait for client data when neither direction has traffic.
    ///
    /// Bounds the latency of frames arriving from the USB host.
    pub poll_interval: Duration,
}

impl Default for PtunConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.into(),
            ready_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
            accept_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl PtunConfig {
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

    /// Sets the idle polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Running PTUN bridge.
///
/// The bridge is stopped when dropped.
#[derive(Debug)]
pub struct Ptun {
    worker: Worker,
    listener: Arc<LocalListener>,
}

impl Ptun {
    /// Binds the socket and starts the bridge worker.
    ///
    /// `tun_in` transfers from device to host, `tun_out` from host to device.
    pub fn start<T>(config: PtunConfig, tun_in: Endpoint<T>, tun_out: Endpoint<T>) -> io::Result<Self>
    where
        T: Transfer + 'static,
    {
        let listener = Arc::new(LocalListener::bind(&config.socket_path)?);
        let stop_timeout = config.stop_timeout;

        let bridge = Bridge { config, listener: listener.clone(), tun_in, tun_out };
        let worker = Worker::spawn("ptun", move |cancel| bridge.run(&cancel))?.with_stop_timeout(stop_timeout);

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
    Closed,
    Cancelled,
    NotReady,
}

/// Result of peeking at the client socket.
enum Peek {
    Available(usize),
    Empty,
    Closed,
}

/// Returns how many bytes can be read from the stream without blocking, up to `buf.len()`.
fn peek(stream: &UnixStream, buf: &mut [u8]) -> io::Result<Peek> {
    match recv(stream, buf, RecvFlags::PEEK | RecvFlags::DONTWAIT) {
        Ok((0, _)) => Ok(Peek::Closed),
        Ok((n, _)) => Ok(Peek::Available(n)),
        Err(Errno::AGAIN | Errno::INTR) => Ok(Peek::Empty),
        Err(err) => Err(err.into()),
    }
}

struct Bridge<T> {
    config: PtunConfig,
    listener: Arc<LocalListener>,
    tun_in: Endpoint<T>,
    tun_out: Endpoint<T>,
}

impl<T: Transfer> Bridge<T> {
    fn run(mut self, cancel: &CancelToken) {
        loop {
            log::info!("PTUN waiting for USB host");
            match self.tun_in.wait_ready(self.config.ready_timeout, cancel) {
                Ok(()) => (),
                Err(TransferError::Cancelled) => break,
                Err(err) => {
                    log::error!("PTUN not serving: {err}");
                    break;
                }
            }

            if self.serve(cancel) == End::Cancelled {
                break;
            }
        }
        self.tun_out.cancel_read();
        log::info!("PTUN bridge exited");
    }

    /// Accepts and serves clients while the gadget is configured.
    fn serve(&mut self, cancel: &CancelToken) -> End {
        log::info!("PTUN serving on {}", self.listener.path().display());

        while !cancel.is_cancelled() {
            if !self.tun_in.is_ready() {
                return End::NotReady;
            }

            let mut stream = match self.listener.accept(cancel, self.config.accept_interval) {
                Ok(Some(stream)) => stream,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("PTUN accept failed: {err}");
                    cancel.sleep(self.config.accept_interval);
                    continue;
                }
            };

            log::info!("PTUN client connected");
            let end = match self.session(&mut stream, cancel) {
                Ok(end) => end,
                Err(err) => {
                    log::warn!("PTUN session failed: {err}");
                    End::Closed
                }
            };
            self.tun_out.cancel_read();
            log::info!("PTUN client disconnected");

            if end != End::Closed {
                return end;
            }
        }
        End::Cancelled
    }

    /// Relays frames of one client in both directions until it disconnects.
    fn session(&mut self, stream: &mut UnixStream, cancel: &CancelToken) -> io::Result<End> {
        let mut buf = BytesMut::zeroed(BUFFER_SIZE);

        loop {
            if cancel.is_cancelled() {
                return Ok(End::Cancelled);
            }
            let mut idle = true;

            // Client to USB host.
            match peek(stream, &mut buf)? {
                Peek::Closed => return Ok(End::Closed),
                Peek::Empty => (),
                Peek::Available(n) if n >= MAX_FRAME => {
                    // Frame boundaries are lost once an oversized frame is split.
                    log::warn!("PTUN client sent oversized frame of at least {n} bytes, closing session");
                    return Ok(End::Closed);
                }
                Peek::Available(n) => {
                    idle = false;
                    stream.read_exact(&mut buf[..n])?;
                    if let Some(end) = self.send(&buf[..n], cancel) {
                        return Ok(end);
                    }
                }
            }

            // USB host to client.
            match self.tun_out.poll_read(BUFFER_SIZE, cancel) {
                Ok(Poll::Pending) => (),
                Ok(Poll::Ready(data)) => {
                    idle = false;
                    match frame::decode(&data) {
                        Ok(payload) => {
                            log_frame("received", payload);
                            stream.write_all(payload)?;
                        }
                        Err(err) => log::warn!("PTUN dropping frame from USB host: {err}"),
                    }
                }
                Err(err) => match usb_failure(err) {
                    Some(end) => return Ok(end),
                    None => {
                        cancel.sleep(ERROR_BACKOFF);
                    }
                },
            }

            if idle {
                cancel.wait_readable(stream.as_fd(), Some(self.config.poll_interval))?;
            }
        }
    }

    /// Sends a client frame to the USB host.
    ///
    /// Returns how the session ends, if it must.
    fn send(&mut self, payload: &[u8], cancel: &CancelToken) -> Option<End> {
        let frame = match frame::encode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("PTUN dropping frame from client: {err}");
                return None;
            }
        };

        log_frame("sending", payload);
        match self.tun_in.write(frame, cancel) {
            Ok(_) => None,
            Err(err) => usb_failure(err),
        }
    }
}

fn log_frame(action: &str, payload: &[u8]) {
    if log::log_enabled!(log::Level::Trace) {
        match EthernetHeader::parse(payload) {
            Some(hdr) => log::trace!("PTUN {action} {} bytes: {hdr}", payload.len()),
            None => log::trace!("PTUN {action} {} bytes", payload.len()),
        }
    }
}

/// Logs a USB transfer error and returns how the session ends, if it must.
fn usb_failure(err: TransferError) -> Option<End> {
    if !err.is_fatal() {
        log::warn!("PTUN frame lost: {err}");
        return None;
    }
    if err.is_cancelled() {
        return Some(End::Cancelled);
    }
    log::warn!("PTUN USB host deconfigured the gadget");
    Some(End::NotReady)
}
