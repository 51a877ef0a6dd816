//! Common test functions.
#![allow(dead_code)]

use std::{
    io::{self, ErrorKind},
    os::unix::net::UnixStream,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Once,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use gadget_bridge::endpoint::{Buffer, Completed, Endpoint, ReadyFlag, Transfer};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// In-memory USB endpoint connected to a simulated USB host.
///
/// Each write transfer is delivered to the host as one packet, truncated to the
/// write limit set by [`HostSide::limit_writes`]. Each read transfer completes with
/// the next packet sent by the host, truncated to the requested length; the rest of
/// the packet is returned by subsequent reads.
pub struct Loopback {
    to_host: Sender<Vec<u8>>,
    from_host: Receiver<Vec<u8>>,
    remainder: Vec<u8>,
    inflight: Option<Buffer>,
    write_limit: Arc<AtomicUsize>,
}

/// USB host side of a [`Loopback`].
pub struct HostSide {
    to_device: Sender<Vec<u8>>,
    from_device: Receiver<Vec<u8>>,
    write_limit: Arc<AtomicUsize>,
}

impl HostSide {
    /// Sends a packet to the device.
    pub fn send(&self, data: &[u8]) {
        self.to_device.send(data.to_vec()).unwrap();
    }

    /// Receives the next packet written by the device.
    pub fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_device.recv_timeout(timeout).ok()
    }

    /// Accepts at most `limit` bytes of each following write transfer of the device.
    pub fn limit_writes(&self, limit: Option<usize>) {
        self.write_limit.store(limit.unwrap_or(usize::MAX), Ordering::SeqCst);
    }
}

pub fn loopback() -> (Loopback, HostSide) {
    let (to_host, from_device) = mpsc::channel();
    let (to_device, from_host) = mpsc::channel();
    let write_limit = Arc::new(AtomicUsize::new(usize::MAX));
    (
        Loopback { to_host, from_host, remainder: Vec::new(), inflight: None, write_limit: write_limit.clone() },
        HostSide { to_device, from_device, write_limit },
    )
}

/// Creates a loopback endpoint with fast completion polling.
pub fn endpoint(name: &str, ready: &ReadyFlag) -> (Endpoint<Loopback>, HostSide) {
    let (transfer, host) = loopback();
    let ep = Endpoint::new(name, transfer, Arc::new(ready.clone())).with_poll_interval(Duration::from_millis(1));
    (ep, host)
}

impl Loopback {
    fn take_packet(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        if !self.remainder.is_empty() {
            return Some(std::mem::take(&mut self.remainder));
        }
        match self.from_host.recv_timeout(timeout) {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                sleep(timeout);
                None
            }
        }
    }
}

impl Transfer for Loopback {
    fn submit(&mut self, buf: Buffer) -> io::Result<()> {
        if self.inflight.is_some() {
            return Err(io::Error::new(ErrorKind::WouldBlock, "transfer outstanding"));
        }
        self.inflight = Some(buf);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Option<Completed>> {
        match self.inflight.take() {
            None => Ok(None),
            Some(Buffer::Write(data)) => {
                let len = data.len().min(self.write_limit.load(Ordering::SeqCst));
                self.to_host.send(data[..len].to_vec()).map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "host gone"))?;
                Ok(Some(Completed::new(Buffer::Write(data), Ok(len))))
            }
            Some(Buffer::Read(mut buf)) => match self.take_packet(timeout) {
                Some(mut packet) => {
                    let len = packet.len().min(buf.capacity());
                    self.remainder = packet.split_off(len);
                    buf.extend_from_slice(&packet);
                    Ok(Some(Completed::new(Buffer::Read(buf), Ok(len))))
                }
                None => {
                    self.inflight = Some(Buffer::Read(buf));
                    Ok(None)
                }
            },
        }
    }

    fn cancel(&mut self) -> io::Result<Option<Completed>> {
        self.inflight = None;
        Ok(None)
    }

    fn is_busy(&self) -> bool {
        self.inflight.is_some()
    }
}

/// Connects to a socket, retrying until it accepts connections.
pub fn connect(path: &Path) -> UnixStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => {
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                return stream;
            }
            Err(err) if Instant::now() < deadline => {
                println!("waiting for {}: {err}", path.display());
                sleep(Duration::from_millis(10));
            }
            Err(err) => panic!("cannot connect to {}: {err}", path.display()),
        }
    }
}

/// Waits until the condition holds.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    cond()
}
