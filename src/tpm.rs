//! TPM proxy bridge.
//!
//! Splices raw bytes between a local TPM character device and a dedicated pair
//! of USB bulk endpoints. No framing is applied; byte order is preserved per
//! direction.

use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
};
use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    os::{fd::AsFd, unix::fs::OpenOptionsExt},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use crate::{
    endpoint::{wait_ready, Readiness, TransferError},
    worker::Worker,
    CancelToken,
};

/// Default TPM device.
pub const DEFAULT_DEVICE: &str = "/dev/tpm0";

/// Maximum number of bytes relayed per operation.
pub const BUFFER_SIZE: usize = 512;

/// TPM proxy configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TpmConfig {
    /// Path of the TPM character device.
    pub device: PathBuf,
    /// Time to wait for the USB host to configure the gadget before giving up.
    pub ready_timeout: Duration,
    /// Time to wait for the worker to exit when stopping.
    pub stop_timeout: Duration,
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self { device: DEFAULT_DEVICE.into(), ready_timeout: Duration::from_secs(10), stop_timeout: Duration::from_secs(1) }
    }
}

impl TpmConfig {
    /// Sets the TPM device path.
    #[must_use]
    pub fn with_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.device = device.into();
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
}

/// Running TPM proxy.
///
/// The proxy is stopped when dropped.
#[derive(Debug)]
pub struct TpmProxy {
    worker: Worker,
}

impl TpmProxy {
    /// Opens the TPM device and starts the proxy worker.
    ///
    /// `usb_rx` is the endpoint file receiving from the USB host and `usb_tx` the
    /// endpoint file sending to it.
    pub fn start<R, W>(config: TpmConfig, usb_rx: R, usb_tx: W, ready: Arc<dyn Readiness>) -> io::Result<Self>
    where
        R: Read + AsFd + Send + 'static,
        W: Write + Send + 'static,
    {
        let device = Self::open_device(&config)?;
        Self::start_with_device(config, device, usb_rx, usb_tx, ready)
    }

    /// Starts the proxy worker using an already opened TPM device.
    ///
    /// The path in `config` is ignored.
    pub fn start_with_device<D, R, W>(
        config: TpmConfig, device: D, usb_rx: R, usb_tx: W, ready: Arc<dyn Readiness>,
    ) -> io::Result<Self>
    where
        D: Read + Write + AsFd + Send + 'static,
        R: Read + AsFd + Send + 'static,
        W: Write + Send + 'static,
    {
        let stop_timeout = config.stop_timeout;
        let proxy = Proxy { config, device, usb_rx, usb_tx, ready };
        let worker = Worker::spawn("tpm-proxy", move |cancel| proxy.run(&cancel))?.with_stop_timeout(stop_timeout);
        Ok(Self { worker })
    }

    fn open_device(config: &TpmConfig) -> io::Result<File> {
        let file = OpenOptions::new().read(true).write(true).custom_flags(libc::O_SYNC).open(&config.device)?;
        log::debug!("opened TPM device {}", config.device.display());
        Ok(file)
    }

    /// Whether the worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.worker.is_stopped()
    }

    /// Stops the proxy.
    pub fn stop(mut self) -> io::Result<()> {
        let timeout = self.worker.stop_timeout();
        self.worker.stop(timeout)
    }
}

struct Proxy<D, R, W> {
    config: TpmConfig,
    device: D,
    usb_rx: R,
    usb_tx: W,
    ready: Arc<dyn Readiness>,
}

impl<D, R, W> Proxy<D, R, W>
where
    D: Read + Write + AsFd,
    R: Read + AsFd,
    W: Write,
{
    fn run(mut self, cancel: &CancelToken) {
        log::info!("TPM proxy waiting for USB host");
        match wait_ready(&*self.ready, self.config.ready_timeout, cancel) {
            Ok(()) => (),
            Err(TransferError::Cancelled) => return,
            Err(err) => {
                log::error!("TPM proxy not serving: {err}");
                return;
            }
        }

        log::info!("TPM proxy serving {}", self.config.device.display());
        if let Err(err) = self.splice(cancel) {
            log::error!("TPM proxy failed: {err}");
        }
        log::info!("TPM proxy exited");
    }

    fn splice(&mut self, cancel: &CancelToken) -> io::Result<()> {
        let mut buf = [0; BUFFER_SIZE];
        let events = PollFlags::IN | PollFlags::PRI;
        let exceptional = PollFlags::PRI | PollFlags::ERR | PollFlags::NVAL;

        loop {
            let (usb, tpm, wake) = {
                let mut fds = [
                    PollFd::new(&self.usb_rx, events),
                    PollFd::new(&self.device, events),
                    PollFd::from_borrowed_fd(cancel.wake_fd(), PollFlags::IN),
                ];
                match poll(&mut fds, None) {
                    Ok(_) => (),
                    Err(Errno::INTR) => continue,
                    Err(err) => return Err(err.into()),
                }
                (fds[0].revents(), fds[1].revents(), fds[2].revents())
            };

            if !wake.is_empty() || cancel.is_cancelled() {
                return Ok(());
            }

            if usb.contains(PollFlags::IN) {
                match self.usb_rx.read(&mut buf) {
                    Ok(0) => {
                        log::info!("TPM proxy USB endpoint closed");
                        return Ok(());
                    }
                    Ok(n) => {
                        log::trace!("TPM proxy relaying {n} bytes to TPM");
                        if let Err(err) = self.device.write_all(&buf[..n]) {
                            log::warn!("TPM proxy cannot write to TPM: {err}");
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => (),
                    Err(err) => return Err(err),
                }
            }

            if tpm.contains(PollFlags::IN) {
                match self.device.read(&mut buf) {
                    Ok(0) => {
                        log::info!("TPM device closed");
                        return Ok(());
                    }
                    Ok(n) => {
                        log::trace!("TPM proxy relaying {n} bytes to USB host");
                        if let Err(err) = self.usb_tx.write_all(&buf[..n]) {
                            log::warn!("TPM proxy cannot write to USB endpoint: {err}");
                        }
                    }
                    Err(err) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => (),
                    Err(err) => log::warn!("TPM proxy cannot read from TPM: {err}"),
                }
            }

            let hangup = |flags: PollFlags| flags.contains(PollFlags::HUP) && !flags.contains(PollFlags::IN);
            if usb.intersects(exceptional) || tpm.intersects(exceptional) || hangup(usb) || hangup(tpm) {
                log::warn!("TPM proxy exceptional condition: USB {usb:?}, TPM {tpm:?}");
                return Ok(());
            }
        }
    }
}
