//! Worker thread lifecycle shared by all bridges.
//!
//! A worker runs a bridge loop on its own OS thread. Stopping it sets the stop
//! request (the worker's [`CancelToken`]) and waits a bounded time for the
//! worker to acknowledge by exiting. Workers are never cancelled preemptively:
//! if the bound expires the thread is detached and the leak is reported.

use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::CancelToken;

/// Interval at which [`Worker::stop`] checks for the stopped acknowledgment.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound on stopping a worker when it is dropped.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Sets the stopped acknowledgment when the worker function returns or unwinds.
struct StoppedGuard(Arc<AtomicBool>);

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A worker thread with cooperative stop.
pub struct Worker {
    name: String,
    token: CancelToken,
    stopped: Arc<AtomicBool>,
    stop_timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("stop_requested", &self.token.is_cancelled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Worker {
    /// Spawns a worker thread running `f`.
    ///
    /// `f` receives the worker's cancellation token and must return soon after it
    /// has been cancelled.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Self>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let name = name.into();
        let token = CancelToken::new()?;
        let stopped = Arc::new(AtomicBool::new(false));

        let thread_token = token.clone();
        let guard = StoppedGuard(stopped.clone());
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            f(thread_token);
        })?;

        log::debug!("worker {name} started");
        Ok(Self { name, token, stopped, stop_timeout: DEFAULT_STOP_TIMEOUT, thread: Some(thread) })
    }

    /// Sets the bound on stopping the worker when it is dropped.
    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Bound on stopping the worker when it is dropped.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Requests the worker to stop and waits up to `timeout` for it to exit.
    ///
    /// Fails with [`ErrorKind::TimedOut`] if the worker did not exit in time;
    /// its thread is then left running detached.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(thread) = self.thread.take() else { return Ok(()) };

        log::debug!("stopping worker {}", self.name);
        self.token.cancel();

        let deadline = Instant::now() + timeout;
        while !self.is_stopped() {
            if Instant::now() >= deadline {
                log::error!("worker {} did not stop within {timeout:?}, leaking its thread", self.name);
                drop(thread);
                return Err(Error::new(
                    ErrorKind::TimedOut,
                    format!("worker {} did not stop within {timeout:?}", self.name),
                ));
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        match thread.join() {
            Ok(()) => {
                log::debug!("worker {} stopped", self.name);
                Ok(())
            }
            Err(_) => {
                log::error!("worker {} panicked", self.name);
                Err(Error::new(ErrorKind::Other, format!("worker {} panicked", self.name)))
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop(self.stop_timeout);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::ErrorKind,
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use super::Worker;

    #[test]
    fn stop_joins_cooperative_worker() {
        let mut worker = Worker::spawn("coop", |token| while !token.sleep(Duration::from_millis(5)) {}).unwrap();
        assert!(!worker.is_stopped());

        let start = Instant::now();
        worker.stop(Duration::from_secs(5)).unwrap();
        assert!(worker.is_stopped());
        assert!(worker.is_stop_requested());
        assert!(start.elapsed() < Duration::from_secs(1));

        // Stopping again is a no-op.
        worker.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn worker_exiting_on_its_own_is_acknowledged() {
        let mut worker = Worker::spawn("short", |_token| ()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_stopped() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.is_stopped());
        assert!(!worker.is_stop_requested());
        worker.stop(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn stop_times_out_on_stuck_worker() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut worker = Worker::spawn("stuck", move |_token| {
            let _ = release_rx.recv();
        })
        .unwrap();

        let err = worker.stop(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(!worker.is_stopped());

        release_tx.send(()).unwrap();
    }

    #[test]
    fn drop_uses_configured_stop_timeout() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = Worker::spawn("stuck-drop", move |_token| {
            let _ = release_rx.recv();
        })
        .unwrap()
        .with_stop_timeout(Duration::from_millis(50));
        assert_eq!(worker.stop_timeout(), Duration::from_millis(50));

        let start = Instant::now();
        drop(worker);
        assert!(start.elapsed() < Duration::from_millis(500));

        release_tx.send(()).unwrap();
    }

    #[test]
    fn panicking_worker_reports_error() {
        let mut worker = Worker::spawn("panics", |_token| panic!("worker failure")).unwrap();
        let err = worker.stop(Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
