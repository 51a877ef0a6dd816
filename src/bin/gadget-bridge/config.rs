//! Configuration file.

use serde::Deserialize;
use std::{
    fs,
    io::{Error, ErrorKind, Result},
    path::{Path, PathBuf},
    time::Duration,
};

use gadget_bridge::{
    endpoint::{EndpointPaths, DEFAULT_POLL_INTERVAL},
    psock::PsockConfig,
    ptun::PtunConfig,
    tpm::TpmConfig,
};

/// Default directory containing the FunctionFS endpoint files of PSOCK and PTUN.
pub const DEFAULT_EP_DIR: &str = "/dev/usb-ffs/bridge";

/// Default directory containing the FunctionFS endpoint files of the TPM proxy.
pub const DEFAULT_TPM_EP_DIR: &str = "/dev/usb-ffs/tpm";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name of the USB device controller; the first one if unspecified.
    pub udc: Option<String>,
    pub endpoints: Endpoints,
    pub psock: Psock,
    pub ptun: Ptun,
    pub tpm: Tpm,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| Error::new(ErrorKind::InvalidData, err))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Endpoints {
    pub dir: PathBuf,
    pub data_in: Option<PathBuf>,
    pub data_out: Option<PathBuf>,
    pub tun_in: Option<PathBuf>,
    pub tun_out: Option<PathBuf>,
    /// Completion polling interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            dir: DEFAULT_EP_DIR.into(),
            data_in: None,
            data_out: None,
            tun_in: None,
            tun_out: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Endpoints {
    pub fn paths(&self) -> EndpointPaths {
        let mut paths = EndpointPaths::in_dir(&self.dir);
        let overrides = [
            (&mut paths.data_in, &self.data_in),
            (&mut paths.data_out, &self.data_out),
            (&mut paths.tun_in, &self.tun_in),
            (&mut paths.tun_out, &self.tun_out),
        ];
        for (path, custom) in overrides {
            if let Some(custom) = custom {
                path.clone_from(custom);
            }
        }
        paths
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Psock {
    pub enabled: bool,
    pub socket_path: Option<PathBuf>,
    pub ready_timeout_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub accept_interval_ms: Option<u64>,
    pub max_payload: Option<usize>,
}

impl Default for Psock {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: None,
            ready_timeout_ms: None,
            stop_timeout_ms: None,
            accept_interval_ms: None,
            max_payload: None,
        }
    }
}

impl Psock {
    pub fn to_config(&self) -> PsockConfig {
        let mut cfg = PsockConfig::default();
        if let Some(path) = &self.socket_path {
            cfg = cfg.with_socket_path(path);
        }
        if let Some(ms) = self.ready_timeout_ms {
            cfg = cfg.with_ready_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.stop_timeout_ms {
            cfg = cfg.with_stop_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.accept_interval_ms {
            cfg = cfg.with_accept_interval(Duration::from_millis(ms));
        }
        if let Some(max_payload) = self.max_payload {
            cfg = cfg.with_max_payload(max_payload);
        }
        cfg
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ptun {
    pub enabled: bool,
    pub socket_path: Option<PathBuf>,
    pub ready_timeout_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub accept_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl Default for Ptun {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: None,
            ready_timeout_ms: None,
            stop_timeout_ms: None,
            accept_interval_ms: None,
            poll_interval_ms: None,
        }
    }
}

impl Ptun {
    pub fn to_config(&self) -> PtunConfig {
        let mut cfg = PtunConfig::default();
        if let Some(path) = &self.socket_path {
            cfg = cfg.with_socket_path(path);
        }
        if let Some(ms) = self.ready_timeout_ms {
            cfg = cfg.with_ready_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.stop_timeout_ms {
            cfg = cfg.with_stop_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.accept_interval_ms {
            cfg = cfg.with_accept_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.poll_interval_ms {
            cfg = cfg.with_poll_interval(Duration::from_millis(ms));
        }
        cfg
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tpm {
    pub enabled: bool,
    pub device: Option<PathBuf>,
    /// Endpoint file receiving from the USB host.
    pub usb_rx: PathBuf,
    /// Endpoint file sending to the USB host.
    pub usb_tx: PathBuf,
    pub ready_timeout_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
}

impl Default for Tpm {
    fn default() -> Self {
        let dir = Path::new(DEFAULT_TPM_EP_DIR);
        Self {
            enabled: true,
            device: None,
            usb_rx: dir.join("ep1"),
            usb_tx: dir.join("ep2"),
            ready_timeout_ms: None,
            stop_timeout_ms: None,
        }
    }
}

impl Tpm {
    pub fn to_config(&self) -> TpmConfig {
        let mut cfg = TpmConfig::default();
        if let Some(device) = &self.device {
            cfg = cfg.with_device(device);
        }
        if let Some(ms) = self.ready_timeout_ms {
            cfg = cfg.with_ready_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.stop_timeout_ms {
            cfg = cfg.with_stop_timeout(Duration::from_millis(ms));
        }
        cfg
    }
}
