//! Relays local Unix socket clients and a TPM device to the USB host.

use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{Error, ErrorKind, Result},
    path::PathBuf,
    process::ExitCode,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    time::Duration,
};

use gadget_bridge::{
    default_udc,
    endpoint::{EndpointSet, Readiness},
    psock::Psock,
    ptun::Ptun,
    tpm::TpmProxy,
    udc_by_name, Udc,
};

mod config;
use config::Config;

/// Interval at which the UDC state is checked for logging.
const STATE_INTERVAL: Duration = Duration::from_secs(1);

/// Relay local clients to the USB host through USB gadget endpoints.
#[derive(Debug, Parser)]
#[command(name = "gadget-bridge", author, version, about, long_about = None)]
struct Args {
    /// Configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// USB device controller (UDC) whose state signals readiness.
    #[arg(long)]
    udc: Option<String>,
    /// Do not start the PSOCK bridge.
    #[arg(long)]
    no_psock: bool,
    /// Do not start the PTUN bridge.
    #[arg(long)]
    no_ptun: bool,
    /// Do not start the TPM proxy.
    #[arg(long)]
    no_tpm: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if args.udc.is_some() {
        cfg.udc = args.udc;
    }
    cfg.psock.enabled &= !args.no_psock;
    cfg.ptun.enabled &= !args.no_ptun;
    cfg.tpm.enabled &= !args.no_tpm;

    let udc = match &cfg.udc {
        Some(name) => udc_by_name(name)?,
        None => default_udc()?,
    };
    log::info!("using UDC {}", udc.name().to_string_lossy());
    let ready: Arc<dyn Readiness> = Arc::new(udc.clone());

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|err| Error::new(ErrorKind::Other, format!("cannot install signal handler: {err}")))?;

    let mut psock = None;
    let mut ptun = None;
    if cfg.psock.enabled || cfg.ptun.enabled {
        let poll_interval = cfg.endpoints.poll_interval();
        let eps = EndpointSet::open(&cfg.endpoints.paths(), ready.clone())?;
        let EndpointSet { data_in, data_out, tun_in, tun_out } = eps;

        if cfg.psock.enabled {
            psock = Some(Psock::start(
                cfg.psock.to_config(),
                data_in.with_poll_interval(poll_interval),
                data_out.with_poll_interval(poll_interval),
            )?);
        }
        if cfg.ptun.enabled {
            ptun = Some(Ptun::start(
                cfg.ptun.to_config(),
                tun_in.with_poll_interval(poll_interval),
                tun_out.with_poll_interval(poll_interval),
            )?);
        }
    }

    let tpm = if cfg.tpm.enabled {
        let usb_rx = OpenOptions::new().read(true).open(&cfg.tpm.usb_rx)?;
        let usb_tx = OpenOptions::new().write(true).open(&cfg.tpm.usb_tx)?;
        Some(TpmProxy::start(cfg.tpm.to_config(), usb_rx, usb_tx, ready.clone())?)
    } else {
        None
    };

    if psock.is_none() && ptun.is_none() && tpm.is_none() {
        return Err(Error::new(ErrorKind::InvalidInput, "all bridges are disabled"));
    }

    log::info!("running, press Ctrl+C to stop");
    let mut configured = false;
    loop {
        let is_ready = udc.is_ready();
        if is_ready && !configured {
            log_speed(&udc);
        } else if !is_ready && configured {
            log::info!("USB host deconfigured the gadget");
        }
        configured = is_ready;

        match stop_rx.recv_timeout(STATE_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => (),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("stopping");

    let mut result = Ok(());
    let stops = [
        psock.map(|b| ("PSOCK", b.stop())),
        ptun.map(|b| ("PTUN", b.stop())),
        tpm.map(|b| ("TPM proxy", b.stop())),
    ];
    for (name, res) in stops.into_iter().flatten() {
        if let Err(err) = res {
            log::error!("{name} did not stop cleanly: {err}");
            result = Err(err);
        }
    }
    result
}

fn log_speed(udc: &Udc) {
    match (udc.current_speed(), udc.max_speed()) {
        (Ok(speed), Ok(max)) => log::info!("USB host configured the gadget at {speed}, controller supports {max}"),
        (Err(err), _) | (_, Err(err)) => log::info!("USB host configured the gadget, speed unknown: {err}"),
    }
}
