//! This library relays traffic between local clients on a Linux device acting as a
//! USB peripheral (**USB gadget**) and the USB host it is connected to.
//!
//! Three independent bridges are provided:
//!
//!   * [PSOCK](psock) relays framed request/ack transactions between a client on a local
//!     Unix socket and the USB host,
//!   * [PTUN](ptun) tunnels Ethernet frames between a client on a local Unix socket and
//!     the USB host,
//!   * the [TPM proxy](tpm) splices raw bytes between a local TPM character device and
//!     two dedicated USB bulk endpoints.
//!
//! All bridges move data to and from the USB host through the [endpoint I/O layer](endpoint),
//! which performs cancellable asynchronous transfers on gadget endpoint files.
//! Each bridge runs on its own [worker thread](worker) that is stopped cooperatively
//! through a [cancellation token](CancelToken).
//!
//! ### Requirements
//!
//! The USB gadget, its endpoints and the endpoint files must be set up by an external
//! component, for example using FunctionFS. This library only opens the endpoint files
//! and observes whether the USB host has configured the gadget.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(not(target_os = "linux"))]
compile_error!("gadget_bridge only supports Linux");

mod cancel;
pub use cancel::*;

pub mod endpoint;
pub mod listener;
pub mod psock;
pub mod ptun;
pub mod tpm;
pub mod worker;

mod udc;
pub use udc::*;

/// USB speed.
#[derive(
    Default, Debug, strum::Display, strum::EnumString, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[non_exhaustive]
pub enum Speed {
    /// USB 3.1: 10 Gbit/s.
    #[strum(serialize = "super-speed-plus")]
    SuperSpeedPlus,
    /// USB 3.0: 5 Gbit/s.
    #[strum(serialize = "super-speed")]
    SuperSpeed,
    /// USB 2.0: 480 Mbit/s.
    #[strum(serialize = "high-speed")]
    HighSpeed,
    /// USB 1.0: 12 Mbit/s.
    #[strum(serialize = "full-speed")]
    FullSpeed,
    /// USB 1.0: 1.5 Mbit/s.
    #[strum(serialize = "low-speed")]
    LowSpeed,
    /// Unknown speed.
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

#[cfg(test)]
mod test {
    use super::Speed;

    #[test]
    fn speed_from_sysfs() {
        assert_eq!("high-speed".parse::<Speed>().unwrap(), Speed::HighSpeed);
        assert_eq!("super-speed-plus".parse::<Speed>().unwrap(), Speed::SuperSpeedPlus);
        assert!("warp-speed".parse::<Speed>().is_err());
        assert_eq!(Speed::FullSpeed.to_string(), "full-speed");
    }
}
