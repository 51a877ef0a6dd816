//! USB device controller (UDC).

use std::{
    ffi::OsStr,
    fmt, fs,
    io::{Error, ErrorKind, Result},
    path::{Path, PathBuf},
};

use crate::{endpoint::Readiness, Speed};

/// USB device controller (UDC).
///
/// Call [`udcs`] to obtain the controllers available on the system.
/// A UDC can serve as [readiness](Readiness) source for the bridges: it is ready
/// once the USB host has configured the gadget bound to it.
#[derive(Clone)]
pub struct Udc {
    dir: PathBuf,
}

impl fmt::Debug for Udc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Udc").field("name", &self.name()).finish()
    }
}

impl Udc {
    fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The name of the USB device controller.
    pub fn name(&self) -> &OsStr {
        self.dir.file_name().unwrap_or_default()
    }

    /// Indicates the current negotiated speed at this port.
    pub fn current_speed(&self) -> Result<Speed> {
        Ok(fs::read_to_string(self.dir.join("current_speed"))?.trim().parse().unwrap_or_default())
    }

    /// Indicates the maximum USB speed supported by this port.
    pub fn max_speed(&self) -> Result<Speed> {
        Ok(fs::read_to_string(self.dir.join("maximum_speed"))?.trim().parse().unwrap_or_default())
    }

    /// Indicates current state of the USB Device Controller.
    ///
    /// However not all USB Device Controllers support reporting all states.
    pub fn state(&self) -> Result<UdcState> {
        Ok(fs::read_to_string(self.dir.join("state"))?.trim().parse().unwrap_or_default())
    }
}

impl Readiness for Udc {
    fn is_ready(&self) -> bool {
        match self.state() {
            Ok(state) => state == UdcState::Configured,
            Err(err) => {
                log::trace!("cannot read state of UDC {}: {err}", self.name().to_string_lossy());
                false
            }
        }
    }
}

/// USB device controller (UDC) connection state.
#[derive(
    Default, Debug, strum::Display, strum::EnumString, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[non_exhaustive]
pub enum UdcState {
    /// Not attached.
    #[strum(serialize = "not attached")]
    NotAttached,
    /// Attached.
    #[strum(serialize = "attached")]
    Attached,
    /// Powered.
    #[strum(serialize = "powered")]
    Powered,
    /// Reconnecting.
    #[strum(serialize = "reconnecting")]
    Reconnecting,
    /// Unauthenticated.
    #[strum(serialize = "unauthenticated")]
    Unauthenticated,
    /// Default.
    #[strum(serialize = "default")]
    Default,
    /// Addressed.
    #[strum(serialize = "addressed")]
    Addressed,
    /// Configured.
    #[strum(serialize = "configured")]
    Configured,
    /// Suspended.
    #[strum(serialize = "suspended")]
    Suspended,
    /// Unknown state.
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

const CLASS_DIR: &str = "/sys/class";

fn udcs_in(class_dir: &Path) -> Result<Vec<Udc>> {
    if !class_dir.is_dir() {
        return Err(Error::new(ErrorKind::NotFound, "sysfs is not available"));
    }

    let udc_dir = class_dir.join("udc");
    if !udc_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut udcs = Vec::new();
    for entry in fs::read_dir(&udc_dir)? {
        let Ok(entry) = entry else { continue };
        udcs.push(Udc::from_dir(entry.path()));
    }

    udcs.sort_by_key(|udc| udc.name().to_os_string());
    Ok(udcs)
}

/// Gets the available USB device controllers (UDCs) in the system, sorted by name.
pub fn udcs() -> Result<Vec<Udc>> {
    udcs_in(Path::new(CLASS_DIR))
}

/// The default USB device controller (UDC) in the system by alphabetical sorting.
///
/// A not found error is returned if no UDC is present.
pub fn default_udc() -> Result<Udc> {
    udcs()?
        .into_iter()
        .next()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "no USB device controller (UDC) available"))
}

/// The USB device controller (UDC) with the specified name.
pub fn udc_by_name(name: impl AsRef<OsStr>) -> Result<Udc> {
    let name = name.as_ref();
    udcs()?.into_iter().find(|udc| udc.name() == name).ok_or_else(|| {
        Error::new(ErrorKind::NotFound, format!("USB device controller (UDC) {} not found", name.to_string_lossy()))
    })
}
