//! Host-side utilities: port listing and device permissions.
//!
//! On Linux, ModemManager grabs new CDC ACM ports and sends AT commands into
//! them, which upsets the bootstrap loader. A udev rule tells it to leave the
//! Launchpad alone.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};

use crate::{error::Result, port::PortInfo};

/// Platform hook consulted before discovery enumerates ports.
pub trait DevicePermissions: Send + Sync {
    /// Whether rules must be installed before the board can be used.
    fn rules_required(&self) -> bool;

    /// Install the rules. Installing twice is harmless.
    fn install_rules(&self) -> Result<()>;
}

/// Default location of the Launchpad udev rule.
pub const UDEV_RULES_PATH: &str = "/etc/udev/rules.d/50-launchpad.rules";

/// Content of the Launchpad udev rule.
pub const UDEV_RULES: &str = "\nATTRS{idVendor}==\"0451\", ATTRS{idProduct}==\"bef3\", ENV{ID_MM_DEVICE_IGNORE}=\"1\"\n";

/// The Launchpad udev rule file.
#[derive(Debug, Clone)]
pub struct UdevRules {
    path: PathBuf,
}

impl Default for UdevRules {
    fn default() -> Self {
        Self::new(UDEV_RULES_PATH)
    }
}

impl UdevRules {
    /// Rule file at a custom location.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the rule file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file exists with the expected content.
    pub fn is_installed(&self) -> bool {
        fs::read_to_string(&self.path).is_ok_and(|content| content == UDEV_RULES)
    }
}

impl DevicePermissions for UdevRules {
    fn rules_required(&self) -> bool {
        !self.is_installed()
    }

    fn install_rules(&self) -> Result<()> {
        if self.is_installed() {
            debug!("{} is up to date", self.path.display());
            return Ok(());
        }

        info!("Writing {}", self.path.display());
        fs::write(&self.path, UDEV_RULES)?;
        Ok(())
    }
}

/// Permission helper for platforms that need none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPermissions;

impl DevicePermissions for NoPermissions {
    fn rules_required(&self) -> bool {
        false
    }

    fn install_rules(&self) -> Result<()> {
        Ok(())
    }
}

/// Permission helper appropriate for this OS.
pub fn platform_permissions() -> Arc<dyn DevicePermissions> {
    if cfg!(target_os = "linux") {
        Arc::new(UdevRules::default())
    } else {
        Arc::new(NoPermissions)
    }
}

/// List all serial ports.
#[cfg(feature = "native")]
pub fn list_ports() -> Result<Vec<PortInfo>> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    NativePortEnumerator::default().list_ports()
}

/// List all serial ports (stub without native support).
#[cfg(not(feature = "native"))]
pub fn list_ports() -> Result<Vec<PortInfo>> {
    Err(crate::Error::NoDeviceFound)
}
