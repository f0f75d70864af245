use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::driver::DriverBinding;
#[cfg(windows)]
use crate::{driver::WintunDll, Error, Operation, Result};

// Submodules
mod adapter;
mod io;
mod session;

pub use adapter::Adapter;
pub use io::{LoopExit, ReceivedPacket, SendPacket};
pub use session::{ReadWaitEvent, Session, SessionState, WaitStatus};

pub(crate) use session::{Gate, InFlight, Lease};

/// Entry point for adapter management. Every adapter created or opened through a `Wintun`
/// borrows it, so the driver cannot be uninstalled while any adapter is still open.
pub struct Wintun {
    driver: Arc<dyn DriverBinding>,
}

impl Wintun {
    /// Initializes a new `Wintun` instance backed by the process-wide `wintun.dll` binding.
    ///
    /// The library is resolved on first use and shared by every instance afterwards.
    #[cfg(windows)]
    pub fn new() -> Result<Self> {
        let dll = WintunDll::global().map_err(|os| Error::DriverNotLoaded {
            op: Operation::LoadLibrary,
            os: Some(os),
        })?;
        Ok(Self::with_binding(dll))
    }

    /// Initializes a new `Wintun` instance on top of an arbitrary driver binding.
    pub fn with_binding(driver: Arc<dyn DriverBinding>) -> Self {
        Self { driver }
    }

    pub(crate) fn driver(&self) -> &dyn DriverBinding {
        self.driver.as_ref()
    }

    pub(crate) fn binding(&self) -> Arc<dyn DriverBinding> {
        self.driver.clone()
    }
}

impl fmt::Debug for Wintun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wintun").finish_non_exhaustive()
    }
}

/// Version of the running driver, as reported by `WintunGetRunningDriverVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(u32);

impl Version {
    /// Major version, from the high 16 bits.
    pub fn major(&self) -> u32 {
        self.0 >> 16
    }

    /// Minor version, from the low 16 bits.
    pub fn minor(&self) -> u32 {
        self.0 & 0xFFFF
    }

    /// The packed value as the driver reports it.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Version {
    fn from(raw: u32) -> Self {
        Version(raw)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
