//! # Module: LIFECYCLE
//!
//! Sequences one full adapter lifetime: optional driver version check, adapter creation (or
//! opening), session start, the caller's packet work, session end, adapter close, and an
//! optional driver uninstall.
//!
//! A failure at any step aborts the sequence. Whatever was acquired is still released in
//! reverse order, and the first error is the one reported.

use tracing::{info, warn};
use uuid::Uuid;

use crate::wintunapi::{Session, Wintun};
use crate::Result;

/// Ring capacity used when none is configured (4 MiB).
pub const DEFAULT_RING_CAPACITY: u32 = 0x40_0000;

/// Where the adapter comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSource {
    /// Create a new adapter.
    Create {
        name: String,
        tunnel_type: String,
        /// GUID to request; the driver picks one when `None`.
        requested_guid: Option<Uuid>,
    },
    /// Open an adapter that already exists.
    Open { name: String },
}

/// Settings for a [`Lifecycle`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Adapter to create or open.
    pub adapter: AdapterSource,
    /// Session ring capacity in bytes.
    pub ring_capacity: u32,
    /// Query the running driver version before touching adapters.
    pub check_driver_version: bool,
    /// Uninstall the driver once the adapter is closed.
    pub uninstall_driver: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::create("Wintun", "Wintun")
    }
}

impl LifecycleConfig {
    /// A configuration that creates a new adapter.
    pub fn create(name: impl Into<String>, tunnel_type: impl Into<String>) -> Self {
        Self::with_source(AdapterSource::Create {
            name: name.into(),
            tunnel_type: tunnel_type.into(),
            requested_guid: None,
        })
    }

    /// A configuration that opens an existing adapter.
    pub fn open(name: impl Into<String>) -> Self {
        Self::with_source(AdapterSource::Open { name: name.into() })
    }

    fn with_source(adapter: AdapterSource) -> Self {
        Self {
            adapter,
            ring_capacity: DEFAULT_RING_CAPACITY,
            check_driver_version: true,
            uninstall_driver: false,
        }
    }

    /// Requests a specific GUID. Ignored when opening an existing adapter.
    pub fn with_requested_guid(mut self, guid: Uuid) -> Self {
        if let AdapterSource::Create { requested_guid, .. } = &mut self.adapter {
            *requested_guid = Some(guid);
        }
        self
    }

    /// Sets the session ring capacity in bytes.
    pub fn with_ring_capacity(mut self, ring_capacity: u32) -> Self {
        self.ring_capacity = ring_capacity;
        self
    }

    /// Enables or disables the driver version query at the start of a run.
    pub fn with_driver_version_check(mut self, check: bool) -> Self {
        self.check_driver_version = check;
        self
    }

    /// Enables or disables uninstalling the driver at the end of a successful run.
    pub fn with_uninstall(mut self, uninstall: bool) -> Self {
        self.uninstall_driver = uninstall;
        self
    }
}

/// Runs the adapter and session lifecycle around a caller-supplied handler.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    config: LifecycleConfig,
}

impl Lifecycle {
    /// Creates a runner for `config`.
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration this runner uses.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Executes the full sequence, calling `handler` with the active session.
    ///
    /// The session is ended and the adapter closed whether or not `handler` succeeds. The
    /// driver is uninstalled only when every earlier step succeeded and
    /// [`LifecycleConfig::uninstall_driver`] is set.
    ///
    /// # Errors
    ///
    /// The first error raised by any step, including the handler. Cleanup failures after an
    /// earlier error are logged and dropped.
    pub fn run<T, F>(&self, wintun: &mut Wintun, handler: F) -> Result<T>
    where
        F: FnOnce(&Session<'_>) -> Result<T>,
    {
        if self.config.check_driver_version {
            let version = wintun.running_driver_version()?;
            info!(%version, "driver running");
        }

        let outcome = self.with_adapter(wintun, handler)?;

        if self.config.uninstall_driver {
            wintun.uninstall_driver()?;
            info!("driver uninstalled");
        }
        Ok(outcome)
    }

    fn with_adapter<T, F>(&self, wintun: &Wintun, handler: F) -> Result<T>
    where
        F: FnOnce(&Session<'_>) -> Result<T>,
    {
        let mut adapter = match &self.config.adapter {
            AdapterSource::Create {
                name,
                tunnel_type,
                requested_guid,
            } => wintun.create_adapter(name, tunnel_type, *requested_guid)?,
            AdapterSource::Open { name } => wintun.open_adapter(name)?,
        };

        let outcome = match adapter.start_session(self.config.ring_capacity) {
            Ok(session) => {
                let outcome = handler(&session);
                let ended = session.end();
                drop(session);
                first_error(outcome, ended, "end session")
            }
            Err(err) => Err(err),
        };

        let closed = adapter.close();
        first_error(outcome, closed, "close adapter")
    }
}

/// Keeps `outcome`'s error if there is one; otherwise surfaces the cleanup error.
fn first_error<T>(outcome: Result<T>, cleanup: Result<()>, step: &str) -> Result<T> {
    match (outcome, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup)) => {
            warn!(%cleanup, step, "cleanup failed after an earlier error");
            Err(err)
        }
    }
}
