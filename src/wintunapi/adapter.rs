//! # Submodule: Adapter lifecycle
//!
//! Creation, opening and closing of virtual adapters, plus the driver-wide queries (running
//! version, uninstall) that only make sense when no adapter is outstanding.

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{Session, Version, Wintun};
use crate::driver::{AdapterHandle, DriverBinding, MAX_ADAPTER_NAME};
use crate::netlib::{GuidWrapper, IfLuid};
use crate::{Error, Operation, Result};

/// Rejects names the driver would refuse, before paying for a driver call.
fn validate_name(op: Operation, what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid(op, format!("{what} is empty")));
    }
    if value.contains('\0') {
        return Err(Error::invalid(op, format!("{what} contains a NUL character")));
    }
    let units = value.encode_utf16().count();
    if units >= MAX_ADAPTER_NAME {
        return Err(Error::invalid(
            op,
            format!("{what} is {units} UTF-16 units long (limit {})", MAX_ADAPTER_NAME - 1),
        ));
    }
    Ok(())
}

impl Wintun {
    /// Creates a new virtual adapter.
    ///
    /// # Arguments
    ///
    /// * `name` - The friendly name of the adapter.
    /// * `tunnel_type` - The adapter's device description, shared by all adapters of one
    ///   application.
    /// * `requested_guid` - The GUID the adapter should get; the driver picks one if `None`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a malformed name or tunnel type (checked locally first),
    /// `PermissionDenied` without elevation, `DriverNotLoaded` when the driver is missing.
    /// The OS error code reported by the driver is kept in the error.
    pub fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        requested_guid: Option<Uuid>,
    ) -> Result<Adapter<'_>> {
        let op = Operation::CreateAdapter;
        validate_name(op, "adapter name", name)?;
        validate_name(op, "tunnel type", tunnel_type)?;

        let handle = self
            .driver()
            .create_adapter(name, tunnel_type, requested_guid.as_ref())
            .map_err(|os| Error::from_os(op, os))?;
        debug!(adapter = name, tunnel_type, handle = handle.0, "adapter created");

        Ok(Adapter {
            wintun: self,
            handle,
            name: name.to_owned(),
            tunnel_type: tunnel_type.to_owned(),
            requested_guid: requested_guid.map(GuidWrapper::from),
        })
    }

    /// Opens an existing adapter by name.
    ///
    /// # Errors
    ///
    /// `NotFound` if no adapter with that name exists.
    pub fn open_adapter(&self, name: &str) -> Result<Adapter<'_>> {
        let op = Operation::OpenAdapter;
        validate_name(op, "adapter name", name)?;

        let handle = self
            .driver()
            .open_adapter(name)
            .map_err(|os| Error::from_os(op, os))?;
        debug!(adapter = name, handle = handle.0, "adapter opened");

        Ok(Adapter {
            wintun: self,
            handle,
            name: name.to_owned(),
            tunnel_type: String::new(),
            requested_guid: None,
        })
    }

    /// Queries the version of the running driver.
    ///
    /// # Errors
    ///
    /// `DriverNotLoaded` when the driver reports version 0 or the query fails.
    pub fn running_driver_version(&self) -> Result<Version> {
        let op = Operation::QueryVersion;
        match self.driver().running_driver_version() {
            Ok(0) => Err(Error::DriverNotLoaded { op, os: None }),
            Ok(raw) => Ok(Version::from(raw)),
            Err(os) => Err(Error::DriverNotLoaded { op, os: Some(os) }),
        }
    }

    /// Deletes the driver if no adapters are in use.
    ///
    /// Takes `&mut self`, so every adapter (and with it every session) obtained from this
    /// instance must already be gone. Other processes may still hold adapters, in which case
    /// the driver refuses with `ResourceBusy`.
    pub fn uninstall_driver(&mut self) -> Result<()> {
        self.driver()
            .delete_driver()
            .map_err(|os| Error::from_os(Operation::DeleteDriver, os))?;
        debug!("driver uninstalled");
        Ok(())
    }
}

/// A virtual adapter handle, created by [`Wintun::create_adapter`] or
/// [`Wintun::open_adapter`].
///
/// Close it explicitly with [`Adapter::close`]. Dropping an adapter that was never closed
/// closes it as a safety net and logs a warning.
#[derive(Debug)]
pub struct Adapter<'w> {
    wintun: &'w Wintun,
    handle: AdapterHandle,
    name: String,
    tunnel_type: String,
    requested_guid: Option<GuidWrapper>,
}

impl<'w> Adapter<'w> {
    /// Returns the raw adapter handle; null once the adapter is closed.
    pub fn handle(&self) -> AdapterHandle {
        self.handle
    }

    /// Returns the name the adapter was created or opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tunnel type the adapter was created with; empty for opened adapters.
    pub fn tunnel_type(&self) -> &str {
        &self.tunnel_type
    }

    /// Returns the GUID requested at creation, if any.
    pub fn requested_guid(&self) -> Option<&GuidWrapper> {
        self.requested_guid.as_ref()
    }

    /// Returns `true` once [`Adapter::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.handle.is_null()
    }

    /// Returns the locally unique identifier the system assigned to the adapter.
    pub fn luid(&self) -> Result<IfLuid> {
        if self.is_closed() {
            return Err(Error::invalid(Operation::GetAdapterLuid, "adapter is closed"));
        }
        Ok(IfLuid::from(self.driver().adapter_luid(self.handle)))
    }

    /// Starts a session on this adapter with a ring of `ring_capacity` bytes.
    ///
    /// Shorthand for [`Session::new`] followed by [`Session::start`].
    pub fn start_session(&self, ring_capacity: u32) -> Result<Session<'_>> {
        let mut session = Session::new(self, ring_capacity);
        session.start()?;
        Ok(session)
    }

    /// Closes the adapter. Idempotent: the handle is invalidated on the first call, even when
    /// the driver reports an error, and later calls do nothing.
    ///
    /// Sessions borrow their adapter, so they must be ended and dropped before this can be
    /// called.
    pub fn close(&mut self) -> Result<()> {
        if self.handle.is_null() {
            return Ok(());
        }
        let handle = std::mem::take(&mut self.handle);
        let result = self
            .driver()
            .close_adapter(handle)
            .map_err(|os| Error::from_os(Operation::CloseAdapter, os));
        debug!(adapter = %self.name, handle = handle.0, ok = result.is_ok(), "adapter closed");
        result
    }

    pub(crate) fn driver(&self) -> &'w dyn DriverBinding {
        self.wintun.driver()
    }

    pub(crate) fn binding(&self) -> Arc<dyn DriverBinding> {
        self.wintun.binding()
    }
}

impl Drop for Adapter<'_> {
    fn drop(&mut self) {
        if self.handle.is_null() {
            return;
        }
        warn!(adapter = %self.name, "adapter dropped without being closed");
        if let Err(err) = self.close() {
            error!(adapter = %self.name, %err, "failed to close abandoned adapter");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::{StubDriver, ERROR_ACCESS_DENIED};

    fn setup() -> (Arc<StubDriver>, Wintun) {
        let stub = Arc::new(StubDriver::new());
        let wintun = Wintun::with_binding(stub.clone());
        (stub, wintun)
    }

    #[test]
    fn test_create_and_close() {
        let (stub, wintun) = setup();
        let mut adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        assert_eq!(adapter.handle(), AdapterHandle(1));
        assert_eq!(adapter.name(), "VPN0");
        assert_eq!(adapter.tunnel_type(), "Tunnel");

        adapter.close().unwrap();
        adapter.close().unwrap();
        assert!(adapter.is_closed());
        assert_eq!(stub.calls(Operation::CloseAdapter), 1);
        assert!(stub.violations().is_empty());
    }

    #[test]
    fn test_invalid_names_never_reach_the_driver() {
        let (stub, wintun) = setup();
        let long = "x".repeat(MAX_ADAPTER_NAME);
        let cases = [
            ("", "Tunnel"),
            ("VPN\0", "Tunnel"),
            (long.as_str(), "Tunnel"),
            ("VPN0", ""),
        ];
        for (name, tunnel_type) in cases {
            let err = wintun.create_adapter(name, tunnel_type, None).unwrap_err();
            assert!(matches!(err, Error::InvalidParameter { os: None, .. }), "{err}");
        }
        assert_eq!(stub.calls(Operation::CreateAdapter), 0);
    }

    #[test]
    fn test_create_failure_keeps_os_code() {
        let (stub, wintun) = setup();
        stub.fail_next(Operation::CreateAdapter, ERROR_ACCESS_DENIED);
        let err = wintun.create_adapter("VPN0", "Tunnel", None).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
        assert_eq!(err.os_error().map(|os| os.code()), Some(ERROR_ACCESS_DENIED));
    }

    #[test]
    fn test_open_missing_adapter() {
        let (stub, wintun) = setup();
        assert!(matches!(
            wintun.open_adapter("nope").unwrap_err(),
            Error::NotFound { .. }
        ));

        stub.install_adapter("existing");
        let mut adapter = wintun.open_adapter("existing").unwrap();
        assert_eq!(adapter.name(), "existing");
        adapter.close().unwrap();
    }

    #[test]
    fn test_drop_closes_abandoned_adapter() {
        let (stub, wintun) = setup();
        {
            let _adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
            assert_eq!(stub.open_adapters(), 1);
        }
        assert_eq!(stub.open_adapters(), 0);
        assert_eq!(stub.calls(Operation::CloseAdapter), 1);
    }

    #[test]
    fn test_luid_and_guid() {
        let (_stub, wintun) = setup();
        let guid = Uuid::new_v4();
        let mut adapter = wintun.create_adapter("VPN0", "Tunnel", Some(guid)).unwrap();
        assert_eq!(adapter.requested_guid().map(|g| *g.as_uuid()), Some(guid));
        assert_eq!(adapter.luid().unwrap().if_type(), 53);
        adapter.close().unwrap();
        assert!(adapter.luid().is_err());
    }

    #[test]
    fn test_version() {
        let (stub, wintun) = setup();
        assert_eq!(wintun.running_driver_version().unwrap().to_string(), "14.0");
        stub.set_version(0);
        assert!(matches!(
            wintun.running_driver_version().unwrap_err(),
            Error::DriverNotLoaded { .. }
        ));
    }

    #[test]
    fn test_uninstall_after_adapters_closed() {
        let (stub, mut wintun) = setup();
        let mut adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        adapter.close().unwrap();
        drop(adapter);
        wintun.uninstall_driver().unwrap();
        assert!(stub.is_deleted());
    }
}
