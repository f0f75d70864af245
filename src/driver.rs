//! # Module: DRIVER
//!
//! The boundary between this crate and the Wintun driver. [`DriverBinding`] mirrors the
//! driver's exported functions one to one: every call either succeeds or reports a raw
//! [`OsError`], and nothing in here interprets those codes. Translation into
//! [`crate::Error`] happens one level up, in the adapter and session types.
//!
//! Two bindings ship with the crate: the Windows binding that resolves `wintun.dll` once per
//! process, and `StubDriver`, an in-process double of the driver's observable contract that is
//! compiled in with the `stub` feature.

use std::{fmt, ptr::NonNull, sync::Arc, time::Duration};

use uuid::Uuid;

// Submodules
#[cfg(windows)]
mod binding;
pub mod constants;
#[cfg(any(test, feature = "stub"))]
mod stub;

#[cfg(windows)]
pub use binding::WintunDll;
pub use constants::*;
#[cfg(any(test, feature = "stub"))]
pub use stub::{StubDriver, StubEvent};

/// Raw Win32 error code reported by the driver alongside a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsError(pub u32);

impl OsError {
    /// Returns the raw error code.
    pub fn code(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os error {}", self.0)
    }
}

/// Opaque adapter handle (`WINTUN_ADAPTER_HANDLE`). Zero is the "no adapter" sentinel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterHandle(pub usize);

impl AdapterHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Returns `true` for the null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque session handle (`WINTUN_SESSION_HANDLE`). Zero is the "not started" sentinel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub usize);

impl SessionHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Returns `true` for the null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A waitable object handed out by the driver for a session.
///
/// The driver signals it when the ring may hold packets and when the session is torn down.
/// The signal does not re-trigger for packets that were already queued when a waiter woke
/// up, so consumers must drain the ring until it reports empty before waiting again.
pub trait WaitEvent: Send + Sync {
    /// Blocks until the event is signaled or `timeout` elapses (`None` waits forever).
    /// Returns `Ok(true)` when signaled and `Ok(false)` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, OsError>;

    /// Signals the event, waking a waiter.
    fn set(&self) -> Result<(), OsError>;

    /// Runs `callback` every time the event is signaled, until the returned [`Registration`]
    /// is dropped. A registered callback consumes the signal like a waiter does.
    ///
    /// The callback may run on a thread owned by the implementation and must not block.
    fn register(
        self: Arc<Self>,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Registration, OsError>;
}

/// A callback registered with [`WaitEvent::register`].
///
/// Dropping it unregisters the callback. Once the drop returns the callback is not running
/// and will not run again.
pub struct Registration(Box<dyn Send>);

impl Registration {
    /// Wraps the value whose `Drop` undoes the registration.
    pub fn new(inner: impl Send + 'static) -> Self {
        Self(Box::new(inner))
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").finish_non_exhaustive()
    }
}

/// Raw driver operations.
///
/// # Safety
///
/// Implementors guarantee that a pointer returned by [`allocate_send_packet`] stays valid for
/// writes of the requested size until it is passed to [`send_packet`] or the session ends,
/// and that a pointer returned by [`receive_packet`] stays valid for reads of the reported size
/// until it is passed to [`release_receive_packet`] or the session ends.
///
/// [`allocate_send_packet`]: DriverBinding::allocate_send_packet
/// [`send_packet`]: DriverBinding::send_packet
/// [`receive_packet`]: DriverBinding::receive_packet
/// [`release_receive_packet`]: DriverBinding::release_receive_packet
pub unsafe trait DriverBinding: Send + Sync {
    /// `WintunCreateAdapter`
    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        requested_guid: Option<&Uuid>,
    ) -> Result<AdapterHandle, OsError>;

    /// `WintunOpenAdapter`
    fn open_adapter(&self, name: &str) -> Result<AdapterHandle, OsError>;

    /// `WintunCloseAdapter`
    fn close_adapter(&self, adapter: AdapterHandle) -> Result<(), OsError>;

    /// `WintunDeleteDriver`
    fn delete_driver(&self) -> Result<(), OsError>;

    /// `WintunGetRunningDriverVersion`. A failed query reports the code set by the driver.
    fn running_driver_version(&self) -> Result<u32, OsError>;

    /// `WintunGetAdapterLUID`. Returns the raw `NET_LUID` value.
    fn adapter_luid(&self, adapter: AdapterHandle) -> u64;

    /// `WintunStartSession`
    fn start_session(
        &self,
        adapter: AdapterHandle,
        ring_capacity: u32,
    ) -> Result<SessionHandle, OsError>;

    /// `WintunEndSession`
    fn end_session(&self, session: SessionHandle) -> Result<(), OsError>;

    /// `WintunGetReadWaitEvent`
    fn read_wait_event(&self, session: SessionHandle) -> Result<Arc<dyn WaitEvent>, OsError>;

    /// `WintunAllocateSendPacket`
    fn allocate_send_packet(&self, session: SessionHandle, size: u32)
        -> Result<NonNull<u8>, OsError>;

    /// `WintunSendPacket`
    fn send_packet(&self, session: SessionHandle, packet: NonNull<u8>);

    /// `WintunReceivePacket`. Returns the buffer and its size in bytes.
    fn receive_packet(&self, session: SessionHandle) -> Result<(NonNull<u8>, u32), OsError>;

    /// `WintunReleaseReceivePacket`
    fn release_receive_packet(&self, session: SessionHandle, packet: NonNull<u8>);
}
