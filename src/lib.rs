//! The wintunapi crate manages Wintun-style virtual (TUN) adapters and moves layer-3 packets
//! between user space and the driver through the session's shared-memory rings.
//!
//! The crate contains the following main modules: driver, wintunapi, lifecycle and async_api.
//!
//! ## driver
//! The driver module defines the [`DriverBinding`] boundary that mirrors the driver's exported
//! functions, the constants that bound rings and packets, and the Windows binding that loads
//! `wintun.dll`. With the `stub` feature it also provides `StubDriver`, an in-process double
//! of the driver for tests.
//!
//! ## wintunapi
//! The wintunapi module contains the main functionality: [`Wintun`] creates and opens
//! [`Adapter`]s, an adapter starts [`Session`]s, and a session allocates, sends, receives and
//! releases packets. Ownership follows the resource hierarchy, so a session cannot outlive its
//! adapter and the driver cannot be uninstalled while an adapter is open.
//!
//! ## lifecycle
//! The lifecycle module sequences a full run (version check, adapter, session, packet work,
//! teardown) with best-effort cleanup on failure.
//!
//! ## async_api
//! The async_api module lets an async task await received packets.
//!
//! ## netlib
//! Small value types describing adapters: [`GuidWrapper`] and [`IfLuid`].

mod async_api;
pub mod driver;
mod error;
mod lifecycle;
mod netlib;
mod wintunapi;

pub use crate::async_api::{AsyncReceiver, EventStream};

#[cfg(windows)]
pub use crate::driver::WintunDll;
pub use crate::driver::{
    AdapterHandle, DriverBinding, OsError, Registration, SessionHandle, WaitEvent,
    MAX_ADAPTER_NAME, PACKET_SIZE_MAX, RING_CAPACITY_MAX, RING_CAPACITY_MIN,
};
#[cfg(any(test, feature = "stub"))]
pub use crate::driver::{StubDriver, StubEvent};

pub use crate::error::{Error, Operation, Result};

pub use crate::lifecycle::{AdapterSource, Lifecycle, LifecycleConfig, DEFAULT_RING_CAPACITY};

pub use crate::netlib::{GuidWrapper, IfLuid};

pub use crate::wintunapi::{
    Adapter, LoopExit, ReadWaitEvent, ReceivedPacket, SendPacket, Session, SessionState,
    Version, WaitStatus, Wintun,
};
