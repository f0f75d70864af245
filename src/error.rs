//! Error types for adapter, session and ring operations.

use std::fmt;

use crate::driver::{constants::*, OsError};
use crate::wintunapi::SessionState;

/// Result type for Wintun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The driver call (or local step) an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    LoadLibrary,
    CreateAdapter,
    OpenAdapter,
    CloseAdapter,
    DeleteDriver,
    QueryVersion,
    GetAdapterLuid,
    StartSession,
    EndSession,
    GetReadWaitEvent,
    Wait,
    AllocateSendPacket,
    SendPacket,
    ReceivePacket,
    ReleaseReceivePacket,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::LoadLibrary => "load driver library",
            Operation::CreateAdapter => "create adapter",
            Operation::OpenAdapter => "open adapter",
            Operation::CloseAdapter => "close adapter",
            Operation::DeleteDriver => "delete driver",
            Operation::QueryVersion => "query driver version",
            Operation::GetAdapterLuid => "get adapter LUID",
            Operation::StartSession => "start session",
            Operation::EndSession => "end session",
            Operation::GetReadWaitEvent => "get read-wait event",
            Operation::Wait => "wait on read-wait event",
            Operation::AllocateSendPacket => "allocate send packet",
            Operation::SendPacket => "send packet",
            Operation::ReceivePacket => "receive packet",
            Operation::ReleaseReceivePacket => "release receive packet",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while driving adapters, sessions and the packet ring.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The caller lacks the privileges the driver requires.
    #[error("{op}: permission denied ({os})")]
    PermissionDenied { op: Operation, os: OsError },

    /// The driver is not installed, not running, or its library could not be loaded.
    #[error("{op}: driver not loaded{}", fmt_os(.os))]
    DriverNotLoaded { op: Operation, os: Option<OsError> },

    /// No adapter with the requested name exists.
    #[error("{op}: not found ({os})")]
    NotFound { op: Operation, os: OsError },

    /// A name, size or capacity was rejected, locally or by the driver.
    #[error("{op}: invalid parameter: {detail}{}", fmt_os(.os))]
    InvalidParameter {
        op: Operation,
        detail: String,
        os: Option<OsError>,
    },

    /// The driver could not allocate memory for the resource.
    #[error("{op}: resource exhausted ({os})")]
    ResourceExhausted { op: Operation, os: OsError },

    /// The send ring has no room for the requested packet. Retry once the driver drains it.
    #[error("send ring is full")]
    RingFull,

    /// The receive ring is currently empty. Wait on the read-wait event and retry.
    #[error("no packet available")]
    WouldBlock,

    /// The session was ended, possibly by another thread.
    #[error("session ended")]
    SessionEnded,

    /// The driver refused to uninstall while it still had live handles.
    #[error("driver busy ({os})")]
    ResourceBusy { os: OsError },

    /// The session is not in a state that allows the operation.
    #[error("{op}: session is {state:?}")]
    InvalidState { op: Operation, state: SessionState },

    /// The driver failed with a code that has no dedicated meaning for the operation.
    #[error("{op}: driver error ({os})")]
    Driver { op: Operation, os: OsError },
}

fn fmt_os(os: &Option<OsError>) -> String {
    os.map(|os| format!(" ({os})")).unwrap_or_default()
}

impl Error {
    /// Translates the code reported by a failed driver call into the error taxonomy.
    pub fn from_os(op: Operation, os: OsError) -> Self {
        match os.0 {
            ERROR_ACCESS_DENIED => Error::PermissionDenied { op, os },
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND | ERROR_NOT_FOUND
                if op == Operation::OpenAdapter =>
            {
                Error::NotFound { op, os }
            }
            ERROR_FILE_NOT_FOUND
            | ERROR_PATH_NOT_FOUND
            | ERROR_MOD_NOT_FOUND
            | ERROR_PROC_NOT_FOUND
            | ERROR_SERVICE_DOES_NOT_EXIST
            | ERROR_SERVICE_NOT_ACTIVE
            | ERROR_DEVICE_NOT_AVAILABLE => Error::DriverNotLoaded { op, os: Some(os) },
            ERROR_INVALID_PARAMETER | ERROR_INVALID_NAME => Error::InvalidParameter {
                op,
                detail: "rejected by driver".into(),
                os: Some(os),
            },
            ERROR_BUFFER_OVERFLOW if op == Operation::AllocateSendPacket => Error::RingFull,
            ERROR_NOT_ENOUGH_MEMORY | ERROR_OUTOFMEMORY | ERROR_BUFFER_OVERFLOW => {
                Error::ResourceExhausted { op, os }
            }
            ERROR_NO_MORE_ITEMS if op == Operation::ReceivePacket => Error::WouldBlock,
            ERROR_HANDLE_EOF => Error::SessionEnded,
            _ if op == Operation::DeleteDriver => Error::ResourceBusy { os },
            ERROR_BUSY | ERROR_SHARING_VIOLATION => Error::ResourceBusy { os },
            _ => Error::Driver { op, os },
        }
    }

    /// Builds a locally detected `InvalidParameter` error.
    pub(crate) fn invalid(op: Operation, detail: impl Into<String>) -> Self {
        Error::InvalidParameter {
            op,
            detail: detail.into(),
            os: None,
        }
    }

    /// Returns `true` for errors that are part of normal ring operation and should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RingFull | Error::WouldBlock)
    }

    /// Returns the OS error code carried by the error, if any.
    pub fn os_error(&self) -> Option<OsError> {
        match self {
            Error::PermissionDenied { os, .. }
            | Error::NotFound { os, .. }
            | Error::ResourceExhausted { os, .. }
            | Error::ResourceBusy { os }
            | Error::Driver { os, .. } => Some(*os),
            Error::DriverNotLoaded { os, .. } | Error::InvalidParameter { os, .. } => *os,
            Error::RingFull
            | Error::WouldBlock
            | Error::SessionEnded
            | Error::InvalidState { .. } => None,
        }
    }
}
