//! # Submodule: Wintun constants
//!
//! This submodule contains the limits enforced by the Wintun driver and the Win32 error codes
//! the driver reports through `GetLastError`. The codes are kept as plain `u32` values so the
//! translation in [`crate::Error`] works the same against the Windows binding and the
//! in-process stub.

/// Default file name of the driver's user-mode library.
pub const WINTUN_DLL_NAME: &str = "wintun.dll";

/// Minimum ring capacity accepted by `WintunStartSession` (128 KiB).
pub const RING_CAPACITY_MIN: u32 = 0x20000;

/// Maximum ring capacity accepted by `WintunStartSession` (64 MiB).
pub const RING_CAPACITY_MAX: u32 = 0x4000000;

/// Maximum size of a single layer-3 packet in the ring.
pub const PACKET_SIZE_MAX: u32 = 0xFFFF;

/// Maximum length of an adapter name or tunnel type, in UTF-16 units, including the
/// terminating NUL.
pub const MAX_ADAPTER_NAME: usize = 128;

/// Win32 `ERROR_FILE_NOT_FOUND`, reported when the driver or an adapter does not exist.
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
/// Win32 `ERROR_PATH_NOT_FOUND`.
pub const ERROR_PATH_NOT_FOUND: u32 = 3;
/// Win32 `ERROR_ACCESS_DENIED`, reported when the caller is not elevated.
pub const ERROR_ACCESS_DENIED: u32 = 5;
/// Win32 `ERROR_INVALID_HANDLE`.
pub const ERROR_INVALID_HANDLE: u32 = 6;
/// Win32 `ERROR_NOT_ENOUGH_MEMORY`.
pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
/// Win32 `ERROR_INVALID_DATA`, reported when the ring is corrupt.
pub const ERROR_INVALID_DATA: u32 = 13;
/// Win32 `ERROR_OUTOFMEMORY`.
pub const ERROR_OUTOFMEMORY: u32 = 14;
/// Win32 `ERROR_SHARING_VIOLATION`.
pub const ERROR_SHARING_VIOLATION: u32 = 32;
/// Win32 `ERROR_HANDLE_EOF`, reported by the ring once the adapter is terminating.
pub const ERROR_HANDLE_EOF: u32 = 38;
/// Win32 `ERROR_INVALID_PARAMETER`.
pub const ERROR_INVALID_PARAMETER: u32 = 87;
/// Win32 `ERROR_BUFFER_OVERFLOW`, reported by `WintunAllocateSendPacket` when the ring is full.
pub const ERROR_BUFFER_OVERFLOW: u32 = 111;
/// Win32 `ERROR_INVALID_NAME`.
pub const ERROR_INVALID_NAME: u32 = 123;
/// Win32 `ERROR_MOD_NOT_FOUND`, reported when the driver library cannot be loaded.
pub const ERROR_MOD_NOT_FOUND: u32 = 126;
/// Win32 `ERROR_PROC_NOT_FOUND`, reported when an export is missing from the library.
pub const ERROR_PROC_NOT_FOUND: u32 = 127;
/// Win32 `ERROR_BUSY`.
pub const ERROR_BUSY: u32 = 170;
/// Win32 `ERROR_NO_MORE_ITEMS`, reported by `WintunReceivePacket` when the ring is empty.
pub const ERROR_NO_MORE_ITEMS: u32 = 259;
/// Win32 `ERROR_SERVICE_DOES_NOT_EXIST`.
pub const ERROR_SERVICE_DOES_NOT_EXIST: u32 = 1060;
/// Win32 `ERROR_SERVICE_NOT_ACTIVE`.
pub const ERROR_SERVICE_NOT_ACTIVE: u32 = 1062;
/// Win32 `ERROR_NOT_FOUND`.
pub const ERROR_NOT_FOUND: u32 = 1168;
/// Win32 `ERROR_DEVICE_NOT_AVAILABLE`.
pub const ERROR_DEVICE_NOT_AVAILABLE: u32 = 4319;
