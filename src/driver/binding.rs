//! # Submodule: WintunDll
//!
//! Runtime binding to `wintun.dll`. The library is loaded with `LoadLibraryExW`, restricted to
//! the application directory and System32, and every export is resolved up front into a table
//! of typed function pointers. A missing export fails the load rather than the first call.
//!
//! The process-wide instance behind [`WintunDll::global`] is created once and never mutated
//! afterwards, so the table is read without locking. The driver's log output is routed into
//! `tracing` through `WintunSetLogger`.

use std::{
    ffi::c_void,
    path::Path,
    ptr::{self, NonNull},
    sync::{Arc, OnceLock},
    time::Duration,
};

use tracing::{error, info, warn};
use uuid::Uuid;
use windows::{
    core::{s, GUID, HSTRING, PCSTR, PCWSTR},
    Win32::{
        Foundation::{
            FreeLibrary, GetLastError, BOOL, BOOLEAN, FARPROC, HANDLE, HMODULE,
            INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
        },
        NetworkManagement::Ndis::NET_LUID_LH,
        System::{
            LibraryLoader::{
                GetProcAddress, LoadLibraryExW, LOAD_LIBRARY_SEARCH_APPLICATION_DIR,
                LOAD_LIBRARY_SEARCH_SYSTEM32,
            },
            Threading::{
                RegisterWaitForSingleObject, SetEvent, UnregisterWaitEx, WaitForSingleObject,
                INFINITE, WT_EXECUTEINWAITTHREAD,
            },
        },
    },
};

use super::{
    constants::*, AdapterHandle, DriverBinding, OsError, Registration, SessionHandle, WaitEvent,
};
use crate::netlib::{GuidWrapper, IfLuid};

type CreateAdapterFn = unsafe extern "system" fn(PCWSTR, PCWSTR, *const GUID) -> usize;
type OpenAdapterFn = unsafe extern "system" fn(PCWSTR) -> usize;
type CloseAdapterFn = unsafe extern "system" fn(usize);
type DeleteDriverFn = unsafe extern "system" fn() -> BOOL;
type GetAdapterLuidFn = unsafe extern "system" fn(usize, *mut NET_LUID_LH);
type GetRunningDriverVersionFn = unsafe extern "system" fn() -> u32;
type LoggerCallback = unsafe extern "system" fn(i32, u64, PCWSTR);
type SetLoggerFn = unsafe extern "system" fn(Option<LoggerCallback>);
type StartSessionFn = unsafe extern "system" fn(usize, u32) -> usize;
type EndSessionFn = unsafe extern "system" fn(usize);
type GetReadWaitEventFn = unsafe extern "system" fn(usize) -> HANDLE;
type ReceivePacketFn = unsafe extern "system" fn(usize, *mut u32) -> *mut u8;
type ReleaseReceivePacketFn = unsafe extern "system" fn(usize, *const u8);
type AllocateSendPacketFn = unsafe extern "system" fn(usize, u32) -> *mut u8;
type SendPacketFn = unsafe extern "system" fn(usize, *const u8);

static WINTUN: OnceLock<Result<Arc<WintunDll>, OsError>> = OnceLock::new();

/// Function table resolved from a loaded `wintun.dll`.
pub struct WintunDll {
    module: HMODULE,
    create_adapter: CreateAdapterFn,
    open_adapter: OpenAdapterFn,
    close_adapter: CloseAdapterFn,
    delete_driver: DeleteDriverFn,
    get_adapter_luid: GetAdapterLuidFn,
    get_running_driver_version: GetRunningDriverVersionFn,
    start_session: StartSessionFn,
    end_session: EndSessionFn,
    get_read_wait_event: GetReadWaitEventFn,
    receive_packet: ReceivePacketFn,
    release_receive_packet: ReleaseReceivePacketFn,
    allocate_send_packet: AllocateSendPacketFn,
    send_packet: SendPacketFn,
}

// SAFETY: the table is immutable after loading and the Wintun exports are thread-safe.
unsafe impl Send for WintunDll {}
unsafe impl Sync for WintunDll {}

fn last_error() -> OsError {
    OsError(unsafe { GetLastError() }.0)
}

/// Recovers the Win32 code from an `HRESULT_FROM_WIN32` error.
fn win32_code(err: &windows::core::Error) -> OsError {
    OsError((err.code().0 as u32) & 0xFFFF)
}

fn resolve(module: HMODULE, name: PCSTR) -> Result<unsafe extern "system" fn() -> isize, OsError> {
    let proc: FARPROC = unsafe { GetProcAddress(module, name) };
    proc.ok_or_else(last_error)
}

/// Resolves an export and reinterprets it as the given function pointer type.
macro_rules! resolve {
    ($module:expr, $name:literal) => {{
        let proc = resolve($module, s!($name))?;
        // SAFETY: the export has the signature of the target type per wintun.h.
        unsafe { std::mem::transmute(proc) }
    }};
}

impl WintunDll {
    /// Returns the process-wide binding, loading `wintun.dll` on first use.
    ///
    /// A failed load is remembered as well; later calls return the same error.
    pub fn global() -> Result<Arc<WintunDll>, OsError> {
        WINTUN
            .get_or_init(|| Self::load_from(WINTUN_DLL_NAME).map(Arc::new))
            .clone()
    }

    /// Loads the library from `path` and resolves its exports.
    ///
    /// Each call loads an independent instance. Prefer [`WintunDll::global`] unless a custom
    /// location is required.
    ///
    /// # Errors
    ///
    /// The OS error reported by `LoadLibraryExW` or `GetProcAddress`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, OsError> {
        let path = HSTRING::from(path.as_ref());
        let module = unsafe {
            LoadLibraryExW(
                &path,
                HANDLE::default(),
                LOAD_LIBRARY_SEARCH_APPLICATION_DIR | LOAD_LIBRARY_SEARCH_SYSTEM32,
            )
        }
        .map_err(|err| win32_code(&err))?;

        match Self::resolve_all(module) {
            Ok(dll) => {
                info!(path = %path, "wintun library loaded");
                Ok(dll)
            }
            Err(os) => {
                let _ = unsafe { FreeLibrary(module) };
                error!(path = %path, %os, "wintun library is missing exports");
                Err(os)
            }
        }
    }

    fn resolve_all(module: HMODULE) -> Result<Self, OsError> {
        let set_logger: SetLoggerFn = resolve!(module, "WintunSetLogger");
        unsafe { set_logger(Some(forward_log)) };

        Ok(Self {
            module,
            create_adapter: resolve!(module, "WintunCreateAdapter"),
            open_adapter: resolve!(module, "WintunOpenAdapter"),
            close_adapter: resolve!(module, "WintunCloseAdapter"),
            delete_driver: resolve!(module, "WintunDeleteDriver"),
            get_adapter_luid: resolve!(module, "WintunGetAdapterLUID"),
            get_running_driver_version: resolve!(module, "WintunGetRunningDriverVersion"),
            start_session: resolve!(module, "WintunStartSession"),
            end_session: resolve!(module, "WintunEndSession"),
            get_read_wait_event: resolve!(module, "WintunGetReadWaitEvent"),
            receive_packet: resolve!(module, "WintunReceivePacket"),
            release_receive_packet: resolve!(module, "WintunReleaseReceivePacket"),
            allocate_send_packet: resolve!(module, "WintunAllocateSendPacket"),
            send_packet: resolve!(module, "WintunSendPacket"),
        })
    }
}

impl Drop for WintunDll {
    fn drop(&mut self) {
        if let Err(err) = unsafe { FreeLibrary(self.module) } {
            warn!(%err, "failed to unload wintun library");
        }
    }
}

/// `WINTUN_LOGGER_CALLBACK`: levels are 0 info, 1 warning, 2 error.
unsafe extern "system" fn forward_log(level: i32, _timestamp: u64, message: PCWSTR) {
    let message = message.to_string().unwrap_or_default();
    match level {
        0 => info!(target: "wintun", "{message}"),
        1 => warn!(target: "wintun", "{message}"),
        _ => error!(target: "wintun", "{message}"),
    }
}

/// Read-wait event handle owned by the driver session.
struct Win32Event(HANDLE);

impl WaitEvent for Win32Event {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, OsError> {
        let millis = match timeout {
            Some(timeout) => u32::try_from(timeout.as_millis()).unwrap_or(INFINITE - 1),
            None => INFINITE,
        };
        let rc = unsafe { WaitForSingleObject(self.0, millis) };
        if rc == WAIT_OBJECT_0 {
            Ok(true)
        } else if rc == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(last_error())
        }
    }

    fn set(&self) -> Result<(), OsError> {
        unsafe { SetEvent(self.0) }.map_err(|err| win32_code(&err))
    }

    fn register(
        self: Arc<Self>,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Registration, OsError> {
        let callback = Box::into_raw(Box::new(callback));
        let mut wait_object = HANDLE::default();
        let rc = unsafe {
            RegisterWaitForSingleObject(
                &mut wait_object,
                self.0,
                Some(on_signaled),
                Some(callback as *const c_void),
                INFINITE,
                WT_EXECUTEINWAITTHREAD,
            )
        };
        if !rc.as_bool() {
            let os = last_error();
            drop(unsafe { Box::from_raw(callback) });
            return Err(os);
        }
        Ok(Registration::new(WaitRegistration {
            wait_object,
            callback,
            _event: self,
        }))
    }
}

type EventCallback = Box<dyn Fn() + Send + Sync>;

unsafe extern "system" fn on_signaled(context: *mut c_void, _timed_out: BOOLEAN) {
    let callback = &*(context as *const EventCallback);
    callback();
}

/// Thread-pool wait registered on a read-wait event.
struct WaitRegistration {
    wait_object: HANDLE,
    callback: *mut EventCallback,
    _event: Arc<Win32Event>,
}

// SAFETY: the wait object is a plain handle and the callback box is only freed on drop, after
// the thread pool has stopped using it.
unsafe impl Send for WaitRegistration {}

impl Drop for WaitRegistration {
    fn drop(&mut self) {
        // INVALID_HANDLE_VALUE makes the call wait for a running callback to return.
        if !unsafe { UnregisterWaitEx(self.wait_object, INVALID_HANDLE_VALUE) }.as_bool() {
            // The callback may still run; leak it rather than free it under the thread pool.
            error!(os = %last_error(), "failed to unregister read-wait callback");
            return;
        }
        drop(unsafe { Box::from_raw(self.callback) });
    }
}

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(Some(0)).collect()
}

fn handle_or_last_error(raw: usize) -> Result<usize, OsError> {
    if raw == 0 {
        Err(last_error())
    } else {
        Ok(raw)
    }
}

// SAFETY: buffer lifetimes are those documented for the Wintun ring API, and Wintun
// serializes concurrent allocate/send calls on a session internally.
unsafe impl DriverBinding for WintunDll {
    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        requested_guid: Option<&Uuid>,
    ) -> Result<AdapterHandle, OsError> {
        let name = wide(name);
        let tunnel_type = wide(tunnel_type);
        let guid = requested_guid.map(|uuid| GuidWrapper::from(*uuid).to_guid());
        let guid_ptr = guid.as_ref().map_or(ptr::null(), |guid| guid as *const _);
        let raw = unsafe {
            (self.create_adapter)(
                PCWSTR::from_raw(name.as_ptr()),
                PCWSTR::from_raw(tunnel_type.as_ptr()),
                guid_ptr,
            )
        };
        handle_or_last_error(raw).map(AdapterHandle)
    }

    fn open_adapter(&self, name: &str) -> Result<AdapterHandle, OsError> {
        let name = wide(name);
        let raw = unsafe { (self.open_adapter)(PCWSTR::from_raw(name.as_ptr())) };
        handle_or_last_error(raw).map(AdapterHandle)
    }

    fn close_adapter(&self, adapter: AdapterHandle) -> Result<(), OsError> {
        unsafe { (self.close_adapter)(adapter.0) };
        Ok(())
    }

    fn delete_driver(&self) -> Result<(), OsError> {
        if unsafe { (self.delete_driver)() }.as_bool() {
            Ok(())
        } else {
            Err(last_error())
        }
    }

    fn running_driver_version(&self) -> Result<u32, OsError> {
        match unsafe { (self.get_running_driver_version)() } {
            0 => Err(last_error()),
            version => Ok(version),
        }
    }

    fn adapter_luid(&self, adapter: AdapterHandle) -> u64 {
        let mut luid = NET_LUID_LH::default();
        unsafe { (self.get_adapter_luid)(adapter.0, &mut luid) };
        IfLuid::from(luid).value()
    }

    fn start_session(
        &self,
        adapter: AdapterHandle,
        ring_capacity: u32,
    ) -> Result<SessionHandle, OsError> {
        let raw = unsafe { (self.start_session)(adapter.0, ring_capacity) };
        handle_or_last_error(raw).map(SessionHandle)
    }

    fn end_session(&self, session: SessionHandle) -> Result<(), OsError> {
        unsafe { (self.end_session)(session.0) };
        Ok(())
    }

    fn read_wait_event(&self, session: SessionHandle) -> Result<Arc<dyn WaitEvent>, OsError> {
        let handle = unsafe { (self.get_read_wait_event)(session.0) };
        if handle.is_invalid() {
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        Ok(Arc::new(Win32Event(handle)))
    }

    fn allocate_send_packet(
        &self,
        session: SessionHandle,
        size: u32,
    ) -> Result<NonNull<u8>, OsError> {
        let raw = unsafe { (self.allocate_send_packet)(session.0, size) };
        NonNull::new(raw).ok_or_else(last_error)
    }

    fn send_packet(&self, session: SessionHandle, packet: NonNull<u8>) {
        unsafe { (self.send_packet)(session.0, packet.as_ptr()) }
    }

    fn receive_packet(&self, session: SessionHandle) -> Result<(NonNull<u8>, u32), OsError> {
        let mut size = 0u32;
        let raw = unsafe { (self.receive_packet)(session.0, &mut size) };
        NonNull::new(raw).map(|ptr| (ptr, size)).ok_or_else(last_error)
    }

    fn release_receive_packet(&self, session: SessionHandle, packet: NonNull<u8>) {
        unsafe { (self.release_receive_packet)(session.0, packet.as_ptr()) }
    }
}

