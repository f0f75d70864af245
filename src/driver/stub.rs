//! # Submodule: StubDriver
//!
//! An in-process double of the driver's observable contract. It hands out real handles and
//! real heap buffers, keeps per-session ring accounting, queues inbound packets behind a
//! read-wait event, and records every contract violation (double release, double close,
//! closing an adapter under a live session) instead of crashing, so tests can assert on them.
//!
//! The stub is also useful for developing against this crate on machines without the driver.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::Duration,
};

use uuid::Uuid;

use super::{
    constants::*, AdapterHandle, DriverBinding, OsError, Registration, SessionHandle, WaitEvent,
};
use crate::Operation;

/// Ring bytes taken by a packet of `size` bytes: a 4-byte header, rounded up to 4 bytes.
pub(crate) fn ring_footprint(size: usize) -> usize {
    (size + 4 + 3) & !3
}

type Watcher = Arc<dyn Fn() + Send + Sync>;

/// Auto-reset event backed by a condition variable.
///
/// While callbacks are registered, [`WaitEvent::set`] runs them on the calling thread instead
/// of latching the signal.
#[derive(Default)]
pub struct StubEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
    waits: AtomicUsize,
    watchers: Mutex<Vec<(usize, Watcher)>>,
    next_watcher: AtomicUsize,
}

impl StubEvent {
    /// Number of times a waiter has entered [`WaitEvent::wait`].
    pub fn wait_count(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    /// Returns `true` if the event is currently signaled.
    pub fn is_signaled(&self) -> bool {
        *lock(&self.signaled)
    }

    /// Number of callbacks currently registered.
    pub fn watcher_count(&self) -> usize {
        lock(&self.watchers).len()
    }
}

impl fmt::Debug for StubEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubEvent")
            .field("signaled", &self.is_signaled())
            .field("waits", &self.wait_count())
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

/// Heap buffer handed to the caller through a raw pointer.
struct RawBuf(NonNull<[u8]>);

// SAFETY: the buffer is uniquely owned by the stub; the caller only touches it through the
// pointer between hand-out and hand-back, which the session layer serializes.
unsafe impl Send for RawBuf {}

impl RawBuf {
    fn new(data: Vec<u8>) -> Self {
        let raw = Box::into_raw(data.into_boxed_slice());
        // SAFETY: Box::into_raw never returns null.
        Self(unsafe { NonNull::new_unchecked(raw) })
    }

    fn data_ptr(&self) -> NonNull<u8> {
        self.0.cast()
    }

    fn key(&self) -> usize {
        self.data_ptr().as_ptr() as usize
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn to_vec(&self) -> Vec<u8> {
        // SAFETY: the buffer is live until this RawBuf is dropped.
        unsafe { self.0.as_ref() }.to_vec()
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        // SAFETY: created by Box::into_raw in RawBuf::new and freed only here.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

struct StubAdapter {
    name: String,
    created: bool,
}

struct StubSession {
    adapter: AdapterHandle,
    capacity: usize,
    used: usize,
    ended: bool,
    event: Arc<StubEvent>,
    allocated: HashMap<usize, RawBuf>,
    sent: VecDeque<RawBuf>,
    inbound: VecDeque<Vec<u8>>,
    outstanding: HashMap<usize, RawBuf>,
}

impl StubSession {
    fn release_all(&mut self) {
        self.allocated.clear();
        self.sent.clear();
        self.inbound.clear();
        self.outstanding.clear();
        self.used = 0;
    }
}

struct StubState {
    version: u32,
    next_handle: usize,
    installed: HashSet<String>,
    adapters: HashMap<AdapterHandle, StubAdapter>,
    sessions: HashMap<SessionHandle, StubSession>,
    failures: HashMap<Operation, u32>,
    calls: HashMap<Operation, usize>,
    violations: Vec<String>,
    deleted: bool,
}

/// In-process implementation of [`DriverBinding`].
pub struct StubDriver {
    state: Mutex<StubState>,
}

impl Default for StubDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StubDriver {
    /// Creates a stub reporting driver version 0.14 and handing out handles starting at 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                version: 0x000E_0000,
                next_handle: 1,
                installed: HashSet::new(),
                adapters: HashMap::new(),
                sessions: HashMap::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                violations: Vec::new(),
                deleted: false,
            }),
        }
    }

    /// Sets the value returned by `running_driver_version`; 0 models an unloaded driver.
    pub fn set_version(&self, version: u32) {
        lock(&self.state).version = version;
    }

    /// Registers an adapter that already exists on the system, so it can be opened by name.
    pub fn install_adapter(&self, name: &str) {
        lock(&self.state).installed.insert(name.to_owned());
    }

    /// Makes the next call to `op` fail with `code`.
    pub fn fail_next(&self, op: Operation, code: u32) {
        lock(&self.state).failures.insert(op, code);
    }

    /// Number of times the driver entry point behind `op` was invoked.
    pub fn calls(&self, op: Operation) -> usize {
        lock(&self.state).calls.get(&op).copied().unwrap_or(0)
    }

    /// Contract violations observed so far, in order.
    pub fn violations(&self) -> Vec<String> {
        lock(&self.state).violations.clone()
    }

    /// Number of adapter handles currently open.
    pub fn open_adapters(&self) -> usize {
        lock(&self.state).adapters.len()
    }

    /// Number of sessions that were started and not yet ended.
    pub fn active_sessions(&self) -> usize {
        lock(&self.state)
            .sessions
            .values()
            .filter(|session| !session.ended)
            .count()
    }

    /// Returns `true` once `delete_driver` succeeded.
    pub fn is_deleted(&self) -> bool {
        lock(&self.state).deleted
    }

    /// Read-wait event of a session, for inspecting wait counts.
    pub fn event(&self, session: SessionHandle) -> Option<Arc<StubEvent>> {
        lock(&self.state)
            .sessions
            .get(&session)
            .map(|session| session.event.clone())
    }

    /// Queues one inbound packet and signals the read-wait event.
    pub fn inject(&self, session: SessionHandle, packet: &[u8]) {
        self.inject_batch(session, [packet]);
    }

    /// Queues several inbound packets and signals the read-wait event once.
    pub fn inject_batch<'a, I>(&self, session: SessionHandle, packets: I)
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let event = {
            let mut state = lock(&self.state);
            let Some(ring) = state.sessions.get_mut(&session).filter(|s| !s.ended) else {
                return;
            };
            for packet in packets {
                assert!(
                    !packet.is_empty() && packet.len() <= PACKET_SIZE_MAX as usize,
                    "inbound packet size out of range"
                );
                ring.inbound.push_back(packet.to_vec());
            }
            ring.event.clone()
        };
        let _ = event.set();
    }

    /// Consumes every packet committed with `send_packet`, in commit order, freeing ring space.
    pub fn take_sent(&self, session: SessionHandle) -> Vec<Vec<u8>> {
        let mut state = lock(&self.state);
        let Some(ring) = state.sessions.get_mut(&session) else {
            return Vec::new();
        };
        let packets: Vec<_> = ring.sent.drain(..).collect();
        for packet in &packets {
            ring.used -= ring_footprint(packet.len());
        }
        packets.iter().map(RawBuf::to_vec).collect()
    }

    /// Number of received packets the caller has not yet released.
    pub fn outstanding_receives(&self, session: SessionHandle) -> usize {
        lock(&self.state)
            .sessions
            .get(&session)
            .map_or(0, |ring| ring.outstanding.len())
    }

    /// Records the call and returns an injected failure, if any.
    fn enter(&self, state: &mut StubState, op: Operation) -> Result<(), OsError> {
        *state.calls.entry(op).or_default() += 1;
        match state.failures.remove(&op) {
            Some(code) => Err(OsError(code)),
            None => Ok(()),
        }
    }

    fn allocate_handle(state: &mut StubState) -> usize {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('\0') && name.encode_utf16().count() < MAX_ADAPTER_NAME
}

// SAFETY: every pointer handed out belongs to a RawBuf kept in the session's maps until it is
// sent, released, or the session ends.
unsafe impl DriverBinding for StubDriver {
    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        _requested_guid: Option<&Uuid>,
    ) -> Result<AdapterHandle, OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::CreateAdapter)?;
        if state.version == 0 {
            return Err(OsError(ERROR_FILE_NOT_FOUND));
        }
        if !valid_name(name) || !valid_name(tunnel_type) {
            return Err(OsError(ERROR_INVALID_NAME));
        }
        let handle = AdapterHandle(Self::allocate_handle(&mut state));
        state.installed.insert(name.to_owned());
        state.adapters.insert(
            handle,
            StubAdapter {
                name: name.to_owned(),
                created: true,
            },
        );
        Ok(handle)
    }

    fn open_adapter(&self, name: &str) -> Result<AdapterHandle, OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::OpenAdapter)?;
        if !state.installed.contains(name) {
            return Err(OsError(ERROR_FILE_NOT_FOUND));
        }
        let handle = AdapterHandle(Self::allocate_handle(&mut state));
        state.adapters.insert(
            handle,
            StubAdapter {
                name: name.to_owned(),
                created: false,
            },
        );
        Ok(handle)
    }

    fn close_adapter(&self, adapter: AdapterHandle) -> Result<(), OsError> {
        let mut state = lock(&self.state);
        let injected = self.enter(&mut state, Operation::CloseAdapter);
        let live_sessions = state
            .sessions
            .values()
            .any(|session| session.adapter == adapter && !session.ended);
        if live_sessions {
            state
                .violations
                .push(format!("adapter {} closed with a live session", adapter.0));
        }
        match state.adapters.remove(&adapter) {
            Some(removed) => {
                if removed.created {
                    state.installed.remove(&removed.name);
                }
            }
            None => {
                state
                    .violations
                    .push(format!("close of unknown adapter {}", adapter.0));
                return Err(OsError(ERROR_INVALID_HANDLE));
            }
        }
        injected
    }

    fn delete_driver(&self) -> Result<(), OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::DeleteDriver)?;
        if !state.adapters.is_empty() {
            return Err(OsError(ERROR_BUSY));
        }
        state.deleted = true;
        state.version = 0;
        Ok(())
    }

    fn running_driver_version(&self) -> Result<u32, OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::QueryVersion)?;
        match state.version {
            0 => Err(OsError(ERROR_FILE_NOT_FOUND)),
            version => Ok(version),
        }
    }

    fn adapter_luid(&self, adapter: AdapterHandle) -> u64 {
        // IF_TYPE_PROP_VIRTUAL in the interface-type bits, the handle as the net LUID index.
        (53u64 << 48) | ((adapter.0 as u64 & 0xFF_FFFF) << 24)
    }

    fn start_session(
        &self,
        adapter: AdapterHandle,
        ring_capacity: u32,
    ) -> Result<SessionHandle, OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::StartSession)?;
        if !state.adapters.contains_key(&adapter) {
            state
                .violations
                .push(format!("session started on unknown adapter {}", adapter.0));
            return Err(OsError(ERROR_INVALID_HANDLE));
        }
        if !(RING_CAPACITY_MIN..=RING_CAPACITY_MAX).contains(&ring_capacity) {
            return Err(OsError(ERROR_INVALID_PARAMETER));
        }
        let handle = SessionHandle(Self::allocate_handle(&mut state));
        state.sessions.insert(
            handle,
            StubSession {
                adapter,
                capacity: ring_capacity as usize,
                used: 0,
                ended: false,
                event: Arc::new(StubEvent::default()),
                allocated: HashMap::new(),
                sent: VecDeque::new(),
                inbound: VecDeque::new(),
                outstanding: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn end_session(&self, session: SessionHandle) -> Result<(), OsError> {
        let mut state = lock(&self.state);
        let injected = self.enter(&mut state, Operation::EndSession);
        let event = match state.sessions.get_mut(&session) {
            Some(ring) if !ring.ended => {
                ring.ended = true;
                ring.release_all();
                ring.event.clone()
            }
            _ => {
                state
                    .violations
                    .push(format!("end of unknown or ended session {}", session.0));
                return Err(OsError(ERROR_INVALID_HANDLE));
            }
        };
        drop(state);
        // Teardown is signaled through the read-wait event.
        let _ = event.set();
        injected
    }

    fn read_wait_event(&self, session: SessionHandle) -> Result<Arc<dyn WaitEvent>, OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::GetReadWaitEvent)?;
        match state.sessions.get(&session) {
            Some(ring) if !ring.ended => Ok(ring.event.clone()),
            _ => Err(OsError(ERROR_INVALID_HANDLE)),
        }
    }

    fn allocate_send_packet(
        &self,
        session: SessionHandle,
        size: u32,
    ) -> Result<NonNull<u8>, OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::AllocateSendPacket)?;
        let ring = match state.sessions.get_mut(&session) {
            Some(ring) if !ring.ended => ring,
            Some(_) => return Err(OsError(ERROR_HANDLE_EOF)),
            None => return Err(OsError(ERROR_INVALID_HANDLE)),
        };
        if size == 0 || size > PACKET_SIZE_MAX {
            return Err(OsError(ERROR_INVALID_PARAMETER));
        }
        let footprint = ring_footprint(size as usize);
        if ring.used + footprint > ring.capacity {
            return Err(OsError(ERROR_BUFFER_OVERFLOW));
        }
        ring.used += footprint;
        let buf = RawBuf::new(vec![0u8; size as usize]);
        let ptr = buf.data_ptr();
        ring.allocated.insert(buf.key(), buf);
        Ok(ptr)
    }

    fn send_packet(&self, session: SessionHandle, packet: NonNull<u8>) {
        let mut state = lock(&self.state);
        let _ = self.enter(&mut state, Operation::SendPacket);
        let key = packet.as_ptr() as usize;
        let committed = state
            .sessions
            .get_mut(&session)
            .and_then(|ring| {
                let buf = ring.allocated.remove(&key)?;
                ring.sent.push_back(buf);
                Some(())
            })
            .is_some();
        if !committed {
            state
                .violations
                .push(format!("send of unallocated packet {key:#x}"));
        }
    }

    fn receive_packet(&self, session: SessionHandle) -> Result<(NonNull<u8>, u32), OsError> {
        let mut state = lock(&self.state);
        self.enter(&mut state, Operation::ReceivePacket)?;
        let ring = match state.sessions.get_mut(&session) {
            Some(ring) if !ring.ended => ring,
            Some(_) => return Err(OsError(ERROR_HANDLE_EOF)),
            None => return Err(OsError(ERROR_INVALID_HANDLE)),
        };
        let data = ring.inbound.pop_front().ok_or(OsError(ERROR_NO_MORE_ITEMS))?;
        let buf = RawBuf::new(data);
        let result = (buf.data_ptr(), buf.len() as u32);
        ring.outstanding.insert(buf.key(), buf);
        Ok(result)
    }

    fn release_receive_packet(&self, session: SessionHandle, packet: NonNull<u8>) {
        let mut state = lock(&self.state);
        let _ = self.enter(&mut state, Operation::ReleaseReceivePacket);
        let key = packet.as_ptr() as usize;
        let released = state
            .sessions
            .get_mut(&session)
            .and_then(|ring| ring.outstanding.remove(&key))
            .is_some();
        if !released {
            state
                .violations
                .push(format!("release of unknown packet {key:#x}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(stub: &StubDriver) -> SessionHandle {
        let adapter = stub.create_adapter("VPN0", "Tunnel", None).unwrap();
        stub.start_session(adapter, RING_CAPACITY_MIN).unwrap()
    }

    #[test]
    fn test_event_is_auto_reset() {
        let event = StubEvent::default();
        event.set().unwrap();
        assert!(event.wait(Some(Duration::from_millis(1))).unwrap());
        assert!(!event.wait(Some(Duration::from_millis(1))).unwrap());
        assert_eq!(event.wait_count(), 2);
    }

    #[test]
    fn test_registered_callback_consumes_signals() {
        let event = Arc::new(StubEvent::default());
        event.set().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let registration = event
            .clone()
            .register(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!event.is_signaled());

        event.set().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!event.is_signaled());

        drop(registration);
        assert_eq!(event.watcher_count(), 0);
        event.set().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(event.is_signaled());
    }

    #[test]
    fn test_double_release_is_a_violation() {
        let stub = StubDriver::new();
        let session = started(&stub);
        stub.inject(session, &[0x45, 0, 0, 20]);

        let (ptr, size) = stub.receive_packet(session).unwrap();
        assert_eq!(size, 4);
        stub.release_receive_packet(session, ptr);
        assert!(stub.violations().is_empty());

        stub.release_receive_packet(session, ptr);
        assert_eq!(stub.violations().len(), 1);
    }

    #[test]
    fn test_ring_accounting() {
        let stub = StubDriver::new();
        let session = started(&stub);

        let first = stub.allocate_send_packet(session, PACKET_SIZE_MAX).unwrap();
        assert_eq!(
            stub.allocate_send_packet(session, PACKET_SIZE_MAX),
            Err(OsError(ERROR_BUFFER_OVERFLOW))
        );
        stub.send_packet(session, first);
        assert_eq!(stub.take_sent(session).len(), 1);
        assert!(stub.allocate_send_packet(session, PACKET_SIZE_MAX).is_ok());
    }

    #[test]
    fn test_receive_after_end_reports_eof() {
        let stub = StubDriver::new();
        let session = started(&stub);
        stub.end_session(session).unwrap();
        assert_eq!(stub.receive_packet(session), Err(OsError(ERROR_HANDLE_EOF)));
        assert!(stub.event(session).unwrap().is_signaled());
    }

    #[test]
    fn test_footprint_alignment() {
        assert_eq!(ring_footprint(1), 8);
        assert_eq!(ring_footprint(4), 8);
        assert_eq!(ring_footprint(5), 12);
    }
}
