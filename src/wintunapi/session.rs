//! # Submodule: Session lifecycle
//!
//! A [`Session`] binds one ring of fixed capacity to an [`Adapter`] and moves through
//! `Unstarted → Active → Ended`. Everything that touches the driver session goes through a
//! gate. Short ring calls are counted and `end` waits for them. Outstanding packets and
//! blocked waiters hold a lease instead: `end` does not wait for leases, and the last lease to
//! be returned releases the ring.

use std::{
    fmt, mem,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, error, warn};

use super::{lock, Adapter};
use crate::driver::{
    DriverBinding, SessionHandle, WaitEvent, RING_CAPACITY_MAX, RING_CAPACITY_MIN,
};
use crate::{Error, Operation, Result};

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but not yet started.
    Unstarted,
    /// Started; ring calls are accepted.
    Active,
    /// Ended by [`Session::end`]. The ring is released once no packet is outstanding.
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unstarted,
    Active,
    /// `end` is waiting for ring calls to finish.
    Ending,
    /// Ended, with leases still out; the last one releases the ring.
    Draining,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Call,
    Lease,
}

struct GateInner {
    phase: Phase,
    handle: SessionHandle,
    event: Option<Arc<dyn WaitEvent>>,
    calls: usize,
    leases: usize,
}

/// Admission control for everything that touches the driver session.
pub(crate) struct Gate {
    inner: Mutex<GateInner>,
    calls_done: Condvar,
    driver: Arc<dyn DriverBinding>,
}

impl Gate {
    fn new(driver: Arc<dyn DriverBinding>) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                phase: Phase::Unstarted,
                handle: SessionHandle::NULL,
                event: None,
                calls: 0,
                leases: 0,
            }),
            calls_done: Condvar::new(),
            driver,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        lock(&self.inner)
    }

    fn admit(&self, op: Operation, hold: Hold) -> Result<SessionHandle> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Active => {
                match hold {
                    Hold::Call => inner.calls += 1,
                    Hold::Lease => inner.leases += 1,
                }
                Ok(inner.handle)
            }
            Phase::Unstarted => Err(Error::InvalidState {
                op,
                state: SessionState::Unstarted,
            }),
            Phase::Ending | Phase::Draining | Phase::Ended => Err(Error::SessionEnded),
        }
    }

    /// Admits a ring call. `end` waits for it to finish.
    pub(crate) fn enter(&self, op: Operation) -> Result<InFlight<'_>> {
        let handle = self.admit(op, Hold::Call)?;
        Ok(InFlight {
            gate: self,
            handle,
            hold: Hold::Call,
        })
    }

    /// Admits a long-lived user of the session that owns its share of the gate.
    pub(crate) fn lease(self: &Arc<Self>, op: Operation) -> Result<Lease> {
        self.admit(op, Hold::Lease)?;
        Ok(Lease { gate: self.clone() })
    }

    /// The read-wait event while the session is active.
    pub(crate) fn event(&self) -> Option<Arc<dyn WaitEvent>> {
        let inner = self.lock();
        match inner.phase {
            Phase::Active => inner.event.clone(),
            _ => None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock().phase == Phase::Active
    }

    fn call_to_lease(&self) {
        let mut inner = self.lock();
        inner.calls -= 1;
        inner.leases += 1;
        if inner.calls == 0 {
            self.calls_done.notify_all();
        }
    }

    fn leave(&self, hold: Hold) {
        let mut inner = self.lock();
        match hold {
            Hold::Call => {
                inner.calls -= 1;
                if inner.calls == 0 {
                    self.calls_done.notify_all();
                }
            }
            Hold::Lease => inner.leases -= 1,
        }
        if inner.phase == Phase::Draining && inner.calls == 0 && inner.leases == 0 {
            if let Err(err) = self.release(&mut inner) {
                error!(%err, "failed to end session after its last packet was returned");
            }
        }
    }

    /// Begins ending an active session. Returns the event to signal, or `None` if the session
    /// is not active.
    fn begin_end(&self) -> Option<Option<Arc<dyn WaitEvent>>> {
        let mut inner = self.lock();
        if inner.phase != Phase::Active {
            return None;
        }
        inner.phase = Phase::Ending;
        Some(inner.event.clone())
    }

    /// Waits for ring calls to drain, then releases the ring or hands that to the last lease.
    fn finish_end(&self) -> Result<()> {
        let mut inner = self
            .calls_done
            .wait_while(self.lock(), |inner| inner.calls > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.leases > 0 {
            inner.phase = Phase::Draining;
            debug!(
                session = inner.handle.0,
                leases = inner.leases,
                "session end deferred until outstanding packets are returned"
            );
            return Ok(());
        }
        self.release(&mut inner)
    }

    fn release(&self, inner: &mut GateInner) -> Result<()> {
        let handle = mem::take(&mut inner.handle);
        let result = self
            .driver
            .end_session(handle)
            .map_err(|os| Error::from_os(Operation::EndSession, os));
        inner.phase = Phase::Ended;
        inner.event = None;
        debug!(session = handle.0, ok = result.is_ok(), "session ended");
        result
    }
}

/// Keeps the driver session alive while a ring call or a ring buffer is outstanding.
pub(crate) struct InFlight<'g> {
    gate: &'g Gate,
    handle: SessionHandle,
    hold: Hold,
}

impl InFlight<'_> {
    pub(crate) fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Turns a finished ring call into a lease on the buffer it produced.
    pub(crate) fn retain(&mut self) {
        if self.hold == Hold::Call {
            self.gate.call_to_lease();
            self.hold = Hold::Lease;
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gate.leave(self.hold);
    }
}

/// A lease that owns its reference to the gate.
pub(crate) struct Lease {
    gate: Arc<Gate>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.gate.leave(Hold::Lease);
    }
}

/// A packet-exchange session on one adapter.
///
/// All ring operations take `&self`, so a session can be shared between a receiving thread
/// and any number of sending threads. [`Session::end`] may be called from any of them,
/// including from inside a [`Session::receive_loop`] handler. It wakes a receiver blocked on
/// the read-wait event and never waits for packets the caller still holds.
pub struct Session<'a> {
    adapter: &'a Adapter<'a>,
    ring_capacity: u32,
    gate: Arc<Gate>,
    rx: Mutex<()>,
}

impl<'a> Session<'a> {
    /// Creates an unstarted session for `adapter`. Nothing is validated or allocated until
    /// [`Session::start`].
    pub fn new(adapter: &'a Adapter<'a>, ring_capacity: u32) -> Self {
        Self {
            adapter,
            ring_capacity,
            gate: Arc::new(Gate::new(adapter.binding())),
            rx: Mutex::new(()),
        }
    }

    /// Starts the session. A session value can be started at most once.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if the ring capacity is outside
    /// [`RING_CAPACITY_MIN`]..=[`RING_CAPACITY_MAX`] (no driver call is made),
    /// `InvalidState` if the session was already started, `ResourceExhausted` or
    /// `InvalidParameter` if the driver refuses.
    pub fn start(&mut self) -> Result<()> {
        let op = Operation::StartSession;
        let state = self.state();
        if state != SessionState::Unstarted {
            return Err(Error::InvalidState { op, state });
        }
        if !(RING_CAPACITY_MIN..=RING_CAPACITY_MAX).contains(&self.ring_capacity) {
            return Err(Error::invalid(
                op,
                format!(
                    "ring capacity {:#x} outside {RING_CAPACITY_MIN:#x}..={RING_CAPACITY_MAX:#x}",
                    self.ring_capacity
                ),
            ));
        }
        if self.adapter.is_closed() {
            return Err(Error::invalid(op, "adapter is closed"));
        }

        let driver = self.driver();
        let handle = driver
            .start_session(self.adapter.handle(), self.ring_capacity)
            .map_err(|os| Error::from_os(op, os))?;
        let event = match driver.read_wait_event(handle) {
            Ok(event) => event,
            Err(os) => {
                if let Err(end_os) = driver.end_session(handle) {
                    warn!(session = handle.0, %end_os, "failed to end half-started session");
                }
                return Err(Error::from_os(Operation::GetReadWaitEvent, os));
            }
        };

        let mut inner = self.gate.lock();
        inner.phase = Phase::Active;
        inner.handle = handle;
        inner.event = Some(event);
        debug!(
            adapter = %self.adapter.name(),
            session = handle.0,
            capacity = self.ring_capacity,
            "session started"
        );
        Ok(())
    }

    /// Ends the session. Idempotent: does nothing on an unstarted or ended session.
    ///
    /// New ring calls fail with `SessionEnded` from here on. `end` wakes any receiver blocked on
    /// the read-wait event and waits for ring calls already in progress. The ring is released
    /// before returning unless packets are still outstanding; in that case the last packet to
    /// be sent, released or dropped releases it, and a driver error at that point is logged.
    ///
    /// # Errors
    ///
    /// The error reported by the driver when the ring is released here. The handle is
    /// invalidated either way.
    pub fn end(&self) -> Result<()> {
        let Some(event) = self.gate.begin_end() else {
            return Ok(());
        };
        if let Some(event) = event {
            if let Err(os) = event.set() {
                warn!(%os, "failed to signal read-wait event on session end");
            }
        }
        self.gate.finish_end()
    }

    /// Returns the session's state. An ended session reports [`SessionState::Ended`] even
    /// while outstanding packets keep its ring alive.
    pub fn state(&self) -> SessionState {
        match self.gate.lock().phase {
            Phase::Unstarted => SessionState::Unstarted,
            Phase::Active => SessionState::Active,
            Phase::Ending | Phase::Draining | Phase::Ended => SessionState::Ended,
        }
    }

    /// Returns the raw session handle; null before start and once the ring is released.
    pub fn handle(&self) -> SessionHandle {
        self.gate.lock().handle
    }

    /// Returns the ring capacity in bytes.
    pub fn ring_capacity(&self) -> u32 {
        self.ring_capacity
    }

    /// The adapter this session is bound to. Ending the session never closes it.
    pub fn adapter(&self) -> &'a Adapter<'a> {
        self.adapter
    }

    /// Returns the waitable object that signals packet arrival and session teardown.
    pub fn read_wait_event(&self) -> Result<ReadWaitEvent<'_>> {
        let op = Operation::GetReadWaitEvent;
        let guard = self.gate.enter(op)?;
        let event = self.gate.event();
        drop(guard);
        match event {
            Some(event) => Ok(ReadWaitEvent {
                session: self,
                event,
            }),
            None => Err(Error::SessionEnded),
        }
    }

    pub(crate) fn enter(&self, op: Operation) -> Result<InFlight<'_>> {
        self.gate.enter(op)
    }

    pub(crate) fn lease(&self, op: Operation) -> Result<Lease> {
        self.gate.lease(op)
    }

    /// Shared admission gate, for users that outlive a borrow of the session.
    pub(crate) fn gate(&self) -> Arc<Gate> {
        self.gate.clone()
    }

    /// Serializes receive calls: the driver's receive side is single-consumer.
    pub(crate) fn lock_rx(&self) -> MutexGuard<'_, ()> {
        lock(&self.rx)
    }

    pub(crate) fn driver(&self) -> &'a dyn DriverBinding {
        self.adapter.driver()
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("adapter", &self.adapter.name())
            .field("handle", &self.handle())
            .field("ring_capacity", &self.ring_capacity)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.state() != SessionState::Active {
            return;
        }
        warn!(adapter = %self.adapter.name(), "session dropped without being ended");
        if let Err(err) = self.end() {
            error!(%err, "failed to end abandoned session");
        }
    }
}

/// Result of waiting on a [`ReadWaitEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The ring may hold packets; drain it with `receive_packet` until `WouldBlock`.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// The session was ended while (or before) waiting.
    SessionEnded,
}

/// The session's read-wait event.
///
/// A wake-up means "the ring may hold packets", not "one packet arrived": the signal is not
/// raised again for packets that were already queued when the previous wait returned. After
/// every wake-up, call [`Session::receive_packet`] until it reports `WouldBlock` before
/// waiting again, or use [`Session::receive_loop`] which does exactly that.
pub struct ReadWaitEvent<'s> {
    session: &'s Session<'s>,
    event: Arc<dyn WaitEvent>,
}

impl ReadWaitEvent<'_> {
    /// Blocks until the event is signaled, the session ends, or `timeout` elapses
    /// (`None` waits forever).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitStatus> {
        let _lease = match self.session.lease(Operation::Wait) {
            Ok(lease) => lease,
            Err(Error::SessionEnded) => return Ok(WaitStatus::SessionEnded),
            Err(err) => return Err(err),
        };
        let signaled = self
            .event
            .wait(timeout)
            .map_err(|os| Error::from_os(Operation::Wait, os))?;
        if !self.session.gate.is_active() {
            // The wake-up from `end` is consumed by one waiter; pass it on to the next.
            if let Err(os) = self.event.set() {
                warn!(%os, "failed to pass on session end to other waiters");
            }
            return Ok(WaitStatus::SessionEnded);
        }
        Ok(if signaled {
            WaitStatus::Signaled
        } else {
            WaitStatus::TimedOut
        })
    }
}
