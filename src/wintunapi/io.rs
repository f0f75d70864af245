//! # Submodule: Packet ring I/O
//!
//! Send side: [`Session::allocate_send_packet`] carves a buffer out of the ring, the caller
//! fills it, and [`Session::send_packet`] hands it to the driver.
//!
//! Receive side: [`Session::receive_packet`] never blocks. It returns [`Error::WouldBlock`]
//! when the ring is empty, and the caller waits on the [`ReadWaitEvent`](super::ReadWaitEvent)
//! before polling again. Every received buffer goes back to the driver through
//! [`Session::release_receive_packet`].

use std::{
    fmt,
    ops::{ControlFlow, Deref, DerefMut},
    ptr::{self, NonNull},
    slice,
};

use tracing::{trace, warn};

use super::{InFlight, Session, WaitStatus};
use crate::driver::PACKET_SIZE_MAX;
use crate::{Error, Operation, Result};

/// A writable buffer allocated from the send ring. Consumed by [`SendPacket::send`].
///
/// A packet dropped without being sent is zeroed and committed, so it cannot stall the
/// packets allocated after it; the network stack discards an all-zero layer-3 packet.
/// Sending stays possible after [`Session::end`] until the ring is released, which happens
/// only once every outstanding packet is gone.
pub struct SendPacket<'s> {
    session: &'s Session<'s>,
    guard: InFlight<'s>,
    ptr: NonNull<u8>,
    len: usize,
    sent: bool,
}

impl<'s> SendPacket<'s> {
    /// Commits the packet to the ring. Ownership of the buffer passes to the driver.
    pub fn send(self) -> Result<()> {
        let session = self.session;
        session.send_packet(self)
    }

    fn commit(&mut self) {
        self.session.driver().send_packet(self.guard.handle(), self.ptr);
        self.sent = true;
        trace!(session = self.guard.handle().0, len = self.len, "packet sent");
    }
}

impl Deref for SendPacket<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the driver keeps the buffer valid for `len` bytes until it is sent, and the
        // in-flight guard keeps the session from ending before then.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for SendPacket<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`; the buffer is exclusively ours until sent.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for SendPacket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendPacket").field("len", &self.len).finish()
    }
}

impl Drop for SendPacket<'_> {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        warn!(len = self.len, "send packet dropped unsent, committing it zeroed");
        self.fill(0);
        self.commit();
    }
}

/// A packet read from the receive ring. The buffer belongs to the driver until
/// [`ReceivedPacket::release`]; dropping the packet releases it as well.
pub struct ReceivedPacket<'s> {
    session: &'s Session<'s>,
    guard: InFlight<'s>,
    ptr: NonNull<u8>,
    len: usize,
    released: bool,
}

impl<'s> ReceivedPacket<'s> {
    /// Returns the buffer to the driver.
    pub fn release(self) {
        let session = self.session;
        session.release_receive_packet(self)
    }

    fn hand_back(&mut self) {
        if self.released {
            return;
        }
        self.session
            .driver()
            .release_receive_packet(self.guard.handle(), self.ptr);
        self.released = true;
    }
}

impl Deref for ReceivedPacket<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the driver keeps the buffer valid for `len` bytes until it is released, and
        // the in-flight guard keeps the session from ending before then.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for ReceivedPacket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for ReceivedPacket<'_> {
    fn drop(&mut self) {
        self.hand_back();
    }
}

/// Why [`Session::receive_loop`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The handler asked to stop.
    Stopped,
    /// The session was ended.
    SessionEnded,
}

impl<'a> Session<'a> {
    /// Allocates a `size`-byte buffer from the send ring.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` unless `0 < size <= PACKET_SIZE_MAX` (no driver call is made),
    /// `RingFull` when the ring has no room (retry after the driver drains it),
    /// `SessionEnded` once the session is ended.
    pub fn allocate_send_packet(&self, size: usize) -> Result<SendPacket<'_>> {
        let op = Operation::AllocateSendPacket;
        if size == 0 || size > PACKET_SIZE_MAX as usize {
            return Err(Error::invalid(
                op,
                format!("packet size {size} outside 1..={PACKET_SIZE_MAX}"),
            ));
        }
        let mut guard = self.enter(op)?;
        let ptr = self
            .driver()
            .allocate_send_packet(guard.handle(), size as u32)
            .map_err(|os| Error::from_os(op, os))?;
        guard.retain();
        Ok(SendPacket {
            session: self,
            guard,
            ptr,
            len: size,
            sent: false,
        })
    }

    /// Commits a packet allocated from this session's ring.
    pub fn send_packet(&self, mut packet: SendPacket<'_>) -> Result<()> {
        if !ptr::addr_eq(packet.session, self) {
            return Err(Error::invalid(
                Operation::SendPacket,
                "packet was allocated by another session",
            ));
        }
        packet.commit();
        Ok(())
    }

    /// Allocates a packet of `payload.len()` bytes, copies `payload` into it and sends it.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut packet = self.allocate_send_packet(payload.len())?;
        packet.copy_from_slice(payload);
        packet.send()
    }

    /// Takes the next packet from the receive ring without blocking.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the ring is empty, `SessionEnded` once the session is ended.
    pub fn receive_packet(&self) -> Result<ReceivedPacket<'_>> {
        let op = Operation::ReceivePacket;
        let mut guard = self.enter(op)?;
        let (ptr, size) = {
            let _rx = self.lock_rx();
            self.driver()
                .receive_packet(guard.handle())
                .map_err(|os| Error::from_os(op, os))?
        };
        guard.retain();
        trace!(session = guard.handle().0, len = size, "packet received");
        Ok(ReceivedPacket {
            session: self,
            guard,
            ptr,
            len: size as usize,
            released: false,
        })
    }

    /// Hands a received packet back to the driver. The packet is consumed, so it cannot be
    /// read or released again.
    pub fn release_receive_packet(&self, mut packet: ReceivedPacket<'_>) {
        packet.hand_back();
    }

    /// Runs the receive loop on the calling thread until `handler` breaks or the session ends.
    ///
    /// Each wake-up of the read-wait event drains the ring completely, releasing every packet
    /// after `handler` has seen it, before waiting again. The handler may call
    /// [`Session::end`]; the loop then returns [`LoopExit::SessionEnded`] once the current
    /// packet is released.
    pub fn receive_loop<F>(&self, mut handler: F) -> Result<LoopExit>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let event = match self.read_wait_event() {
            Ok(event) => event,
            Err(Error::SessionEnded) => return Ok(LoopExit::SessionEnded),
            Err(err) => return Err(err),
        };
        loop {
            loop {
                match self.receive_packet() {
                    Ok(packet) => {
                        let flow = handler(&packet[..]);
                        packet.release();
                        if flow.is_break() {
                            return Ok(LoopExit::Stopped);
                        }
                    }
                    Err(Error::WouldBlock) => break,
                    Err(Error::SessionEnded) => return Ok(LoopExit::SessionEnded),
                    Err(err) => return Err(err),
                }
            }
            if event.wait(None)? == WaitStatus::SessionEnded {
                return Ok(LoopExit::SessionEnded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::{StubDriver, RING_CAPACITY_MIN};
    use crate::{SessionState, Wintun};

    fn setup() -> (Arc<StubDriver>, Wintun) {
        let stub = Arc::new(StubDriver::new());
        let wintun = Wintun::with_binding(stub.clone());
        (stub, wintun)
    }

    #[test]
    fn test_allocate_size_bounds() {
        let (stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(0x400000).unwrap();
        for size in [0, PACKET_SIZE_MAX as usize + 1] {
            assert!(matches!(
                session.allocate_send_packet(size).unwrap_err(),
                Error::InvalidParameter { os: None, .. }
            ));
        }
        assert_eq!(stub.calls(Operation::AllocateSendPacket), 0);
        session.send(&[0x45; PACKET_SIZE_MAX as usize]).unwrap();
        session.end().unwrap();
    }

    #[test]
    fn test_send_round_trip() {
        let (stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(0x400000).unwrap();

        let payload: Vec<u8> = (0..60u8).collect();
        let mut packet = session.allocate_send_packet(payload.len()).unwrap();
        packet.copy_from_slice(&payload);
        packet.send().unwrap();

        assert_eq!(stub.take_sent(session.handle()), vec![payload]);
        assert!(stub.take_sent(session.handle()).is_empty());
        session.end().unwrap();
    }

    #[test]
    fn test_ring_full_is_transient() {
        let (stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(RING_CAPACITY_MIN).unwrap();

        let mut held = Vec::new();
        let err = loop {
            match session.allocate_send_packet(1500) {
                Ok(packet) => held.push(packet),
                Err(err) => break err,
            }
        };
        assert_eq!(err, Error::RingFull);
        assert!(err.is_transient());

        let count = held.len();
        for packet in held {
            packet.send().unwrap();
        }
        assert_eq!(stub.take_sent(session.handle()).len(), count);
        session.send(&[0x60; 1500]).unwrap();
        session.end().unwrap();
    }

    #[test]
    fn test_dropped_send_packet_is_committed_zeroed() {
        let (stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(0x400000).unwrap();
        {
            let mut packet = session.allocate_send_packet(4).unwrap();
            packet.copy_from_slice(&[1, 2, 3, 4]);
        }
        assert_eq!(stub.take_sent(session.handle()), vec![vec![0u8; 4]]);
        session.end().unwrap();
    }

    #[test]
    fn test_receive_and_release() {
        let (stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(0x400000).unwrap();

        assert_eq!(session.receive_packet().unwrap_err(), Error::WouldBlock);
        stub.inject(session.handle(), &[0x45, 0x00, 0x00, 0x1c]);
        let packet = session.receive_packet().unwrap();
        assert_eq!(&packet[..], &[0x45, 0x00, 0x00, 0x1c]);
        assert_eq!(stub.outstanding_receives(session.handle()), 1);
        session.release_receive_packet(packet);
        assert_eq!(stub.outstanding_receives(session.handle()), 0);

        stub.inject(session.handle(), &[0x60]);
        drop(session.receive_packet().unwrap());
        assert_eq!(stub.outstanding_receives(session.handle()), 0);
        assert!(stub.violations().is_empty());
        session.end().unwrap();
    }

    #[test]
    fn test_receive_after_end() {
        let (_stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(0x400000).unwrap();
        session.end().unwrap();
        assert_eq!(session.receive_packet().unwrap_err(), Error::SessionEnded);
        assert_eq!(
            session.allocate_send_packet(20).unwrap_err(),
            Error::SessionEnded
        );
    }

    #[test]
    fn test_end_from_handler_returns() {
        let (stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(0x400000).unwrap();
        let handle = session.handle();
        stub.inject_batch(handle, [&[0x45u8][..], &[0x45u8, 1][..]]);

        let mut seen = 0;
        let exit = session
            .receive_loop(|_| {
                seen += 1;
                session.end().unwrap();
                // The packet being handled keeps the ring alive.
                assert_eq!(stub.active_sessions(), 1);
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(exit, LoopExit::SessionEnded);
        assert_eq!(seen, 1);
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(stub.active_sessions(), 0);
        assert_eq!(stub.calls(Operation::EndSession), 1);
        assert!(stub.violations().is_empty());
    }

    #[test]
    fn test_end_while_holding_packets() {
        let (stub, wintun) = setup();
        let adapter = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let session = adapter.start_session(0x400000).unwrap();
        stub.inject(session.handle(), &[0x60, 0, 0, 0]);

        let received = session.receive_packet().unwrap();
        let mut outgoing = session.allocate_send_packet(4).unwrap();
        session.end().unwrap();
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(session.receive_packet().unwrap_err(), Error::SessionEnded);
        assert_eq!(stub.active_sessions(), 1);

        assert_eq!(&received[..], &[0x60, 0, 0, 0]);
        received.release();
        assert_eq!(stub.active_sessions(), 1);
        outgoing.copy_from_slice(&[0x45, 0, 0, 4]);
        outgoing.send().unwrap();

        assert_eq!(stub.active_sessions(), 0);
        assert!(session.handle().is_null());
        session.end().unwrap();
        assert_eq!(stub.calls(Operation::EndSession), 1);
        assert!(stub.violations().is_empty());
    }

    #[test]
    fn test_send_packet_from_other_session_is_rejected() {
        let (stub, wintun) = setup();
        let first = wintun.create_adapter("VPN0", "Tunnel", None).unwrap();
        let second = wintun.create_adapter("VPN1", "Tunnel", None).unwrap();
        let a = first.start_session(0x400000).unwrap();
        let b = second.start_session(0x400000).unwrap();

        let packet = a.allocate_send_packet(8).unwrap();
        assert!(matches!(
            b.send_packet(packet).unwrap_err(),
            Error::InvalidParameter { .. }
        ));
        // The rejected packet was dropped and committed to its own ring.
        assert_eq!(stub.take_sent(a.handle()).len(), 1);
        assert!(stub.take_sent(b.handle()).is_empty());
    }
}
