//! # Module: ASYNC API
//!
//! `AsyncReceiver` lets an async task await packets from a [`Session`] instead of blocking a
//! thread on the read-wait event. It follows the same drain-to-empty discipline as
//! [`Session::receive_loop`]: a receive first polls the ring and only awaits the event when
//! the ring is empty, so packets left over from an earlier wake-up are never stranded.
//!
//! The receiver is executor-agnostic. Wake-ups come from a callback registered on the event
//! (see [`EventStream`]), so it works under `tokio`, `futures::executor` or any other runtime.
//!
//! Use either the async receiver or the blocking receive loop on a session, not both: they
//! would compete for the same auto-reset event.
//!
//! A live receiver keeps an ended session's ring alive until it observes the end or is
//! dropped.

use futures::StreamExt;

use crate::wintunapi::{ReceivedPacket, Session};
use crate::{Error, Result};

pub use self::event_stream::EventStream;

// Submodules
mod event_stream;

/// Awaitable receive side of a session.
pub struct AsyncReceiver<'s> {
    session: &'s Session<'s>,
    notif: EventStream,
}

impl<'s> AsyncReceiver<'s> {
    /// Constructs a receiver for an active session.
    ///
    /// # Errors
    ///
    /// `InvalidState` for an unstarted session, `SessionEnded` for an ended one, or the
    /// driver error reported when registering for the read-wait event.
    pub fn new(session: &'s Session<'s>) -> Result<Self> {
        Ok(Self {
            session,
            notif: EventStream::new(session.gate())?,
        })
    }

    /// The session packets are received from.
    pub fn session(&self) -> &'s Session<'s> {
        self.session
    }

    /// Asynchronously receives the next packet.
    ///
    /// Returns immediately when the ring already holds a packet; otherwise waits for the
    /// read-wait event and polls again.
    ///
    /// # Errors
    ///
    /// `SessionEnded` once the session is ended, or the error reported by the driver.
    pub async fn receive(&mut self) -> Result<ReceivedPacket<'s>> {
        loop {
            match self.session.receive_packet() {
                Ok(packet) => return Ok(packet),
                Err(Error::WouldBlock) => {}
                Err(err) => return Err(err),
            }

            match self.notif.next().await {
                Some(Ok(())) => continue,
                Some(Err(err)) => return Err(err),
                // The stream terminates once the session ends.
                None => return Err(Error::SessionEnded),
            }
        }
    }
}

impl<'a> Session<'a> {
    /// Creates an [`AsyncReceiver`] for this session.
    pub fn async_receiver(&self) -> Result<AsyncReceiver<'_>> {
        AsyncReceiver::new(self)
    }
}
