//! # Submodule: EventStream
//!
//! `EventStream` turns a session's read-wait event into a `futures::Stream`. It registers a
//! callback on the event (a thread-pool wait for the Windows binding); each time the event
//! fires, the callback raises a `ready` flag and wakes the task registered in an
//! `AtomicWaker`.
//!
//! The stream holds a lease on the session for as long as the callback is registered, so the
//! driver never closes the event under it. Ending the session fires the event one last time;
//! the stream then unregisters, returns its lease and terminates.

use futures::{stream::FusedStream, task::AtomicWaker, Stream};
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tracing::{trace, warn};

use crate::driver::{Registration, WaitEvent};
use crate::wintunapi::{Gate, Lease};
use crate::{Error, Operation, Result};

/// State shared between the stream and the event callback.
#[derive(Default)]
struct Shared {
    waker: AtomicWaker,
    ready: AtomicBool,
}

impl Shared {
    fn notify(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.waker.wake();
    }
}

/// Keeps the callback registered. `EventStream::close` unregisters it before returning the
/// lease.
struct Watch {
    registration: Registration,
    event: Arc<dyn WaitEvent>,
    lease: Lease,
}

/// A stream that yields once per wake-up of a session's read-wait event and ends when the
/// session ends.
pub struct EventStream {
    shared: Arc<Shared>,
    gate: Arc<Gate>,
    watch: Option<Watch>,
}

impl EventStream {
    /// Starts watching the read-wait event guarded by `gate`.
    ///
    /// # Errors
    ///
    /// `InvalidState` for an unstarted session, `SessionEnded` for an ended one, or the
    /// error reported when registering the callback.
    pub(crate) fn new(gate: Arc<Gate>) -> Result<Self> {
        let op = Operation::GetReadWaitEvent;
        let lease = gate.lease(op)?;
        let event = gate.event().ok_or(Error::SessionEnded)?;
        let shared = Arc::new(Shared::default());
        let registration = {
            let shared = shared.clone();
            event
                .clone()
                .register(Box::new(move || {
                    trace!("read-wait event signaled");
                    shared.notify();
                }))
                .map_err(|os| Error::from_os(Operation::Wait, os))?
        };
        Ok(Self {
            shared,
            gate,
            watch: Some(Watch {
                registration,
                event,
                lease,
            }),
        })
    }

    fn close(&mut self) {
        let Some(Watch {
            registration,
            event,
            lease,
        }) = self.watch.take()
        else {
            return;
        };
        drop(registration);
        if !self.gate.is_active() {
            // The callback consumed the wake-up from `end`; pass it on to blocking waiters.
            if let Err(os) = event.set() {
                warn!(%os, "failed to pass on session end to other waiters");
            }
        }
        drop(lease);
    }
}

impl Stream for EventStream {
    type Item = Result<()>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = Pin::into_inner(self);
        if this.watch.is_none() {
            return Poll::Ready(None);
        }

        // Register first so a wake-up between the checks below is not lost.
        this.shared.waker.register(cx.waker());

        let ready = this.shared.ready.swap(false, Ordering::SeqCst);
        if !this.gate.is_active() {
            this.close();
            return Poll::Ready(None);
        }
        if ready {
            Poll::Ready(Some(Ok(())))
        } else {
            Poll::Pending
        }
    }
}

impl FusedStream for EventStream {
    fn is_terminated(&self) -> bool {
        self.watch.is_none()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}
