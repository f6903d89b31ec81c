//! Generic pending-request bookkeeping shared by every request/response
//! correlation point in this crate: a server [`crate::session::Session`], a
//! client [`crate::client::connection::ClientConnection`], and a stream's
//! [`crate::control::ScriptStreamControl`] JSON-RPC channel.
//!
//! All three follow the same shape: assign a rolling id, stash a completion
//! handler behind a deadline timer, and resolve it exactly once — by a
//! matching response, by timeout, or by abandonment (connection/session
//! shutdown). Invariant 4 (§8) is enforced here once instead of
//! three times.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::SnapError;
use crate::protocol_constants::{MAX_REQUEST_ID, NO_REQUEST_ID};

/// Outcome delivered to a caller awaiting a pending request.
#[derive(Debug)]
pub enum PendingOutcome<T> {
    /// A matching response arrived.
    Resolved(T),
    /// The deadline elapsed before a response arrived.
    TimedOut,
    /// The owning connection/session/control channel shut down first.
    Aborted,
}

impl<T> PendingOutcome<T> {
    pub fn into_result(self) -> Result<T, SnapError> {
        match self {
            PendingOutcome::Resolved(v) => Ok(v),
            PendingOutcome::TimedOut => Err(SnapError::TimedOut),
            PendingOutcome::Aborted => Err(SnapError::OperationAborted),
        }
    }
}

/// Rolling 1..MAX_REQUEST_ID id allocator, skipping `NO_REQUEST_ID` (0).
#[derive(Debug)]
pub struct IdAllocator {
    next: u16,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = if self.next + 1 >= MAX_REQUEST_ID { 1 } else { self.next + 1 };
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A map of in-flight requests awaiting a `refers_to`-matching response,
/// keyed by the id the caller was assigned.
///
/// Each entry holds the sending half of a oneshot channel; `complete()`
/// resolves it, `sweep_expired()` (called opportunistically on every insert,
/// per §4.F) abandons anything whose caller already gave up.
pub struct PendingRequests<T> {
    ids: IdAllocator,
    entries: HashMap<u16, oneshot::Sender<T>>,
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self { ids: IdAllocator::new(), entries: HashMap::new() }
    }

    /// Registers a new pending request, returning its id and a future that
    /// resolves to [`PendingOutcome`] once the request completes, times out,
    /// or the map is dropped/aborted wholesale.
    pub fn register(&mut self, deadline: Duration) -> (u16, impl std::future::Future<Output = PendingOutcome<T>>) {
        self.sweep_expired();
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        let fut = async move {
            match timeout(deadline, rx).await {
                Ok(Ok(value)) => PendingOutcome::Resolved(value),
                Ok(Err(_)) => PendingOutcome::Aborted,
                Err(_) => PendingOutcome::TimedOut,
            }
        };
        (id, fut)
    }

    /// Resolves the pending request `refers_to`, if still outstanding.
    /// Returns `true` if a waiter received it.
    pub fn complete(&mut self, refers_to: u16, value: T) -> bool {
        if refers_to == NO_REQUEST_ID {
            return false;
        }
        match self.entries.remove(&refers_to) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drops any already-cancelled receivers. Dropping a oneshot `Receiver`
    /// is how a caller "gives up" without an explicit cancel API; a closed
    /// sender is the signal we prune on.
    fn sweep_expired(&mut self) {
        self.entries.retain(|_, tx| !tx.is_closed());
    }

    /// Aborts every outstanding request (session/connection shutdown).
    /// Dropping each sender resolves the corresponding future to `Aborted`.
    pub fn abort_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_on_matching_complete() {
        let mut pending: PendingRequests<u32> = PendingRequests::new();
        let (id, fut) = pending.register(Duration::from_secs(5));
        assert!(pending.complete(id, 42));
        let outcome = fut.await;
        assert!(matches!(outcome, PendingOutcome::Resolved(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_nothing_completes_it() {
        let mut pending: PendingRequests<u32> = PendingRequests::new();
        let (_, fut) = pending.register(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;
        let outcome = fut.await;
        assert!(matches!(outcome, PendingOutcome::TimedOut));
    }

    #[tokio::test]
    async fn abort_all_resolves_every_waiter_as_aborted() {
        let mut pending: PendingRequests<u32> = PendingRequests::new();
        let (_, fut1) = pending.register(Duration::from_secs(5));
        let (_, fut2) = pending.register(Duration::from_secs(5));
        pending.abort_all();
        assert!(matches!(fut1.await, PendingOutcome::Aborted));
        assert!(matches!(fut2.await, PendingOutcome::Aborted));
    }

    #[test]
    fn id_allocator_skips_zero_and_wraps() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.next_id(), 1);
        ids.next = MAX_REQUEST_ID - 1;
        assert_eq!(ids.next_id(), MAX_REQUEST_ID - 1);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn complete_on_unknown_id_is_a_noop() {
        let mut pending: PendingRequests<u32> = PendingRequests::new();
        assert!(!pending.complete(999, 1));
    }

    #[test]
    fn complete_with_no_request_id_is_rejected() {
        let mut pending: PendingRequests<u32> = PendingRequests::new();
        assert!(!pending.complete(NO_REQUEST_ID, 1));
    }
}
