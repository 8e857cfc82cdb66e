//! Outstanding request bookkeeping.

use crate::{ClientError, Reply};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use voicelink_core::{now_millis, RequestId};

pub(crate) type Outcome = Result<Reply, ClientError>;

struct PendingRequest {
    created: Instant,
    slot: oneshot::Sender<Outcome>,
}

/// Handed to the caller that registered a request.
pub(crate) struct Ticket {
    pub id: RequestId,
    /// `None` when the timeout reaches past what the clock can represent.
    pub deadline: Option<Instant>,
    pub slot: oneshot::Receiver<Outcome>,
}

/// Maps request ids to the callers waiting on them.
///
/// Resolving removes the entry, so each request resolves at most once no
/// matter how many answers, timeouts or cancellations race for it.
#[derive(Default)]
pub(crate) struct RequestTracker {
    issued: u64,
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestTracker {
    pub fn register(&mut self, timeout: Duration) -> Ticket {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        let created = Instant::now();
        self.pending.insert(id.clone(), PendingRequest { created, slot: tx });
        Ticket {
            id,
            deadline: created.checked_add(timeout),
            slot: rx,
        }
    }

    /// Deliver an outcome. Returns false if the id is not outstanding.
    pub fn resolve(&mut self, id: &RequestId, outcome: Outcome) -> bool {
        let Some(pending) = self.pending.remove(id) else {
            return false;
        };
        tracing::debug!(
            request_id = %id,
            elapsed_ms = pending.created.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "request resolved"
        );
        // The caller may have given up already.
        let _ = pending.slot.send(outcome);
        true
    }

    /// Drop a request without resolving it (its caller stopped waiting).
    pub fn forget(&mut self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Resolve every outstanding request with `error`.
    pub fn fail_all(&mut self, error: ClientError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.slot.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Outstanding ids, oldest first.
    pub fn ids(&self) -> Vec<RequestId> {
        let mut pending: Vec<_> = self.pending.iter().collect();
        pending.sort_by_key(|(_, p)| p.created);
        pending.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn next_id(&mut self) -> RequestId {
        loop {
            self.issued += 1;
            let id = RequestId::Text(format!("req_{}_{}", self.issued, now_millis()));
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}
