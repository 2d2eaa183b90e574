//! In-flight request tracking for the command client.
//!
//! The table is mutated only by the client's own event loop, so the
//! pending-request lifecycle is an auditable data structure with an
//! insert-on-send / remove-on-settle discipline and no locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::client::CallError;
use crate::protocol::RequestId;

/// A request that was sent but has not yet received its terminal message.
pub struct PendingRequest {
    command: String,
    created_at: Instant,
    reply: oneshot::Sender<Result<Value, CallError>>,
    sink: Option<mpsc::UnboundedSender<String>>,
}

impl PendingRequest {
    pub fn new(
        command: impl Into<String>,
        reply: oneshot::Sender<Result<Value, CallError>>,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        Self {
            command: command.into(),
            created_at: Instant::now(),
            reply,
            sink,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Correlation map keyed by request id.
#[derive(Default)]
pub struct CorrelationTable {
    pending: HashMap<RequestId, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request after its `ExecuteCommand` was written.
    pub fn insert(&mut self, id: RequestId, request: PendingRequest) {
        debug_assert!(
            !self.pending.contains_key(&id),
            "request id reused: {}",
            id
        );
        self.pending.insert(id, request);
    }

    /// Remove a request without resolving it (timeout abandonment).
    pub fn remove(&mut self, id: &RequestId) -> Option<PendingRequest> {
        self.pending.remove(id)
    }

    /// Route an output chunk to the request's streaming sink.
    ///
    /// Returns `false` when the id is unknown — stale output for a timed-out
    /// request is simply dropped.
    pub fn forward_output(&self, id: &RequestId, chunk: String) -> bool {
        match self.pending.get(id) {
            Some(request) => {
                if let Some(sink) = &request.sink {
                    // A dropped caller-side receiver is not an error.
                    let _ = sink.send(chunk);
                }
                true
            }
            None => false,
        }
    }

    /// Resolve a request with its terminal outcome and remove it.
    ///
    /// At most one terminal message is ever acted upon: once settled (or
    /// abandoned), later terminals find the id absent and return `false`.
    pub fn settle(&mut self, id: &RequestId, outcome: Result<Value, CallError>) -> bool {
        match self.pending.remove(id) {
            Some(request) => {
                // The caller may have given up; a dropped receiver is fine.
                let _ = request.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Reject every pending request; used when the channel dies.
    pub fn fail_all(&mut self, make_error: impl Fn() -> CallError) {
        for (id, request) in self.pending.drain() {
            tracing::debug!(
                request_id = %id,
                command = request.command,
                "Failing pending request"
            );
            let _ = request.reply.send(Err(make_error()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
