use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AskError {
    #[error("session closed before an answer arrived")]
    SessionClosed,
    #[error("no answer within {0:?}")]
    TimedOut(Duration),
    #[error("unknown ask id '{0}'")]
    UnknownId(String),
    #[error("ask id '{0}' is already being awaited")]
    AlreadyAwaited(String),
}

#[derive(Default)]
struct PendingState {
    answer: Option<String>,
    closed: bool,
}

/// One outstanding ask. The answer slot is written at most once.
struct PendingRequest {
    state: Mutex<PendingState>,
    ready: Condvar,
    awaited: Mutex<bool>,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            ready: Condvar::new(),
            awaited: Mutex::new(false),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Arc<PendingRequest>>,
    closed: bool,
}

/// Maps ask ids to blocked executions waiting for the client's answer.
///
/// `register`, `resolve` and `close` hold the table lock only long enough to touch the map.
/// `await_answer` waits on the entry's own condvar, so a blocked asker never holds the lock
/// that `resolve` needs.
pub struct CorrelationTable {
    table: Mutex<Table>,
    timeout: Option<Duration>,
}

impl CorrelationTable {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a pending request under a fresh random id.
    pub fn register(&self) -> Result<String, AskError> {
        let mut table = self.lock();
        if table.closed {
            return Err(AskError::SessionClosed);
        }
        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !table.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        table
            .entries
            .insert(id.clone(), Arc::new(PendingRequest::new()));
        tracing::debug!(id = %id, "registered ask");
        Ok(id)
    }

    /// Block the calling thread until `id` is resolved, then remove and return its answer.
    pub fn await_answer(&self, id: &str) -> Result<String, AskError> {
        let pending = {
            let table = self.lock();
            table
                .entries
                .get(id)
                .cloned()
                .ok_or_else(|| AskError::UnknownId(id.to_string()))?
        };

        {
            let mut awaited = pending.awaited.lock().unwrap_or_else(|e| e.into_inner());
            if *awaited {
                return Err(AskError::AlreadyAwaited(id.to_string()));
            }
            *awaited = true;
        }

        let outcome = self.wait_for(&pending);
        self.lock().entries.remove(id);
        outcome
    }

    fn wait_for(&self, pending: &PendingRequest) -> Result<String, AskError> {
        let deadline = self.timeout.map(|t| (t, Instant::now() + t));
        let mut state = pending.lock_state();
        loop {
            if let Some(answer) = state.answer.take() {
                return Ok(answer);
            }
            if state.closed {
                return Err(AskError::SessionClosed);
            }
            state = match deadline {
                None => pending
                    .ready
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some((limit, at)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(AskError::TimedOut(limit));
                    }
                    pending
                        .ready
                        .wait_timeout(state, at - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Deliver an answer. Unknown ids and repeated deliveries are dropped.
    /// Returns whether this call stored the answer.
    pub fn resolve(&self, id: &str, answer: String) -> bool {
        let table = self.lock();
        let Some(pending) = table.entries.get(id) else {
            tracing::debug!(id = %id, "dropping answer for unknown ask");
            return false;
        };
        let mut state = pending.lock_state();
        if state.answer.is_some() || state.closed {
            tracing::debug!(id = %id, "dropping duplicate answer");
            return false;
        }
        state.answer = Some(answer);
        pending.ready.notify_all();
        tracing::debug!(id = %id, "resolved ask");
        true
    }

    /// Wake every waiter with `SessionClosed` and refuse new registrations.
    pub fn close(&self) {
        let mut table = self.lock();
        table.closed = true;
        for pending in table.entries.values() {
            let mut state = pending.lock_state();
            if state.answer.is_none() {
                state.closed = true;
            }
            pending.ready.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(None)
    }
}
