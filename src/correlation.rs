// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Correlation Tracking
//!
//! Matches asynchronous rpc responses to the calls waiting for them. Each call
//! registers a one-shot response slot under its correlation id; the reply
//! consumer resolves the slot, and anything it can't match is dropped.

use crate::{envelope::MessageMetadata, serializer::Message};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Slot key used when correlation checking is disabled.
const UNCORRELATED: &str = "";

/// A decoded rpc response together with its delivery metadata.
pub type Reply = (Message, MessageMetadata);

struct PendingCall {
    started_at: Instant,
    deadline: Option<Instant>,
    slot: oneshot::Sender<Reply>,
}

/// Pending calls keyed by correlation id.
///
/// With checking disabled every call shares one slot and any response fills
/// it, so callers must serialize their calls.
pub struct CorrelationTracker {
    checked: bool,
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl CorrelationTracker {
    pub fn new(checked: bool) -> Self {
        CorrelationTracker {
            checked,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }

    /// Generates a fresh correlation id, or `None` when checking is disabled.
    pub fn next_id(&self) -> Option<String> {
        self.checked.then(|| Uuid::new_v4().to_string())
    }

    /// Arms a response slot for `id`, replacing any stale slot under the same key.
    pub fn register(&self, id: Option<&str>, timeout: Duration) -> oneshot::Receiver<Reply> {
        let (slot, receiver) = oneshot::channel();
        let started_at = Instant::now();
        let call = PendingCall {
            started_at,
            deadline: started_at.checked_add(timeout),
            slot,
        };
        self.lock().insert(self.key(id).to_owned(), call);
        receiver
    }

    /// Hands `reply` to the call waiting on `id`.
    ///
    /// Returns false when no call matches, in which case the reply is dropped.
    pub fn resolve(&self, id: Option<&str>, reply: Reply) -> bool {
        if self.checked && id.is_none() {
            debug!("discarding response without correlation id");
            return false;
        }

        let Some(call) = self.lock().remove(self.key(id)) else {
            debug!(
                correlation_id = id.unwrap_or_default(),
                "discarding response without a pending call"
            );
            return false;
        };

        if call.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            debug!(
                elapsed_ms = call.started_at.elapsed().as_millis() as u64,
                "response arrived after the call deadline"
            );
        }
        call.slot.send(reply).is_ok()
    }

    /// Drops the slot of a call that gave up waiting.
    pub fn forget(&self, id: Option<&str>) {
        self.lock().remove(self.key(id));
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn key<'a>(&self, id: Option<&'a str>) -> &'a str {
        if self.checked {
            id.unwrap_or(UNCORRELATED)
        } else {
            UNCORRELATED
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
