//! Correlates inbound frames with the callers waiting for them.
//!
//! One receive loop feeds [`ResponseRouter::deliver`]; any number of callers
//! register a pending id and await the returned receiver. All state sits
//! behind one mutex that is never held across an `.await`.
//!
//! Every registration resolves exactly once: with its response, with the
//! error passed to [`ResponseRouter::fail_all`], or with
//! [`Error::Cancelled`] from [`ResponseRouter::reset`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use wisprclaw_core::Frame;

use crate::Error;

/// Final outcome of a request.
pub type Reply = Result<Value, Error>;

/// Outcome of waiting for `connect.challenge`: the nonce, if it carried one.
pub type Challenge = Result<Option<String>, Error>;

enum ChallengeSlot {
    Empty,
    Buffered(Option<String>),
    Awaited(oneshot::Sender<Challenge>),
}

struct RouterState {
    pending: HashMap<String, oneshot::Sender<Reply>>,
    challenge: ChallengeSlot,
    /// Set once the connection is gone; late registrations fail with it.
    closed: Option<Error>,
}

/// Pending-request table plus the challenge slot for one connection.
pub struct ResponseRouter {
    state: Mutex<RouterState>,
}

impl Default for ResponseRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                pending: HashMap::new(),
                challenge: ChallengeSlot::Empty,
                closed: None,
            }),
        }
    }

    // A panic while holding the lock cannot leave the table half-updated:
    // every critical section is a single map or slot operation.
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register interest in the response to `id`.
    ///
    /// If the connection already failed, the receiver resolves immediately
    /// with that failure. Registering an id twice fails the older waiter.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(err) = &state.closed {
            let _ = tx.send(Err(err.clone()));
            return rx;
        }
        if let Some(previous) = state.pending.insert(id.to_string(), tx) {
            tracing::warn!(id, "Duplicate pending request id");
            let _ = previous.send(Err(Error::Cancelled));
        }
        rx
    }

    /// Resolve a single pending request with `err`, e.g. when its frame
    /// could not be written.
    pub fn fail(&self, id: &str, err: Error) {
        if let Some(tx) = self.lock().pending.remove(id) {
            let _ = tx.send(Err(err));
        }
    }

    /// Route one decoded frame.
    pub fn deliver(&self, frame: Frame) {
        match frame {
            Frame::Event(event) => {
                if event.event != wisprclaw_core::message::CHALLENGE_EVENT {
                    tracing::trace!(event = %event.event, "Ignoring gateway event");
                    return;
                }
                let nonce = event.challenge_nonce().map(str::to_string);
                self.resolve_challenge(nonce);
            }
            Frame::Res(res) => {
                if res.is_accepted() {
                    tracing::debug!(id = %res.id, "Request accepted, awaiting final result");
                    return;
                }
                let Some(tx) = self.lock().pending.remove(&res.id) else {
                    tracing::debug!(id = %res.id, "Response for unknown request");
                    return;
                };
                let reply = if res.ok {
                    Ok(res.payload.unwrap_or(Value::Null))
                } else {
                    Err(Error::Agent(res.error_message()))
                };
                let _ = tx.send(reply);
            }
            Frame::Req(req) => {
                tracing::debug!(method = %req.method, "Ignoring gateway-initiated request");
            }
        }
    }

    fn resolve_challenge(&self, nonce: Option<String>) {
        let mut state = self.lock();
        match std::mem::replace(&mut state.challenge, ChallengeSlot::Empty) {
            ChallengeSlot::Awaited(tx) => {
                if let Err(unclaimed) = tx.send(Ok(nonce)) {
                    // Waiter went away; keep the nonce for the next one.
                    if let Ok(nonce) = unclaimed {
                        state.challenge = ChallengeSlot::Buffered(nonce);
                    }
                }
            }
            ChallengeSlot::Empty | ChallengeSlot::Buffered(_) => {
                // The most recent challenge is the one the gateway will check.
                state.challenge = ChallengeSlot::Buffered(nonce);
            }
        }
    }

    /// Wait for the `connect.challenge` nonce, whether it already arrived or
    /// is still on its way.
    pub async fn wait_for_challenge(&self) -> Challenge {
        let rx = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.challenge, ChallengeSlot::Empty) {
                ChallengeSlot::Buffered(nonce) => return Ok(nonce),
                slot @ ChallengeSlot::Awaited(_) => {
                    state.challenge = slot;
                    return Err(Error::Handshake(
                        "challenge already awaited".to_string(),
                    ));
                }
                ChallengeSlot::Empty => {
                    if let Some(err) = &state.closed {
                        return Err(err.clone());
                    }
                    let (tx, rx) = oneshot::channel();
                    state.challenge = ChallengeSlot::Awaited(tx);
                    rx
                }
            }
        };
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Resolve every waiter with `err` and refuse new registrations.
    pub fn fail_all(&self, err: Error) {
        let (pending, challenge) = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(err.clone());
            }
            (
                std::mem::take(&mut state.pending),
                std::mem::replace(&mut state.challenge, ChallengeSlot::Empty),
            )
        };
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), error = %err, "Failing pending requests");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(err.clone()));
        }
        if let ChallengeSlot::Awaited(tx) = challenge {
            let _ = tx.send(Err(err));
        }
    }

    /// Clear all state for a fresh connection attempt, cancelling stragglers.
    pub fn reset(&self) {
        let (pending, challenge) = {
            let mut state = self.lock();
            state.closed = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::replace(&mut state.challenge, ChallengeSlot::Empty),
            )
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::Cancelled));
        }
        if let ChallengeSlot::Awaited(tx) = challenge {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    /// True once [`Self::fail_all`] ran.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of requests still waiting for a final response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}
