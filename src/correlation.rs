// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply Correlation
//!
//! Turns a fire-and-forget publish plus a shared, asynchronous reply stream
//! into a call that looks synchronous to its caller. Each call parks on a
//! single-slot channel keyed by a random correlation token; the reply listener
//! wakes exactly the caller whose token the reply carries.

use crate::{
    errors::TrackerError,
    pending::PendingSet,
    transport::{OutboundMessage, Transport},
};
use bytes::Bytes;
use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Opaque token matching a reply to its request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reply tagged with the token of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationOutcome {
    pub token: CorrelationToken,
    pub body: Bytes,
}

type Waiters = PendingSet<CorrelationToken, oneshot::Sender<Bytes>>;

/// Matches replies to in-flight calls by correlation token.
#[derive(Default)]
pub struct CorrelationTracker {
    pending: Mutex<Waiters>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a token not used by any in-flight call.
    pub fn new_token(&self) -> CorrelationToken {
        let pending = self.lock();
        loop {
            let token = CorrelationToken::generate();
            if !pending.contains(&token) {
                return token;
            }
        }
    }

    /// Registers interest in `token`, returning the slot its reply lands in.
    pub fn register(
        &self,
        token: CorrelationToken,
    ) -> Result<oneshot::Receiver<Bytes>, TrackerError> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(token, tx)?;
        Ok(rx)
    }

    /// Drops interest in `token`. Returns `false` if it was no longer registered.
    pub fn deregister(&self, token: &CorrelationToken) -> bool {
        self.lock().remove(token).is_some()
    }

    /// Hands a reply to the call waiting on its token.
    ///
    /// Replies for unknown, resolved or timed-out tokens are discarded and
    /// reported as `false`. Never blocks.
    pub fn on_reply(&self, outcome: CorrelationOutcome) -> bool {
        let waiter = self.lock().remove(&outcome.token);

        match waiter {
            Some(entry) => {
                // The receiver may have been dropped by a call cancelled after the lookup.
                if entry.payload.send(outcome.body).is_err() {
                    debug!(token = %outcome.token, "caller went away before the reply");
                    return false;
                }
                true
            }
            None => {
                debug!(token = %outcome.token, "discarding unmatched reply");
                false
            }
        }
    }

    /// Sends `body` to `destination` and waits for the correlated reply.
    ///
    /// Other calls and unrelated replies proceed while this one waits. On
    /// timeout the token is deregistered, so a late reply is discarded.
    pub async fn call(
        &self,
        transport: &dyn Transport,
        destination: &str,
        body: Bytes,
        reply_to: &str,
        timeout: Duration,
    ) -> Result<Bytes, TrackerError> {
        let token = self.new_token();
        let rx = self.register(token.clone())?;
        let guard = InFlight {
            tracker: self,
            token: &token,
        };

        let request = OutboundMessage::new(destination, body)
            .with_correlation_id(token.as_str())
            .with_reply_to(reply_to);
        transport.send(request).await?;

        debug!(token = %token, destination, "request sent, awaiting reply");

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TrackerError::CallCancelled(token.to_string())),
            Err(_) => Err(TrackerError::CallTimeout {
                token: token.to_string(),
                timeout,
            }),
        };
        drop(guard);
        result
    }

    /// Drops every waiter; their calls fail with `CallCancelled`.
    pub fn drain_all(&self) -> usize {
        self.lock().drain().len()
    }

    /// Number of calls currently waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Deregisters the token when the call ends, including when its future is dropped.
struct InFlight<'a> {
    tracker: &'a CorrelationTracker,
    token: &'a CorrelationToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.tracker.deregister(self.token);
    }
}
