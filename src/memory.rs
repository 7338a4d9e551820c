// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Transport
//!
//! A broker simulated inside the process. Destinations match subscriptions by
//! exact name and every subscriber of a destination receives a copy of each
//! message. Confirmations are generated according to a [`ConfirmMode`], or
//! injected by hand with [`MemoryTransport::confirm`].
//!
//! It is the reference behaviour for [`Transport`] and the transport used by
//! the test suites; nothing is persisted and nothing leaves the process.

use crate::{
    confirm::ConfirmOutcome,
    errors::TrackerError,
    transport::{InboundMessage, OutboundMessage, Transport},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// How the in-memory broker answers sequenced publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Ack every sequenced message as soon as it is sent.
    #[default]
    Auto,
    /// Nack every sequenced message as soon as it is sent.
    Reject,
    /// Emit nothing; confirmations come from [`MemoryTransport::confirm`].
    Manual,
}

pub struct MemoryTransport {
    mode: ConfirmMode,
    capacity: usize,
    subscriptions: RwLock<HashMap<String, Vec<mpsc::Sender<InboundMessage>>>>,
    confirms: Mutex<Option<mpsc::Sender<ConfirmOutcome>>>,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl MemoryTransport {
    pub fn new(mode: ConfirmMode, capacity: usize) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            mode,
            capacity: capacity.max(1),
            subscriptions: RwLock::new(HashMap::new()),
            confirms: Mutex::new(None),
            sent: Mutex::new(vec![]),
        })
    }

    /// Emits a confirmation on the current confirmation stream.
    ///
    /// Confirmations emitted before anyone called `confirms()` are dropped.
    pub async fn confirm(&self, outcome: ConfirmOutcome) {
        let sender = lock(&self.confirms).clone();
        match sender {
            Some(tx) => {
                if tx.send(outcome).await.is_err() {
                    debug!(sequence = outcome.sequence, "confirmation listener gone");
                }
            }
            None => debug!(sequence = outcome.sequence, "no confirmation listener"),
        }
    }

    /// Every message sent so far, in send order.
    ///
    /// The log is kept for inspection and grows with every send until it is
    /// taken with [`take_sent`](Self::take_sent).
    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }

    /// Returns the sent log and starts a new, empty one.
    pub fn take_sent(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *lock(&self.sent))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), TrackerError> {
        lock(&self.sent).push(message.clone());

        let inbound = InboundMessage {
            source: message.destination.clone(),
            body: message.body.clone(),
            correlation_id: message.correlation_id.clone(),
            reply_to: message.reply_to.clone(),
            headers: message.headers.clone(),
        };

        {
            let subs = self.subscriptions.read().await;
            if let Some(senders) = subs.get(&message.destination) {
                for sender in senders {
                    // A closed inbox means its subscriber dropped the receiver.
                    let _ = sender.send(inbound.clone()).await;
                }
            }
        }

        if let Some(sequence) = message.sequence {
            match self.mode {
                ConfirmMode::Auto => self.confirm(ConfirmOutcome::ack(sequence, false)).await,
                ConfirmMode::Reject => self.confirm(ConfirmOutcome::nack(sequence, false)).await,
                ConfirmMode::Manual => {}
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, TrackerError> {
        let (tx, rx) = mpsc::channel(self.capacity);

        self.subscriptions
            .write()
            .await
            .entry(destination.to_owned())
            .or_default()
            .push(tx);

        Ok(rx)
    }

    async fn confirms(&self) -> Result<mpsc::Receiver<ConfirmOutcome>, TrackerError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *lock(&self.confirms) = Some(tx);
        Ok(rx)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
