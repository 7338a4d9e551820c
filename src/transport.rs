// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The trackers never talk to a broker directly. They depend on this trait,
//! which models a broker connection as three things: a way to send a message,
//! a stream of inbound messages per destination, and a stream of publisher
//! confirmations.
//!
//! Message metadata the trackers rely on (correlation token, reply destination,
//! sequence number) travels in dedicated fields and is carried opaquely by the
//! transport.

use crate::{confirm::ConfirmOutcome, errors::TrackerError};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

/// A header value carried alongside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    UInt(u32),
    Bool(bool),
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// A message handed to [`Transport::send`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Set for publishes awaiting a confirmation; echoed on the `ConfirmOutcome`.
    pub sequence: Option<u64>,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(destination: &str, body: Bytes) -> Self {
        OutboundMessage {
            destination: destination.to_owned(),
            body,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, destination: &str) -> Self {
        self.reply_to = Some(destination.to_owned());
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Destination the message was consumed from.
    pub source: String,
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Headers,
}

impl InboundMessage {
    /// Builds the reply to this message, echoing its correlation token.
    ///
    /// Returns `None` when the sender did not ask for a reply.
    pub fn reply(&self, body: Bytes) -> Option<OutboundMessage> {
        let reply_to = self.reply_to.as_deref()?;
        let mut reply = OutboundMessage::new(reply_to, body);
        reply.correlation_id = self.correlation_id.clone();
        Some(reply)
    }
}

/// A broker connection as seen by the trackers.
///
/// Implementations must deliver confirmations and inbound messages without
/// waiting on the callers of `send`, otherwise a caller blocked on a reply could
/// stall the very delivery it waits for.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands a message to the broker. Returning `Ok` does not mean it was confirmed.
    async fn send(&self, message: OutboundMessage) -> Result<(), TrackerError>;

    /// Starts delivering messages addressed to `destination`.
    ///
    /// Messages sent after this returns are deliverable on the receiver.
    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, TrackerError>;

    /// Opens the stream of publisher confirmations.
    ///
    /// A transport supports one confirmation listener; calling this again
    /// replaces the previous stream.
    async fn confirms(&self) -> Result<mpsc::Receiver<ConfirmOutcome>, TrackerError>;
}

pub type TransportPtr = Arc<dyn Transport>;
