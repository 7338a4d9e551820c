// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for Confirmation and Correlation Tracking
//!
//! This module provides the error taxonomy shared by the trackers, the publisher,
//! the RPC client and the transports. Bookkeeping failures (`DuplicateKey`) are
//! programming errors and must be propagated, timeouts are recoverable and carry
//! the keys still outstanding so the caller can decide on redelivery.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur while tracking in-flight publishes and calls.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrackerError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error switching a channel into publisher confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error handing a message to the transport
    #[error("failure to publish")]
    PublishingError,

    /// Error consuming from the given destination
    #[error("failure to consume from `{0}`")]
    ConsumerError(String),

    /// Error loading a configuration document
    #[error("failure to load configuration: {0}")]
    ConfigError(String),

    /// A sequence number or token was registered while already pending.
    ///
    /// This indicates a broken key generator and is never recoverable.
    #[error("key `{0}` is already pending")]
    DuplicateKey(String),

    /// Entries were still unconfirmed when the wait elapsed
    #[error("{count} message(s) still unconfirmed after {timeout:?}", count = .outstanding.len())]
    ConfirmTimeout {
        outstanding: Vec<u64>,
        timeout: Duration,
    },

    /// The broker rejected the listed sequence numbers
    #[error("message(s) nack-ed by the broker: {0:?}")]
    Nacked(Vec<u64>),

    /// No reply carrying the token arrived in time
    #[error("call `{token}` timed out after {timeout:?}")]
    CallTimeout { token: String, timeout: Duration },

    /// The tracker was drained while the call was waiting
    #[error("call `{0}` was cancelled before a reply arrived")]
    CallCancelled(String),
}
