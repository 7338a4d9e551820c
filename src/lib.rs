// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Confirmation and correlation tracking for asynchronous message channels.
//!
//! [`ConfirmTracker`](confirm::ConfirmTracker) remembers every confirmed publish
//! until the broker acks or nacks it. [`CorrelationTracker`](correlation::CorrelationTracker)
//! turns a publish plus a shared reply stream into a request/reply call. Both
//! sit on top of the [`Transport`](transport::Transport) trait, implemented for
//! RabbitMQ through lapin and in memory for tests.

mod otel;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod confirm;
pub mod correlation;
pub mod errors;
pub mod memory;
pub mod pending;
pub mod publisher;
pub mod rpc;
pub mod transport;
