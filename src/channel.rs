// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module opens the connection to RabbitMQ described by an [`AmqpConfig`]
//! and creates the channel the [`AmqpTransport`](crate::amqp::AmqpTransport)
//! publishes and consumes on.

use crate::{config::AmqpConfig, errors::TrackerError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// # Parameters
/// * `cfg` - Broker host, port, credentials, vhost and connection name
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), TrackerError>` -
///   The connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    cfg: &AmqpConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), TrackerError> {
    debug!(host = cfg.host, port = cfg.port, "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(TrackerError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    match conn.create_channel().await {
        Ok(c) => {
            debug!(channel = c.id(), "channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(TrackerError::ChannelError)
        }
    }
}
