// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply over a Shared Reply Destination
//!
//! `RpcClient` owns one [`CorrelationTracker`] and one subscription on its
//! reply destination. Any number of calls may be in flight at once; the
//! listener task routes each reply to its caller by correlation token, never
//! by arrival order.
//!
//! [`serve`] is the other half: it consumes requests, runs a handler and sends
//! the result back to the request's reply destination with the token echoed.

use crate::{
    config::TrackerConfig,
    correlation::{CorrelationOutcome, CorrelationTracker},
    errors::TrackerError,
    transport::{InboundMessage, TransportPtr},
};
use bytes::Bytes;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

pub struct RpcClient {
    transport: TransportPtr,
    tracker: Arc<CorrelationTracker>,
    reply_to: String,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Creates a client listening for replies on `reply_to`.
    ///
    /// The subscription is in place before this returns, so no reply to a
    /// later call can be missed.
    pub async fn new(
        transport: TransportPtr,
        reply_to: &str,
        config: &TrackerConfig,
    ) -> Result<RpcClient, TrackerError> {
        let inbox = transport.subscribe(reply_to).await?;
        let tracker = Arc::new(CorrelationTracker::new());

        let listener = tokio::spawn(listen(inbox, tracker.clone()));
        debug!(reply_to, "rpc client listening for replies");

        Ok(RpcClient {
            transport,
            tracker,
            reply_to: reply_to.to_owned(),
            timeout: config.call_timeout(),
            listener,
        })
    }

    /// Calls `destination` with the configured call timeout.
    pub async fn call(&self, destination: &str, body: Bytes) -> Result<Bytes, TrackerError> {
        self.call_timeout(destination, body, self.timeout).await
    }

    /// Calls `destination` and waits at most `timeout` for the reply.
    pub async fn call_timeout(
        &self,
        destination: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TrackerError> {
        self.tracker
            .call(
                self.transport.as_ref(),
                destination,
                body,
                &self.reply_to,
                timeout,
            )
            .await
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Number of calls waiting for their reply.
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Stops listening; calls still waiting fail with `CallCancelled`.
    pub fn close(&self) {
        self.listener.abort();
        let cancelled = self.tracker.drain_all();
        if cancelled > 0 {
            warn!(cancelled, "rpc client closed with calls in flight");
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(mut inbox: mpsc::Receiver<InboundMessage>, tracker: Arc<CorrelationTracker>) {
    while let Some(msg) = inbox.recv().await {
        let Some(token) = msg.correlation_id else {
            warn!(source = msg.source, "reply without correlation id discarded");
            continue;
        };

        tracker.on_reply(CorrelationOutcome {
            token: token.into(),
            body: msg.body,
        });
    }

    debug!("reply stream closed");
}

/// Serves requests arriving on `queue` until the subscription closes.
///
/// Each request is handled in turn; the handler's result is sent to the
/// request's reply destination. Requests without one are dropped.
pub async fn serve<F, Fut>(
    transport: TransportPtr,
    queue: &str,
    handler: F,
) -> Result<JoinHandle<()>, TrackerError>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Bytes> + Send + 'static,
{
    let mut inbox = transport.subscribe(queue).await?;
    debug!(queue, "awaiting rpc requests");

    Ok(tokio::spawn(async move {
        while let Some(request) = inbox.recv().await {
            let response = handler(request.body.clone()).await;

            let Some(reply) = request.reply(response) else {
                warn!(source = request.source, "request without reply destination dropped");
                continue;
            };

            if let Err(err) = transport.send(reply).await {
                error!(error = err.to_string(), "error sending reply");
            }
        }
    }))
}
