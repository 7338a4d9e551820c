// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirming Publisher
//!
//! This module combines a [`ConfirmTracker`] with a [`Transport`] to publish
//! messages whose delivery the broker confirms. Three strategies share the same
//! pending set:
//!
//! - `publish_and_wait`: publish one message and wait for its confirmation
//! - `publish_batch`: publish in groups of `batch_size`, waiting after each group
//! - `publish`: fire and forget, confirmations arrive as [`Resolution`] events
//!
//! A background listener consumes the transport's confirmation stream and
//! resolves tracker entries as acks and nacks arrive.

use crate::{
    config::TrackerConfig,
    confirm::{ConfirmOutcome, ConfirmTracker, Resolution},
    errors::TrackerError,
    transport::{OutboundMessage, TransportPtr},
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// Publisher that tracks every message until the broker confirms it.
pub struct ConfirmPublisher {
    transport: TransportPtr,
    tracker: Arc<ConfirmTracker<Bytes>>,
    // Held across sequence assignment, registration and send.
    send_lock: Mutex<()>,
    events: broadcast::Sender<Resolution<Bytes>>,
    config: TrackerConfig,
    listener: JoinHandle<()>,
}

impl ConfirmPublisher {
    /// Creates a publisher and starts listening for confirmations.
    ///
    /// # Parameters
    /// * `transport` - A transport in confirmation mode
    /// * `config` - Timeouts, batch size and channel capacity
    ///
    /// # Returns
    /// An Arc-wrapped ConfirmPublisher instance for thread-safe sharing
    pub async fn new(
        transport: TransportPtr,
        config: TrackerConfig,
    ) -> Result<Arc<ConfirmPublisher>, TrackerError> {
        let confirms = transport.confirms().await?;
        let tracker = Arc::new(ConfirmTracker::new(config.poll_interval()));
        let (events, _) = broadcast::channel(config.channel_capacity());

        let listener = tokio::spawn(listen(confirms, tracker.clone(), events.clone()));

        Ok(Arc::new(ConfirmPublisher {
            transport,
            tracker,
            send_lock: Mutex::new(()),
            events,
            config,
            listener,
        }))
    }

    /// Publishes a message without waiting for its confirmation.
    ///
    /// The sequence is registered before the message reaches the transport, so
    /// a confirmation can never overtake its own registration. The outcome is
    /// only reported through [`subscribe`](Self::subscribe).
    ///
    /// # Returns
    /// The sequence number assigned to the message
    pub async fn publish(&self, destination: &str, body: Bytes) -> Result<u64, TrackerError> {
        self.send(destination, body, false).await
    }

    /// Publishes one message and waits until the broker confirms it.
    ///
    /// Fails with `Nacked` if the broker rejected it, or `ConfirmTimeout`
    /// after the configured confirm timeout. Outcomes of other publishes never
    /// affect the result.
    pub async fn publish_and_wait(
        &self,
        destination: &str,
        body: Bytes,
    ) -> Result<u64, TrackerError> {
        let sequence = self.send(destination, body, true).await?;
        self.tracker
            .wait_for(&[sequence], self.config.confirm_timeout())
            .await?;
        Ok(sequence)
    }

    /// Publishes every body, waiting for confirmations after each batch.
    ///
    /// A nack fails the whole batch it arrived in; which message of the batch
    /// was rejected is not attributed.
    ///
    /// # Returns
    /// The sequence numbers of all published messages, in order
    pub async fn publish_batch<I>(
        &self,
        destination: &str,
        bodies: I,
    ) -> Result<Vec<u64>, TrackerError>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let batch_size = self.config.batch_size();
        let mut sequences = vec![];
        let mut batch_start = 0;

        for body in bodies {
            sequences.push(self.send(destination, body, true).await?);

            if sequences.len() - batch_start == batch_size {
                self.wait_for_batch(&sequences[batch_start..]).await?;
                batch_start = sequences.len();
            }
        }

        if batch_start < sequences.len() {
            self.wait_for_batch(&sequences[batch_start..]).await?;
        }

        debug!(count = sequences.len(), batch_size, "batch confirmed");
        Ok(sequences)
    }

    async fn wait_for_batch(&self, batch: &[u64]) -> Result<(), TrackerError> {
        let timeout = self.config.confirm_timeout();
        match self.tracker.wait_for(batch, timeout).await {
            Err(TrackerError::Nacked(_)) => Err(TrackerError::Nacked(batch.to_vec())),
            result => result,
        }
    }

    /// Waits until everything published so far is confirmed.
    ///
    /// Only reports `ConfirmTimeout`; nacks reach the waiting publish calls
    /// and the [`Resolution`] stream.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> Result<(), TrackerError> {
        self.tracker.wait_for_confirms(timeout).await
    }

    /// Waits for all outstanding confirmations using the flush timeout.
    pub async fn flush(&self) -> Result<(), TrackerError> {
        self.wait_for_confirms(self.config.flush_timeout()).await
    }

    /// Receives a [`Resolution`] for every confirmation processed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Resolution<Bytes>> {
        self.events.subscribe()
    }

    /// Sequences still awaiting confirmation.
    pub fn outstanding(&self) -> Vec<u64> {
        self.tracker.outstanding()
    }

    /// Gives up on messages unconfirmed for at least `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<u64> {
        self.tracker.evict_stale(max_age)
    }

    /// Stops the listener and returns every message that was never confirmed.
    pub fn close(&self) -> Vec<(u64, Bytes)> {
        self.listener.abort();
        self.tracker.drain_all()
    }

    // Assigns the sequence, registers it and hands the message to the transport.
    async fn send(
        &self,
        destination: &str,
        body: Bytes,
        watched: bool,
    ) -> Result<u64, TrackerError> {
        let _guard = self.send_lock.lock().await;

        let sequence = self.tracker.next_sequence();
        if watched {
            self.tracker.register_watched(sequence, body.clone())?;
        } else {
            self.tracker.register(sequence, body.clone())?;
        }

        let message = OutboundMessage::new(destination, body).with_sequence(sequence);
        if let Err(err) = self.transport.send(message).await {
            error!(error = err.to_string(), sequence, "error publishing message");
            self.tracker.forget(sequence);
            return Err(err);
        }

        Ok(sequence)
    }
}

impl Drop for ConfirmPublisher {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    mut confirms: mpsc::Receiver<ConfirmOutcome>,
    tracker: Arc<ConfirmTracker<Bytes>>,
    events: broadcast::Sender<Resolution<Bytes>>,
) {
    while let Some(outcome) = confirms.recv().await {
        let resolution = tracker.resolve(outcome);

        for (sequence, body) in &resolution.nacked {
            warn!(
                sequence,
                multiple = outcome.multiple,
                size = body.len(),
                "message has been nack-ed"
            );
        }

        // No subscriber is not an error.
        let _ = events.send(resolution);
    }

    debug!("confirmation stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{ConfirmMode, MemoryTransport},
        transport::{MockTransport, Transport},
    };

    fn config() -> TrackerConfig {
        TrackerConfig::default()
            .with_confirm_timeout(Duration::from_millis(200))
            .with_batch_size(3)
    }

    #[tokio::test]
    async fn publish_and_wait_returns_after_ack() {
        let transport = MemoryTransport::new(ConfirmMode::Auto, 16);
        let publisher = ConfirmPublisher::new(transport.clone(), config()).await.unwrap();

        assert_eq!(publisher.publish_and_wait("q", Bytes::from_static(b"0")).await, Ok(1));
        assert_eq!(publisher.publish_and_wait("q", Bytes::from_static(b"1")).await, Ok(2));
        assert!(publisher.outstanding().is_empty());
        assert_eq!(transport.sent()[1].sequence, Some(2));
    }

    #[tokio::test]
    async fn publish_and_wait_fails_on_nack() {
        let transport = MemoryTransport::new(ConfirmMode::Reject, 16);
        let publisher = ConfirmPublisher::new(transport, config()).await.unwrap();

        assert_eq!(
            publisher.publish_and_wait("q", Bytes::from_static(b"0")).await,
            Err(TrackerError::Nacked(vec![1]))
        );
    }

    #[tokio::test]
    async fn publish_and_wait_times_out_without_confirmation() {
        let transport = MemoryTransport::new(ConfirmMode::Manual, 16);
        let publisher = ConfirmPublisher::new(transport, config()).await.unwrap();

        assert_eq!(
            publisher.publish_and_wait("q", Bytes::from_static(b"0")).await,
            Err(TrackerError::ConfirmTimeout {
                outstanding: vec![1],
                timeout: Duration::from_millis(200),
            })
        );
        assert_eq!(publisher.outstanding(), vec![1]);
    }

    #[tokio::test]
    async fn batch_publishes_in_groups() {
        let transport = MemoryTransport::new(ConfirmMode::Auto, 16);
        let publisher = ConfirmPublisher::new(transport.clone(), config()).await.unwrap();

        let bodies = (0..7).map(|i| Bytes::from(i.to_string()));
        let sequences = publisher.publish_batch("q", bodies).await.unwrap();

        assert_eq!(sequences, (1..=7).collect::<Vec<u64>>());
        assert_eq!(transport.sent().len(), 7);
        assert!(publisher.outstanding().is_empty());
    }

    #[tokio::test]
    async fn async_publish_emits_resolutions() {
        let transport = MemoryTransport::new(ConfirmMode::Manual, 16);
        let publisher = ConfirmPublisher::new(transport.clone(), config()).await.unwrap();
        let mut events = publisher.subscribe();

        for i in 0..5 {
            publisher.publish("q", Bytes::from(i.to_string())).await.unwrap();
        }
        assert_eq!(publisher.outstanding(), vec![1, 2, 3, 4, 5]);

        transport.confirm(ConfirmOutcome::ack(3, true)).await;
        let first = events.recv().await.unwrap();
        assert_eq!(first.resolved, vec![1, 2, 3]);
        assert_eq!(publisher.outstanding(), vec![4, 5]);

        transport.confirm(ConfirmOutcome::nack(5, false)).await;
        let second = events.recv().await.unwrap();
        assert_eq!(second.nacked, vec![(5, Bytes::from_static(b"4"))]);

        transport.confirm(ConfirmOutcome::ack(4, false)).await;
        assert_eq!(publisher.flush().await, Ok(()));
    }

    async fn until_outstanding(publisher: &ConfirmPublisher, expected: &[u64]) {
        while publisher.outstanding() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn sequence_of(transport: &MemoryTransport, body: &'static [u8]) -> u64 {
        transport
            .sent()
            .iter()
            .find(|msg| msg.body == body)
            .and_then(|msg| msg.sequence)
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_waits_see_only_their_own_outcome() {
        let transport = MemoryTransport::new(ConfirmMode::Manual, 16);
        let publisher = ConfirmPublisher::new(transport.clone(), config()).await.unwrap();

        let spawn_wait = |body: &'static [u8]| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .publish_and_wait("q", Bytes::from_static(body))
                    .await
            })
        };
        let a = spawn_wait(b"a");
        let b = spawn_wait(b"b");

        until_outstanding(&publisher, &[1, 2]).await;
        let seq_a = sequence_of(&transport, b"a");
        let seq_b = sequence_of(&transport, b"b");

        transport.confirm(ConfirmOutcome::ack(seq_a, false)).await;
        transport.confirm(ConfirmOutcome::nack(seq_b, false)).await;

        assert_eq!(a.await.unwrap(), Ok(seq_a));
        assert_eq!(b.await.unwrap(), Err(TrackerError::Nacked(vec![seq_b])));
    }

    #[tokio::test]
    async fn earlier_async_nack_does_not_fail_a_later_wait() {
        let transport = MemoryTransport::new(ConfirmMode::Manual, 16);
        let publisher = ConfirmPublisher::new(transport.clone(), config()).await.unwrap();
        let mut events = publisher.subscribe();

        publisher.publish("q", Bytes::from_static(b"lost")).await.unwrap();
        transport.confirm(ConfirmOutcome::nack(1, false)).await;
        assert_eq!(events.recv().await.unwrap().nacked.len(), 1);

        let waiter = publisher.clone();
        let wait = tokio::spawn(async move {
            waiter
                .publish_and_wait("q", Bytes::from_static(b"kept"))
                .await
        });

        until_outstanding(&publisher, &[2]).await;
        transport.confirm(ConfirmOutcome::ack(2, false)).await;

        assert_eq!(wait.await.unwrap(), Ok(2));
        assert_eq!(publisher.tracker.watched(), 0);
    }

    #[tokio::test]
    async fn failed_send_releases_the_sequence() {
        let mut transport = MockTransport::new();
        transport
            .expect_confirms()
            .returning(|| Ok(mpsc::channel(1).1));
        transport
            .expect_send()
            .returning(|_| Err(TrackerError::PublishingError));

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let publisher = ConfirmPublisher::new(transport, config()).await.unwrap();

        assert_eq!(
            publisher.publish("q", Bytes::new()).await,
            Err(TrackerError::PublishingError)
        );
        assert!(publisher.outstanding().is_empty());
    }

    #[tokio::test]
    async fn close_returns_unconfirmed_messages() {
        let transport = MemoryTransport::new(ConfirmMode::Manual, 16);
        let publisher = ConfirmPublisher::new(transport, config()).await.unwrap();

        publisher.publish("q", Bytes::from_static(b"a")).await.unwrap();
        publisher.publish("q", Bytes::from_static(b"b")).await.unwrap();

        let left = publisher.close();
        assert_eq!(
            left,
            vec![(1, Bytes::from_static(b"a")), (2, Bytes::from_static(b"b"))]
        );
    }
}
