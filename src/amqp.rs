// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! [`Transport`] implemented on a lapin channel switched into publisher
//! confirm mode. Messages go through the default exchange with the destination
//! as routing key, so a destination is simply a queue name.
//!
//! lapin resolves one confirmation per publish; this transport waits on each of
//! them in its own task and reports it against the sequence the publisher
//! attached to the message. Outcomes emitted here therefore never carry
//! `multiple`.

use crate::{
    confirm::ConfirmOutcome,
    errors::TrackerError,
    otel,
    transport::{HeaderValue, Headers, InboundMessage, OutboundMessage, Transport},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{global, trace::Span};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for published payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

pub struct AmqpTransport {
    channel: Arc<Channel>,
    capacity: usize,
    confirms: Mutex<Option<mpsc::Sender<ConfirmOutcome>>>,
}

impl AmqpTransport {
    /// Wraps `channel` and enables publisher confirms on it.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    /// * `capacity` - Buffer size of the inbound and confirmation streams
    pub async fn new(
        channel: Arc<Channel>,
        capacity: usize,
    ) -> Result<Arc<AmqpTransport>, TrackerError> {
        if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            error!(error = err.to_string(), "error enabling publisher confirms");
            return Err(TrackerError::ConfirmSelectError);
        }

        Ok(Arc::new(AmqpTransport {
            channel,
            capacity: capacity.max(1),
            confirms: Mutex::new(None),
        }))
    }

    /// Declares a server-named, exclusive, auto-delete queue for replies.
    ///
    /// # Returns
    /// The name the broker generated for the queue
    pub async fn declare_reply_queue(&self) -> Result<String, TrackerError> {
        match self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => {
                debug!(queue = queue.name().as_str(), "reply queue declared");
                Ok(queue.name().to_string())
            }
            Err(err) => {
                error!(error = err.to_string(), "error to declare the reply queue");
                Err(TrackerError::DeclareQueueError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), TrackerError> {
        let mut btree = to_amqp_headers(&message.headers);
        otel::inject_current(&mut btree);

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));
        if let Some(id) = &message.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(reply_to) = &message.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.clone()));
        }

        let confirm = match self
            .channel
            .basic_publish(
                "",
                &message.destination,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                props,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(TrackerError::PublishingError);
            }
        };

        let Some(sequence) = message.sequence else {
            return Ok(());
        };
        let Some(tx) = self
            .confirms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            debug!(sequence, "no confirmation listener");
            return Ok(());
        };

        tokio::spawn(async move {
            let positive = match confirm.await {
                Ok(confirmation) => confirmation.is_ack(),
                Err(err) => {
                    error!(error = err.to_string(), sequence, "error awaiting confirmation");
                    false
                }
            };
            let outcome = ConfirmOutcome {
                sequence,
                multiple: false,
                positive,
            };
            if tx.send(outcome).await.is_err() {
                debug!(sequence, "confirmation listener gone");
            }
        });

        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, TrackerError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                destination,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(TrackerError::ConsumerError(destination.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let source = destination.to_owned();

        tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let mut span = otel::new_span(&delivery.properties, &tracer, &source);
                        let inbound = to_inbound(&source, delivery);
                        span.end();

                        if tx.send(inbound).await.is_err() {
                            debug!(source, "subscriber dropped, stop consuming");
                            break;
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
        });

        Ok(rx)
    }

    async fn confirms(&self) -> Result<mpsc::Receiver<ConfirmOutcome>, TrackerError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.confirms.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }
}

fn to_amqp_headers(headers: &Headers) -> BTreeMap<ShortString, AMQPValue> {
    headers
        .iter()
        .map(|(key, value)| {
            let amqp_value = match value {
                HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
                HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
                HeaderValue::UInt(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
                HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            };
            (ShortString::from(key.clone()), amqp_value)
        })
        .collect()
}

fn from_amqp_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => {
                    HeaderValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(v) => HeaderValue::Str(v.to_string()),
                AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::LongUInt(v) => HeaderValue::UInt(*v),
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}

fn to_inbound(source: &str, delivery: Delivery) -> InboundMessage {
    let props = &delivery.properties;

    InboundMessage {
        source: source.to_owned(),
        correlation_id: props.correlation_id().as_ref().map(|id| id.to_string()),
        reply_to: props.reply_to().as_ref().map(|r| r.to_string()),
        headers: props
            .headers()
            .as_ref()
            .map(from_amqp_headers)
            .unwrap_or_default(),
        body: Bytes::from(delivery.data),
    }
}
