//! Broker side of the consumer: connecting with retry, declaring the
//! `weather` queue and turning deliveries into [`InboundMessage`]s.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    Channel, Connection, ConnectionProperties, Consumer,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    uri::AMQPUri,
};
use std::{fmt, future::Future, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AckMode, ConnectionSettings, QUEUE_NAME};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("could not connect to broker after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("failed to {step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to receive delivery: {0}")]
    Delivery(#[source] lapin::Error),

    #[error("failed to settle delivery: {0}")]
    Settle(#[source] lapin::Error),

    #[error("consumer stream closed by broker")]
    Closed,
}

/// Call `dial` until it succeeds or `max_attempts` is reached, sleeping
/// `delay` between attempts.
pub async fn retry_connect<T, E, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut dial: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match dial().await {
            Ok(conn) => {
                if attempt > 1 {
                    info!(attempt, "Broker connection established after retry");
                }
                return Ok(conn);
            }
            Err(err) => {
                let err: BoxError = err.into();
                if attempt >= max_attempts {
                    return Err(QueueError::Connect {
                        attempts: attempt,
                        source: err,
                    });
                }
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    "Broker connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

/// Used when the broker already considers the message delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAcked;

#[async_trait]
impl Acknowledge for AutoAcked {
    async fn ack(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), QueueError> {
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), QueueError> {
        Acker::ack(self, BasicAckOptions::default())
            .await
            .map_err(QueueError::Settle)
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        Acker::reject(self, BasicRejectOptions { requeue })
            .await
            .map_err(QueueError::Settle)
    }
}

pub struct InboundMessage {
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl InboundMessage {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub fn auto_acked(body: Vec<u8>) -> Self {
        Self::new(body, false, Box::new(AutoAcked))
    }

    pub async fn ack(&self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Blocking-style iteration over queue messages. `None` means the consumer
/// has ended and no further messages will arrive.
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, QueueError>>;
}

/// Unacked deliveries the broker may push ahead of the one being handled.
/// Messages are processed one at a time, so manual mode holds at most one.
/// Auto-acked deliveries are never outstanding.
pub fn prefetch_limit(ack_mode: AckMode) -> Option<u16> {
    match ack_mode {
        AckMode::Auto => None,
        AckMode::Manual => Some(1),
    }
}

/// Consumer on the durable `weather` queue.
pub struct RabbitSource {
    // Dropping the connection closes the consumer.
    _connection: Connection,
    _channel: Channel,
    consumer: Consumer,
    ack_mode: AckMode,
}

impl RabbitSource {
    pub async fn connect(
        settings: &ConnectionSettings,
        ack_mode: AckMode,
    ) -> Result<Self, QueueError> {
        let mut uri: AMQPUri = settings.url.parse().map_err(QueueError::InvalidUrl)?;
        uri.query.heartbeat = Some(settings.heartbeat_secs);

        info!(
            host = %uri.authority.host,
            port = uri.authority.port,
            heartbeat = settings.heartbeat_secs,
            "Connecting to RabbitMQ"
        );

        let connection = retry_connect(settings.max_retries, settings.retry_delay(), || {
            Connection::connect_uri(uri.clone(), ConnectionProperties::default())
        })
        .await?;
        info!("Connected to RabbitMQ");

        let channel = connection
            .create_channel()
            .await
            .map_err(|source| QueueError::Setup {
                step: "open channel",
                source,
            })?;

        let queue = channel
            .queue_declare(
                QUEUE_NAME,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| QueueError::Setup {
                step: "declare queue",
                source,
            })?;
        info!(queue = QUEUE_NAME, pending = queue.message_count(), "Queue declared");

        if let Some(prefetch) = prefetch_limit(ack_mode) {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|source| QueueError::Setup {
                    step: "set prefetch",
                    source,
                })?;
        }

        let consumer = channel
            .basic_consume(
                QUEUE_NAME,
                "",
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| QueueError::Setup {
                step: "start consumer",
                source,
            })?;
        info!(queue = QUEUE_NAME, %ack_mode, "Consumer waiting for messages");

        Ok(Self {
            _connection: connection,
            _channel: channel,
            consumer,
            ack_mode,
        })
    }
}

#[async_trait]
impl MessageSource for RabbitSource {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, QueueError>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(err) => return Some(Err(QueueError::Delivery(err))),
        };

        let acker: Box<dyn Acknowledge> = match self.ack_mode {
            AckMode::Auto => Box::new(AutoAcked),
            AckMode::Manual => Box::new(delivery.acker),
        };

        Some(Ok(InboundMessage::new(delivery.data, delivery.redelivered, acker)))
    }
}
