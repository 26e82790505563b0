use tracing::{error, info, warn};

use crate::{
    config::AckMode,
    decode::decode,
    forward::WeatherSink,
    queue::{InboundMessage, MessageSource, QueueError},
    transform::transform,
};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    DecodeFailed,
    /// `retryable` is false when the API would reject the payload again.
    ForwardFailed { retryable: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub received: u64,
    pub forwarded: u64,
    pub decode_failures: u64,
    pub forward_failures: u64,
}

impl Stats {
    fn record(&mut self, outcome: Outcome) {
        self.received += 1;
        match outcome {
            Outcome::Forwarded => self.forwarded += 1,
            Outcome::DecodeFailed => self.decode_failures += 1,
            Outcome::ForwardFailed { .. } => self.forward_failures += 1,
        }
    }
}

/// Decode, transform and forward one message body. Never fails: every
/// problem is logged and reported through the [`Outcome`].
pub async fn handle<S>(sink: &S, body: &[u8]) -> Outcome
where
    S: WeatherSink + ?Sized,
{
    let input = match decode(body) {
        Ok(input) => input,
        Err(err) => {
            warn!(error = %err, bytes = body.len(), "Dropping invalid weather message");
            return Outcome::DecodeFailed;
        }
    };

    let output = transform(input);

    match sink.forward(&output).await {
        Ok(status) => {
            info!(city = %output.city, time = %output.time, %status, "Sent to API");
            Outcome::Forwarded
        }
        Err(err) => {
            let retryable = err.is_retryable();
            error!(city = %output.city, error = %err, retryable, "Failed to send weather to API");
            Outcome::ForwardFailed { retryable }
        }
    }
}

/// Process messages one at a time until the source ends or fails.
///
/// In [`AckMode::Manual`] a message is acked once forwarded and requeued
/// only when the API failure was transient. Undecodable messages and
/// payloads the API refused are rejected without requeue. In
/// [`AckMode::Auto`] the broker has already forgotten the message.
///
/// Returns [`QueueError::Closed`] when the consumer stream ends; there is
/// no reconnect.
pub async fn run<M, S>(source: &mut M, sink: &S, ack_mode: AckMode) -> (Stats, QueueError)
where
    M: MessageSource + ?Sized,
    S: WeatherSink + ?Sized,
{
    let mut stats = Stats::default();

    loop {
        let message = match source.next_message().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => return (stats, err),
            None => return (stats, QueueError::Closed),
        };

        info!(bytes = message.body.len(), redelivered = message.redelivered, "Message received");

        let outcome = handle(sink, &message.body).await;
        stats.record(outcome);

        if ack_mode == AckMode::Manual {
            if let Err(err) = settle(&message, outcome).await {
                return (stats, err);
            }
        }
    }
}

async fn settle(message: &InboundMessage, outcome: Outcome) -> Result<(), QueueError> {
    match outcome {
        Outcome::Forwarded => message.ack().await,
        Outcome::DecodeFailed => message.reject(false).await,
        Outcome::ForwardFailed { retryable } => message.reject(retryable).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{forward::ForwardError, model::WeatherOutput, queue::Acknowledge};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    const VALID: &str = r#"{
        "location": {"city": "Lisbon", "latitude": 38.72, "longitude": -9.14, "timezone": "Europe/Lisbon"},
        "current": {
            "time": "2024-05-01T10:00", "temperature": 21.5, "relativeHumidity": 60.0,
            "apparentTemperature": 20.2, "isDay": true, "uv": 5.27,
            "precipitationProbability": 10, "weatherCode": "Nublado"
        },
        "daily": []
    }"#;

    #[derive(Debug, Default)]
    struct RecordingSink {
        sent: Mutex<Vec<WeatherOutput>>,
        fail_with: Option<StatusCode>,
    }

    impl RecordingSink {
        fn failing(status: StatusCode) -> Self {
            Self {
                fail_with: Some(status),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl WeatherSink for RecordingSink {
        async fn forward(&self, output: &WeatherOutput) -> Result<StatusCode, ForwardError> {
            if let Some(status) = self.fail_with {
                return Err(ForwardError::Rejected {
                    status,
                    body: String::new(),
                });
            }
            self.sent.lock().unwrap().push(output.clone());
            Ok(StatusCode::CREATED)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Settled {
        Ack,
        Reject { requeue: bool },
    }

    struct RecordingAck(Arc<Mutex<Vec<Settled>>>);

    #[async_trait]
    impl Acknowledge for RecordingAck {
        async fn ack(&self) -> Result<(), QueueError> {
            self.0.lock().unwrap().push(Settled::Ack);
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
            self.0.lock().unwrap().push(Settled::Reject { requeue });
            Ok(())
        }
    }

    struct VecSource {
        bodies: VecDeque<&'static str>,
        settled: Arc<Mutex<Vec<Settled>>>,
    }

    impl VecSource {
        fn new(bodies: &[&'static str]) -> Self {
            Self {
                bodies: bodies.iter().copied().collect(),
                settled: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl MessageSource for VecSource {
        async fn next_message(&mut self) -> Option<Result<InboundMessage, QueueError>> {
            let body = self.bodies.pop_front()?;
            let acker = Box::new(RecordingAck(self.settled.clone()));
            Some(Ok(InboundMessage::new(body.as_bytes().to_vec(), false, acker)))
        }
    }

    #[tokio::test]
    async fn handle_forwards_transformed_payload() {
        let sink = RecordingSink::default();

        assert_eq!(handle(&sink, VALID.as_bytes()).await, Outcome::Forwarded);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].time, "2024-05-01T10:00 - Europe/Lisbon");
        assert_eq!(sent[0].current[0].temperature, 22.0);
        assert_eq!(sent[0].current[0].uv, 5.3);
    }

    #[tokio::test]
    async fn handle_reports_decode_failure() {
        let sink = RecordingSink::default();

        assert_eq!(handle(&sink, br#"{"location": {}}"#).await, Outcome::DecodeFailed);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_message_does_not_stop_the_loop() {
        let mut source = VecSource::new(&["not json", VALID, r#"{"current": null}"#, VALID]);
        let sink = RecordingSink::default();

        let (stats, end) = run(&mut source, &sink, AckMode::Auto).await;

        assert!(matches!(end, QueueError::Closed));
        assert_eq!(
            stats,
            Stats {
                received: 4,
                forwarded: 2,
                decode_failures: 2,
                forward_failures: 0,
            }
        );
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
        // auto mode never talks to the acker
        assert!(source.settled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_failure_is_counted_and_skipped() {
        let mut source = VecSource::new(&[VALID, VALID]);
        let sink = RecordingSink::failing(StatusCode::BAD_GATEWAY);

        let (stats, _) = run(&mut source, &sink, AckMode::Auto).await;

        assert_eq!(stats.received, 2);
        assert_eq!(stats.forward_failures, 2);
    }

    #[tokio::test]
    async fn manual_mode_settles_by_outcome() {
        let mut source = VecSource::new(&[VALID, "garbage"]);
        let sink = RecordingSink::default();
        run(&mut source, &sink, AckMode::Manual).await;

        assert_eq!(
            *source.settled.lock().unwrap(),
            vec![Settled::Ack, Settled::Reject { requeue: false }]
        );

        let mut source = VecSource::new(&[VALID]);
        let failing = RecordingSink::failing(StatusCode::BAD_GATEWAY);
        run(&mut source, &failing, AckMode::Manual).await;

        assert_eq!(
            *source.settled.lock().unwrap(),
            vec![Settled::Reject { requeue: true }]
        );
    }

    #[tokio::test]
    async fn refused_payload_is_not_requeued() {
        let sink = RecordingSink::failing(StatusCode::BAD_REQUEST);
        assert_eq!(
            handle(&sink, VALID.as_bytes()).await,
            Outcome::ForwardFailed { retryable: false }
        );

        let mut source = VecSource::new(&[VALID, VALID]);
        let (stats, _) = run(&mut source, &sink, AckMode::Manual).await;

        assert_eq!(stats.forward_failures, 2);
        assert_eq!(
            *source.settled.lock().unwrap(),
            vec![Settled::Reject { requeue: false }; 2]
        );
    }

    /// A broker that puts requeued messages back at the head of the queue.
    struct RequeueingSource {
        queue: VecDeque<&'static str>,
        deliveries: usize,
        settled: Arc<Mutex<Vec<Settled>>>,
    }

    #[async_trait]
    impl MessageSource for RequeueingSource {
        async fn next_message(&mut self) -> Option<Result<InboundMessage, QueueError>> {
            // A requeued message from the previous delivery goes back first.
            if let Some(Settled::Reject { requeue: true }) = self.settled.lock().unwrap().last() {
                self.queue.push_front(VALID);
            }
            if self.deliveries >= 50 {
                return None;
            }
            let body = self.queue.pop_front()?;
            self.deliveries += 1;
            let acker = Box::new(RecordingAck(self.settled.clone()));
            Some(Ok(InboundMessage::new(body.as_bytes().to_vec(), false, acker)))
        }
    }

    #[tokio::test]
    async fn refused_payload_drains_from_the_queue() {
        let mut source = RequeueingSource {
            queue: VecDeque::from([VALID]),
            deliveries: 0,
            settled: Arc::default(),
        };
        let sink = RecordingSink::failing(StatusCode::BAD_REQUEST);

        let (stats, end) = run(&mut source, &sink, AckMode::Manual).await;

        assert!(matches!(end, QueueError::Closed));
        assert_eq!(source.deliveries, 1);
        assert_eq!(stats.received, 1);
        assert!(source.queue.is_empty());
    }
}
