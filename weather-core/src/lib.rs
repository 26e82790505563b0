//! Core library for the weather queue consumer.
//!
//! This crate defines:
//! - Configuration (TOML file, `.env`, environment overrides)
//! - The message model published by the producer and posted to the API
//! - Decoding, rounding/reshaping and HTTP forwarding of messages
//! - The RabbitMQ adapter and the sequential consume loop
//!
//! It is used by `weather-consumer`, but the pure parts (`decode`,
//! `transform`) can be reused without a broker.

pub mod config;
pub mod decode;
pub mod forward;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod transform;

pub use config::{AckMode, Config, ConnectionSettings, ForwardSettings};
pub use decode::{DecodeError, decode};
pub use forward::{ForwardError, HttpForwarder, WeatherSink};
pub use model::{CurrentConditions, DailyForecast, Location, WeatherInput, WeatherOutput};
pub use pipeline::{Outcome, Stats, handle, run};
pub use queue::{InboundMessage, MessageSource, QueueError, RabbitSource};
pub use transform::transform;
