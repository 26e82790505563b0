use thiserror::Error;

use crate::model::WeatherInput;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is empty")]
    Empty,

    #[error("invalid weather payload at line {line}, column {column}: {source}")]
    Json {
        line: usize,
        column: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a raw queue message into a [`WeatherInput`].
///
/// Unknown fields are ignored. `aiInsight`, `pastDays` and `daily` may be
/// omitted, and `daily` may be `null`; everything else is required and must
/// have the right type.
pub fn decode(body: &[u8]) -> Result<WeatherInput, DecodeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    serde_json::from_slice(body).map_err(|source| DecodeError::Json {
        line: source.line(),
        column: source.column(),
        source,
    })
}
