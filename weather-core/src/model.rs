use serde::{Deserialize, Deserializer, Serialize};

/// Where the reading was taken, as published by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub past_days: Option<i64>,
}

/// The live reading. Same shape on the way in and on the way out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentConditions {
    pub time: String,
    pub temperature: f64,
    pub relative_humidity: f64,
    pub apparent_temperature: f64,
    pub is_day: bool,
    pub uv: f64,
    pub precipitation_probability: i64,
    pub weather_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyForecast {
    pub date: String,
    pub temperature_max: f64,
    pub temperature_min: f64,
    pub apparent_temperature_max: f64,
    pub apparent_temperature_min: f64,
    pub uv_index_max: f64,
    pub precipitation_probability: i64,
    pub weather_code: String,
}

/// Message body published on the `weather` queue.
///
/// Only the floating-point / UV schema is accepted. The older
/// integer-temperature variant (with `rainMm`, `rainProbability`) fails to
/// decode because the required `uv` and `weatherCode` fields are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherInput {
    pub location: Location,
    pub current: CurrentConditions,
    /// Missing and `null` both mean no forecast days.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub daily: Vec<DailyForecast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_insight: Option<String>,
}

/// Payload posted to the logging API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherOutput {
    /// `<current.time> - <location.timezone>`
    pub time: String,
    pub city: String,
    /// Always exactly one element.
    pub current: Vec<CurrentConditions>,
    pub daily: Vec<DailyForecast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_insight: Option<String>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
