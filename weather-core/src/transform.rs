//! Reshaping of queue payloads into the API's logging format.
//!
//! Everything here is pure. Any input that made it through the decoder
//! produces an output.

use crate::model::{CurrentConditions, DailyForecast, WeatherInput, WeatherOutput};

/// Round to the nearest whole number, halves away from zero.
pub fn round_whole(value: f64) -> f64 {
    value.round()
}

/// Round to one decimal place, halves away from zero.
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn transform(input: WeatherInput) -> WeatherOutput {
    let WeatherInput {
        location,
        current,
        daily,
        ai_insight,
    } = input;

    let time = format!("{} - {}", current.time, location.timezone);

    WeatherOutput {
        time,
        city: location.city,
        current: vec![round_current(current)],
        daily: daily.into_iter().map(round_daily).collect(),
        ai_insight,
    }
}

// Precipitation probability is passed through here; only daily entries are
// clamped.
fn round_current(current: CurrentConditions) -> CurrentConditions {
    CurrentConditions {
        temperature: round_whole(current.temperature),
        apparent_temperature: round_whole(current.apparent_temperature),
        uv: round_tenth(current.uv),
        ..current
    }
}

fn round_daily(day: DailyForecast) -> DailyForecast {
    DailyForecast {
        temperature_max: round_whole(day.temperature_max),
        temperature_min: round_whole(day.temperature_min),
        apparent_temperature_max: round_whole(day.apparent_temperature_max),
        apparent_temperature_min: round_whole(day.apparent_temperature_min),
        uv_index_max: round_tenth(day.uv_index_max),
        precipitation_probability: day.precipitation_probability.max(0),
        ..day
    }
}
