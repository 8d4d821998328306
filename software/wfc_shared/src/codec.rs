//! Comma-separated text encoding of measurement requests and setpoint replies.
//!
//! The format is asymmetric. Requests are plain comma-separated decimals in
//! measurement-schema order, possibly null-padded by the sender. Replies are
//! fixed-width decimals (at least 16 characters including the sign, with 5
//! fractional digits) in setpoint-schema order, joined with `", "`.
//!
//! Fields are untagged, so the schema is the only source of meaning. Field
//! counts are checked before any field is mapped to a channel name.

use thiserror::Error;

use crate::{ChannelMap, Schema, TurbineId, ID_CHANNEL};

/// Minimum rendered width of a setpoint field, including the sign
pub const FIELD_WIDTH: usize = 16;

/// Fractional digits of a rendered setpoint field
pub const FIELD_PRECISION: usize = 5;

/// Separator between setpoint fields in a reply
pub const REPLY_SEPARATOR: &str = ", ";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Message is not valid UTF-8")]
    NotUtf8,

    #[error("Expected {expected} fields but received {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("Field {index} (`{channel}`) is not a number: `{token}`")]
    InvalidNumber {
        index: usize,
        channel: String,
        token: String,
    },

    #[error("Message has no `{0}` channel")]
    MissingChannel(String),

    #[error("Turbine id {0} is not a positive integer")]
    InvalidId(f64),
}

/// Parse a measurement request into a map from measurement name to value.
pub fn decode_measurements(schema: &Schema, raw: &[u8]) -> Result<ChannelMap, DecodeError> {
    parse_fields(&schema.measurements, raw)
}

/// Render a full set of setpoints as a reply message.
/// Channels missing from `setpoints` are written as zero.
pub fn encode_setpoints(schema: &Schema, setpoints: &ChannelMap) -> String {
    schema
        .setpoints
        .iter()
        .map(|name| fmt_field(setpoints.get(name).copied().unwrap_or(0.0)))
        .collect::<Vec<String>>()
        .join(REPLY_SEPARATOR)
}

/// Render a measurement request the way a turbine client would.
/// Channels missing from `measurements` are written as zero.
pub fn encode_measurements(schema: &Schema, measurements: &ChannelMap) -> String {
    schema
        .measurements
        .iter()
        .map(|name| format!("{}", measurements.get(name).copied().unwrap_or(0.0)))
        .collect::<Vec<String>>()
        .join(",")
}

/// Parse a setpoint reply the way a turbine client would.
pub fn decode_setpoints(schema: &Schema, raw: &[u8]) -> Result<ChannelMap, DecodeError> {
    parse_fields(&schema.setpoints, raw)
}

/// Fixed-width rendering of a single setpoint value
pub fn fmt_field(value: f64) -> String {
    format!(
        "{value:0width$.precision$}",
        width = FIELD_WIDTH,
        precision = FIELD_PRECISION
    )
}

/// Extract the sender's turbine id from decoded measurements.
pub fn turbine_id(measurements: &ChannelMap) -> Result<TurbineId, DecodeError> {
    let raw = *measurements
        .get(ID_CHANNEL)
        .ok_or_else(|| DecodeError::MissingChannel(ID_CHANNEL.to_owned()))?;

    let valid = raw.is_finite() && raw >= 1.0 && raw.fract() == 0.0 && raw <= TurbineId::MAX as f64;
    if !valid {
        return Err(DecodeError::InvalidId(raw));
    }

    Ok(raw as TurbineId)
}

fn parse_fields(names: &[String], raw: &[u8]) -> Result<ChannelMap, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    let text = text.replace('\0', "");

    let tokens: Vec<&str> = text.split(',').collect();
    if tokens.len() != names.len() {
        return Err(DecodeError::FieldCount {
            expected: names.len(),
            found: tokens.len(),
        });
    }

    let mut out = ChannelMap::new();
    for (index, (name, token)) in names.iter().zip(tokens).enumerate() {
        let value = token
            .trim()
            .parse::<f64>()
            .map_err(|_| DecodeError::InvalidNumber {
                index,
                channel: name.clone(),
                token: token.to_owned(),
            })?;
        out.insert(name.clone(), value);
    }

    Ok(out)
}
