use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::domain::models::RelayState;
use crate::domain::session_state::TimestampMs;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub device_id: String,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub timestamp: Option<TimestampMs>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Reading(DeviceReading),
    RelayAck {
        device_id: String,
        relay: RelayState,
        /// Echo of the `commandId` the ack answers; older firmware omits it.
        command_id: Option<u64>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("payload must be a JSON object")]
    InvalidPayloadType,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid relay state: {0}")]
    InvalidRelayState(String),
}

const DEVICE_KEYS: &[&str] = &["deviceId", "device_id", "device", "Serial"];
const VOLTAGE_KEYS: &[&str] = &["voltage", "U", "U1"];
const CURRENT_KEYS: &[&str] = &["current", "I", "I1"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "timestamp_ms", "ts"];
const ACK_KEYS: &[&str] = &["ack"];
const RELAY_KEYS: &[&str] = &["relay", "relayState", "state"];
const COMMAND_ID_KEYS: &[&str] = &["commandId", "command_id", "cmdId"];

pub fn parse_device_message(payload: &Value) -> Result<DeviceMessage, ParseError> {
    let object = payload.as_object().ok_or(ParseError::InvalidPayloadType)?;

    let device_id = find_value(object, DEVICE_KEYS)
        .and_then(value_to_text)
        .filter(|value| !value.is_empty())
        .ok_or(ParseError::MissingField("deviceId"))?;

    if find_value(object, ACK_KEYS).is_some() {
        let raw = find_value(object, RELAY_KEYS).ok_or(ParseError::MissingField("relay"))?;
        let text = value_to_text(raw).unwrap_or_default();
        let relay =
            RelayState::parse(&text).ok_or_else(|| ParseError::InvalidRelayState(text.clone()))?;
        let command_id = find_number(object, COMMAND_ID_KEYS)
            .filter(|value| value.is_finite() && *value >= 0.0 && value.fract() == 0.0)
            .map(|value| value as u64);
        return Ok(DeviceMessage::RelayAck {
            device_id,
            relay,
            command_id,
        });
    }

    let voltage = find_number(object, VOLTAGE_KEYS);
    let current = find_number(object, CURRENT_KEYS);
    if voltage.is_none() && current.is_none() {
        return Err(ParseError::MissingField("voltage|current"));
    }

    let timestamp = find_number(object, TIMESTAMP_KEYS)
        .filter(|value| value.is_finite() && *value >= 0.0)
        .map(|value| TimestampMs(value.floor() as i64));

    Ok(DeviceMessage::Reading(DeviceReading {
        device_id,
        voltage,
        current,
        timestamp,
    }))
}

/// Devices are expected to echo `commandId` in their ack.
pub fn relay_command_payload(device_id: &str, relay: RelayState, command_id: u64) -> Value {
    json!({
        "deviceId": device_id,
        "relay": relay.as_str(),
        "commandId": command_id,
    })
}

fn find_number(object: &Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    find_value(object, aliases).and_then(parse_f64)
}

fn find_value<'a>(object: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        if let Some(value) = object.get(*alias) {
            return Some(value);
        }
    }

    let normalized_aliases: Vec<String> =
        aliases.iter().map(|alias| normalize_key(alias)).collect();

    object.iter().find_map(|(key, value)| {
        let normalized_key = normalize_key(key);
        normalized_aliases
            .iter()
            .any(|alias| alias == &normalized_key)
            .then_some(value)
    })
}

fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|char| char.is_ascii_alphanumeric())
        .flat_map(|char| char.to_lowercase())
        .collect()
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn parse_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_f64_from_text(text),
        _ => None,
    }
}

/// Accepts unit suffixes and comma decimals, e.g. `"229,8 V"`.
fn parse_f64_from_text(text: &str) -> Option<f64> {
    let token: String = text
        .trim()
        .chars()
        .take_while(|char| char.is_ascii_digit() || matches!(char, ',' | '.' | '-' | '+'))
        .collect();
    if token.is_empty() {
        return None;
    }

    let normalized = if token.contains(',') && token.contains('.') {
        // Whichever separator comes last is the decimal point.
        if token.rfind(',') > token.rfind('.') {
            token.replace('.', "").replace(',', ".")
        } else {
            token.replace(',', "")
        }
    } else {
        token.replace(',', ".")
    };

    normalized.parse::<f64>().ok()
}
