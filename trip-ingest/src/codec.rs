use base64::Engine as _;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use trip_common::attributes::{coerce_value, quote_non_finite_literals, Attributes};
use trip_common::trip::{Phase, RawTripEvent};

/// One entry as delivered by the ingestion stream.
/// `data` holds the base64 text of a JSON object describing half a trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEntry {
    pub partition_key: Option<String>,
    pub data: Option<String>,
}

impl StreamEntry {
    /// Build an entry the way producers do: base64 over the JSON text.
    pub fn encode(partition_key: &str, payload: &str) -> Self {
        Self {
            partition_key: Some(partition_key.to_owned()),
            data: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
        }
    }
}

/// Why an entry could not be turned into a raw trip event.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed entry: {0}")]
    Malformed(String),
    #[error("entry is missing required field {0}")]
    MissingField(&'static str),
}

impl DecodeError {
    /// Label used on metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::MissingField(_) => "missing_field",
        }
    }
}

/// Decode one stream entry into a raw trip event.
///
/// Attributes that cannot be stored are dropped with a warning, the rest of the record is
/// kept. `ingestion_timestamp` is stamped as-is, which keeps this function deterministic.
pub fn decode(entry: &StreamEntry, ingestion_timestamp: &str) -> Result<RawTripEvent, DecodeError> {
    let payload = decode_payload(entry)?;

    let trip_id = extract_trip_id(&payload)?;

    let phase: Phase = match payload.get("data_type").and_then(Value::as_str) {
        Some(tag) => tag.parse().map_err(|_| {
            warn!(trip_id = %trip_id, data_type = tag, "unrecognized data_type");
            DecodeError::MissingField("data_type")
        })?,
        None => return Err(DecodeError::MissingField("data_type")),
    };

    let event_timestamp = payload
        .get(phase.timestamp_field())
        .and_then(scalar_text)
        .filter(|timestamp| !timestamp.is_empty())
        .ok_or(DecodeError::MissingField(phase.timestamp_field()))?;

    let mut attributes = Attributes::new();
    for (name, value) in payload.iter() {
        if name == "trip_id" || name == "data_type" {
            continue;
        }

        match coerce_value(value) {
            Ok(attribute) => {
                attributes.insert(name.clone(), attribute);
            }
            Err(warning) => {
                metrics::counter!("trip_ingest_attributes_dropped_total").increment(1);
                warn!(trip_id = %trip_id, attribute = %name, "dropping attribute: {}", warning);
            }
        }
    }

    Ok(RawTripEvent {
        trip_id,
        phase,
        event_timestamp,
        attributes,
        ingestion_timestamp: ingestion_timestamp.to_owned(),
    })
}

fn decode_payload(entry: &StreamEntry) -> Result<Map<String, Value>, DecodeError> {
    let data = entry
        .data
        .as_deref()
        .ok_or_else(|| DecodeError::Malformed("entry carries no data".to_owned()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::Malformed(format!("invalid base64: {}", e)))?;

    let text = String::from_utf8(bytes)
        .map_err(|e| DecodeError::Malformed(format!("invalid utf-8: {}", e)))?;

    match serde_json::from_str::<Value>(&quote_non_finite_literals(&text)) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DecodeError::Malformed(
            "payload is not a JSON object".to_owned(),
        )),
        Err(e) => Err(DecodeError::Malformed(format!("invalid JSON: {}", e))),
    }
}

fn extract_trip_id(payload: &Map<String, Value>) -> Result<String, DecodeError> {
    payload
        .get("trip_id")
        .and_then(scalar_text)
        .filter(|trip_id| !trip_id.is_empty())
        .ok_or(DecodeError::MissingField("trip_id"))
}

/// Text of a string or number, the only shapes accepted for key fields.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
