//! Transport envelope unpacking: queue batches in, ordered run-end events out.

use std::path::Path;

use duels_core::RunEndEvent;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "duels-ingest";

/// One delivery from the queue: a list of envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportBatch {
    #[serde(rename = "Records", default, deserialize_with = "lenient_envelopes")]
    pub records: Vec<Envelope>,
}

/// Queue envelope whose `body` holds a JSON array of notification wrappers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub body: Option<String>,
}

impl Envelope {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
        }
    }
}

/// Keeps one entry per record so indices line up; a record that is not an
/// object with a string `body` becomes a bodiless envelope.
fn lenient_envelopes<'de, D>(deserializer: D) -> Result<Vec<Envelope>, D::Error>
where
    D: Deserializer<'de>,
{
    let records = Option::<Vec<JsonValue>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| match record.get("body") {
            Some(JsonValue::String(body)) => Envelope::new(body.as_str()),
            Some(JsonValue::Null) | None if record.is_object() => Envelope::default(),
            other => {
                tracing::debug!(envelope = idx, body = ?other, "record is not a queue envelope");
                Envelope::default()
            }
        })
        .collect())
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading batch {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("batch is not a valid transport payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decodes the outer batch. Only the outer shape is strict; every record inside is best-effort.
pub fn parse_batch(bytes: &[u8]) -> Result<TransportBatch, IngestError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn load_batch_file(path: impl AsRef<Path>) -> Result<TransportBatch, IngestError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_batch(&bytes)
}

/// Flattens every envelope into run-end events, preserving order and dropping anything malformed.
pub fn unpack_batch(batch: &TransportBatch) -> Vec<RunEndEvent> {
    let events = batch
        .records
        .iter()
        .enumerate()
        .flat_map(|(idx, envelope)| unpack_envelope(idx, envelope))
        .collect::<Vec<_>>();
    tracing::debug!(
        envelopes = batch.records.len(),
        events = events.len(),
        "unpacked transport batch"
    );
    events
}

fn unpack_envelope(idx: usize, envelope: &Envelope) -> Vec<RunEndEvent> {
    let Some(body) = envelope.body.as_deref().filter(|b| !b.trim().is_empty()) else {
        tracing::debug!(envelope = idx, "dropping envelope without body");
        return Vec::new();
    };
    let wrappers = match serde_json::from_str::<JsonValue>(body) {
        Ok(JsonValue::Array(items)) => items,
        Ok(JsonValue::Null) => Vec::new(),
        Ok(single) => vec![single],
        Err(err) => {
            tracing::debug!(envelope = idx, %err, "dropping envelope with unparseable body");
            return Vec::new();
        }
    };
    wrappers.iter().filter_map(unpack_wrapper).collect()
}

fn unpack_wrapper(wrapper: &JsonValue) -> Option<RunEndEvent> {
    let message = wrapper
        .get("Message")
        .and_then(JsonValue::as_str)
        .filter(|m| !m.trim().is_empty())?;
    match serde_json::from_str::<RunEndEvent>(message) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::debug!(%err, "dropping unparseable notification message");
            None
        }
    }
}
