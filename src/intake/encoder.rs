use std::io::Write;

use flate2::{Compression, write::GzEncoder};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::intake::{
    EventKind,
    truncate::{self, TruncationLimits},
};

/// Stand-in for a record that cannot be represented as JSON.
pub const UNSERIALIZABLE_PLACEHOLDER: &str = "[Circular]";

/// Converts any serializable record into a JSON tree, never failing.
pub fn to_record<T: Serialize + ?Sized>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or_else(|e| {
        debug!("INTAKE | Unable to serialize record, using placeholder: {e}");
        Value::String(UNSERIALIZABLE_PLACEHOLDER.to_string())
    })
}

/// Applies the field limits for `kind` to `record` in place.
pub fn truncate(kind: EventKind, record: &mut Value, limits: &TruncationLimits) {
    match kind {
        EventKind::Metadata => truncate::truncate_metadata(record, limits),
        EventKind::Transaction => truncate::truncate_transaction(record, limits),
        EventKind::Span => truncate::truncate_span(record, limits),
        EventKind::Error => truncate::truncate_error(record, limits),
        EventKind::Metricset => truncate::truncate_metricset(record, limits),
    }
}

/// Encodes one record as a newline terminated ndjson line:
/// `{"<kind>":<record>}\n`.
#[must_use]
pub fn encode(kind: EventKind, mut record: Value, limits: &TruncationLimits) -> Vec<u8> {
    truncate(kind, &mut record, limits);

    let mut envelope = Map::with_capacity(1);
    envelope.insert(kind.as_str().to_string(), record);
    let mut line = serde_json::to_vec(&envelope).unwrap_or_else(|e| {
        debug!("INTAKE | Unable to encode {kind}, using placeholder: {e}");
        format!("{{\"{kind}\":\"{UNSERIALIZABLE_PLACEHOLDER}\"}}").into_bytes()
    });
    line.push(b'\n');
    line
}

/// Gzips an ndjson payload for the intake endpoint.
pub fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 4), Compression::fast());
    encoder.write_all(payload)?;
    encoder.finish()
}
