//! Wire format of the active-heartbeat and listeners payloads.
//!
//! A record is UTF-8 text with exactly two fields joined by
//! [`FIELD_DELIMITER`]: the master id and the timestamp as a decimal integer
//! of milliseconds, e.g. `tm-1;1700000000000`.

use crate::{ActiveRecord, MasterId, Result, TimeMasterError};
use bytes::Bytes;

/// Reserved separator; never allowed inside a field.
pub const FIELD_DELIMITER: char = ';';

/// Content of the notification flag node. Never inspected.
pub const FLAG_SENTINEL: &[u8] = b"0";

/// Encodes a record into its payload.
///
/// Fails when the id is empty or contains the delimiter, because the result
/// could not be decoded back into the same record.
///
/// # Examples
///
/// ```rust
/// use timemaster_core::{codec, ActiveRecord, MasterId};
///
/// let record = ActiveRecord::new(MasterId::new("m1"), 1500);
/// let payload = codec::encode(&record).unwrap();
/// assert_eq!(&payload[..], b"m1;1500");
/// assert_eq!(codec::decode(&payload).unwrap(), record);
/// ```
pub fn encode(record: &ActiveRecord) -> Result<Bytes> {
    let id = record.master_id.as_str();
    if id.is_empty() {
        return Err(TimeMasterError::codec("master id is empty"));
    }
    if id.contains(FIELD_DELIMITER) {
        return Err(TimeMasterError::codec(format!(
            "master id {id:?} contains the reserved delimiter {FIELD_DELIMITER:?}"
        )));
    }

    Ok(Bytes::from(format!(
        "{}{}{}",
        id, FIELD_DELIMITER, record.timestamp
    )))
}

/// Decodes a payload with a strict split on the delimiter.
pub fn decode(payload: &[u8]) -> Result<ActiveRecord> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| TimeMasterError::codec(format!("payload is not UTF-8: {e}")))?;

    let mut fields = text.split(FIELD_DELIMITER);
    let (id, timestamp) = match (fields.next(), fields.next(), fields.next()) {
        (Some(id), Some(timestamp), None) => (id, timestamp),
        _ => {
            return Err(TimeMasterError::codec(format!(
                "expected exactly two fields in {text:?}"
            )))
        }
    };

    if id.is_empty() {
        return Err(TimeMasterError::codec("master id is empty"));
    }

    let timestamp = timestamp.parse::<i64>().map_err(|e| {
        TimeMasterError::codec(format!("timestamp {timestamp:?} is not an integer: {e}"))
    })?;

    Ok(ActiveRecord::new(MasterId::new(id), timestamp))
}
