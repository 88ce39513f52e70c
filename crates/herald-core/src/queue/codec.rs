//! Wire format for envelopes and result records.
//!
//! Everything a transport stores is JSON, so producer and worker processes
//! built from different revisions can still read each other's records as long
//! as the field names agree.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TransportError;

pub fn encode<T: Serialize>(value: &T) -> Result<String, TransportError> {
    Ok(serde_json::to_string(value)?)
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, TransportError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskEnvelope, TaskId, TaskName};
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    #[test]
    fn envelope_wire_fields() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ulid = Ulid::new();
        let env = TaskEnvelope::new(
            TaskId::from_ulid(ulid),
            TaskName::new("notification_tasks.send_notification"),
            serde_json::json!({"message": "hi"}),
            3,
            now,
        );

        let raw = encode(&env).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(json["task_id"], ulid.to_string());
        assert_eq!(json["task_name"], "notification_tasks.send_notification");
        assert_eq!(json["payload"]["message"], "hi");
        assert_eq!(json["attempt"], 0);
        assert_eq!(json["max_attempts"], 3);
        assert_eq!(json["state"], "queued");
        assert!(json.get("last_error").is_none());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = decode::<TaskEnvelope>("{not json").unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }
}
