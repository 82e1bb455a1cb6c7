//! Integration Event Envelope codec
//!
//! Two-phase validation: `parse` turns a raw payload into a canonical
//! envelope, `validate_against_row` cross-checks the envelope fields against
//! the outbox row columns. The columns drive SQL routing while the payload
//! is the source of truth for business data, so any divergence is a fatal
//! error for that single event and is never silently repaired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::OutboxRecord;

/// Canonical in-memory/wire representation of an integration event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEventEnvelope {
    pub event_id: String,
    pub event_name: String,
    pub event_version: i32,
    pub tenant_id: String,
    pub partition_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub data: Value,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("payload is not a JSON object (got {found})")]
    NotAnObject { found: &'static str },

    #[error("missing required envelope field(s): {}", .fields.join(", "))]
    MissingFields { fields: Vec<String> },

    #[error("envelope field '{field}' has invalid type (expected {expected})")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("envelope data is not a JSON object")]
    NonObjectData,

    #[error(
        "inconsistent field '{field}': row has '{row_value}', payload has '{payload_value}'"
    )]
    FieldMismatch {
        field: &'static str,
        row_value: String,
        payload_value: String,
    },
}

const REQUIRED_FIELDS: [&str; 5] = [
    "eventId",
    "eventName",
    "eventVersion",
    "tenantId",
    "partitionKey",
];

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, EnvelopeError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(EnvelopeError::InvalidField {
            field,
            expected: "string",
        }),
        // Presence was already checked; unreachable in practice.
        None => Err(EnvelopeError::MissingFields {
            fields: vec![field.to_string()],
        }),
    }
}

fn optional_string(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, EnvelopeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(EnvelopeError::InvalidField {
            field,
            expected: "string",
        }),
    }
}

/// Parse a raw outbox payload into a canonical envelope.
///
/// Rejects non-object payloads and enumerates every missing required field
/// in one error rather than reporting only the first.
pub fn parse(raw: &Value) -> Result<IntegrationEventEnvelope, EnvelopeError> {
    let obj = raw.as_object().ok_or(EnvelopeError::NotAnObject {
        found: json_type_name(raw),
    })?;

    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|f| matches!(obj.get(**f), None | Some(Value::Null)))
        .map(|f| f.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(EnvelopeError::MissingFields { fields: missing });
    }

    let event_version = match obj.get("eventVersion") {
        Some(Value::Number(n)) => {
            n.as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or(EnvelopeError::InvalidField {
                    field: "eventVersion",
                    expected: "integer",
                })?
        }
        _ => {
            return Err(EnvelopeError::InvalidField {
                field: "eventVersion",
                expected: "integer",
            })
        }
    };

    let data = match obj.get("data") {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return Err(EnvelopeError::NonObjectData),
    };

    let occurred_at = match obj.get("occurredAt") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| EnvelopeError::InvalidField {
                    field: "occurredAt",
                    expected: "RFC 3339 timestamp",
                })?,
        ),
        Some(_) => {
            return Err(EnvelopeError::InvalidField {
                field: "occurredAt",
                expected: "RFC 3339 timestamp",
            })
        }
    };

    Ok(IntegrationEventEnvelope {
        event_id: required_string(obj, "eventId")?,
        event_name: required_string(obj, "eventName")?,
        event_version,
        tenant_id: required_string(obj, "tenantId")?,
        partition_key: required_string(obj, "partitionKey")?,
        actor_id: optional_string(obj, "actorId")?,
        request_id: optional_string(obj, "requestId")?,
        locale: optional_string(obj, "locale")?,
        occurred_at,
        data,
    })
}

/// Cross-check the five duplicated columns against the envelope, field by
/// field, failing fast on the first pair that disagrees.
pub fn validate_against_row(
    row: &OutboxRecord,
    envelope: &IntegrationEventEnvelope,
) -> Result<(), EnvelopeError> {
    let pairs: [(&'static str, &str, &str); 4] = [
        ("event_id", &row.event_id, &envelope.event_id),
        ("tenant_id", &row.tenant_id, &envelope.tenant_id),
        ("event_name", &row.event_name, &envelope.event_name),
        ("partition_key", &row.partition_key, &envelope.partition_key),
    ];
    for (field, row_value, payload_value) in pairs {
        if row_value != payload_value {
            return Err(EnvelopeError::FieldMismatch {
                field,
                row_value: row_value.to_string(),
                payload_value: payload_value.to_string(),
            });
        }
    }
    if row.event_version != envelope.event_version {
        return Err(EnvelopeError::FieldMismatch {
            field: "event_version",
            row_value: row.event_version.to_string(),
            payload_value: envelope.event_version.to_string(),
        });
    }
    Ok(())
}

/// `parse` followed by `validate_against_row` on the row's own payload.
pub fn parse_for_row(row: &OutboxRecord) -> Result<IntegrationEventEnvelope, EnvelopeError> {
    let envelope = parse(&row.payload)?;
    validate_against_row(row, &envelope)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutboxStatus;
    use serde_json::json;

    fn valid_payload() -> Value {
        json!({
            "eventId": "evt-1",
            "eventName": "invoice.created",
            "eventVersion": 2,
            "tenantId": "tenant-a",
            "partitionKey": "invoice-42",
            "actorId": "user-7",
            "requestId": "req-123",
            "occurredAt": "2026-03-01T12:00:00Z",
            "data": {"invoiceId": "42", "total": 1999}
        })
    }

    fn row_for(payload: Value) -> OutboxRecord {
        OutboxRecord {
            event_id: "evt-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            event_name: "invoice.created".to_string(),
            event_version: 2,
            partition_key: "invoice-42".to_string(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            occurred_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_valid_envelope() {
        let envelope = parse(&valid_payload()).unwrap();
        assert_eq!(envelope.event_id, "evt-1");
        assert_eq!(envelope.event_name, "invoice.created");
        assert_eq!(envelope.event_version, 2);
        assert_eq!(envelope.tenant_id, "tenant-a");
        assert_eq!(envelope.partition_key, "invoice-42");
        assert_eq!(envelope.actor_id, Some("user-7".to_string()));
        assert_eq!(envelope.data["invoiceId"], "42");
        assert!(envelope.occurred_at.is_some());
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let err = parse(&json!("not an object")).unwrap_err();
        assert_eq!(err, EnvelopeError::NotAnObject { found: "string" });

        let err = parse(&json!([1, 2, 3])).unwrap_err();
        assert_eq!(err, EnvelopeError::NotAnObject { found: "array" });
    }

    #[test]
    fn test_parse_enumerates_all_missing_fields() {
        let err = parse(&json!({"eventId": "evt-1", "eventVersion": 1})).unwrap_err();
        match err {
            EnvelopeError::MissingFields { fields } => {
                assert_eq!(fields, vec!["eventName", "tenantId", "partitionKey"]);
            }
            other => panic!("expected MissingFields, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_non_object_data() {
        let mut payload = valid_payload();
        payload["data"] = json!("scalar");
        assert_eq!(parse(&payload).unwrap_err(), EnvelopeError::NonObjectData);
    }

    #[test]
    fn test_parse_defaults_missing_data_to_empty_object() {
        let mut payload = valid_payload();
        payload.as_object_mut().unwrap().remove("data");
        let envelope = parse(&payload).unwrap();
        assert!(envelope.data.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_wrong_version_type() {
        let mut payload = valid_payload();
        payload["eventVersion"] = json!("2");
        assert_eq!(
            parse(&payload).unwrap_err(),
            EnvelopeError::InvalidField {
                field: "eventVersion",
                expected: "integer"
            }
        );
    }

    #[test]
    fn test_validate_against_row_accepts_consistent_row() {
        let row = row_for(valid_payload());
        let envelope = parse(&row.payload).unwrap();
        assert!(validate_against_row(&row, &envelope).is_ok());
    }

    #[test]
    fn test_validate_names_mismatched_pair() {
        let mut row = row_for(valid_payload());
        row.event_id = "evt-OTHER".to_string();
        let envelope = parse(&row.payload).unwrap();
        let err = validate_against_row(&row, &envelope).unwrap_err();
        match err {
            EnvelopeError::FieldMismatch {
                field,
                row_value,
                payload_value,
            } => {
                assert_eq!(field, "event_id");
                assert_eq!(row_value, "evt-OTHER");
                assert_eq!(payload_value, "evt-1");
            }
            other => panic!("expected FieldMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_catches_version_drift() {
        let mut row = row_for(valid_payload());
        row.event_version = 3;
        let envelope = parse(&row.payload).unwrap();
        let err = validate_against_row(&row, &envelope).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::FieldMismatch {
                field: "event_version",
                ..
            }
        ));
    }

    #[test]
    fn test_envelope_serializes_camel_case() {
        let envelope = parse(&valid_payload()).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("eventId").is_some());
        assert!(value.get("partitionKey").is_some());
        // Absent optionals stay off the wire
        assert!(value.get("locale").is_none());
    }
}
