//! Inbound object-creation events
//!
//! Two notification shapes are recognized: the object store's own `Records`
//! envelope and the event-bus `Object Created` envelope. Everything else is
//! rejected up front with [`TransferError::InvalidEvent`].

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TransferError;

/// The one object this invocation moves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub store_name: String,
    pub object_key: String,
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundEvent {
    Notification {
        #[serde(rename = "Records")]
        records: Vec<NotificationRecord>,
    },
    EventBus {
        id: String,
        #[serde(rename = "detail-type")]
        detail_type: String,
        detail: EventBusDetail,
    },
}

#[derive(Debug, Deserialize)]
struct NotificationRecord {
    #[serde(rename = "eventName", default)]
    event_name: Option<String>,
    s3: NotificationEntity,
    #[serde(rename = "responseElements", default)]
    response_elements: Option<ResponseElements>,
}

#[derive(Debug, Deserialize)]
struct NotificationEntity {
    bucket: BucketRef,
    object: ObjectRef,
}

#[derive(Debug, Deserialize)]
struct ResponseElements {
    #[serde(rename = "x-amz-request-id", default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventBusDetail {
    bucket: BucketRef,
    object: ObjectRef,
}

#[derive(Debug, Deserialize)]
struct BucketRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    key: String,
    #[serde(default)]
    sequencer: Option<String>,
}

impl TransferEvent {
    /// Parse and validate an inbound notification
    pub fn parse(raw: &Value) -> Result<Self, TransferError> {
        let inbound: InboundEvent = serde_json::from_value(raw.clone()).map_err(|e| {
            TransferError::InvalidEvent(format!("unrecognized event shape: {}", e))
        })?;

        let event = match inbound {
            InboundEvent::Notification { mut records } => {
                if records.len() != 1 {
                    return Err(TransferError::InvalidEvent(format!(
                        "expected exactly one record, got {}",
                        records.len()
                    )));
                }
                let record = records.remove(0);

                if let Some(name) = &record.event_name {
                    if !name.starts_with("ObjectCreated:") {
                        return Err(TransferError::InvalidEvent(format!(
                            "not an object-creation event: {}",
                            name
                        )));
                    }
                }

                let object_key = decode_object_key(&record.s3.object.key)?;
                let event_id = record
                    .response_elements
                    .and_then(|r| r.request_id)
                    .or(record.s3.object.sequencer)
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

                TransferEvent {
                    store_name: record.s3.bucket.name,
                    object_key,
                    event_id,
                }
            }
            InboundEvent::EventBus {
                id,
                detail_type,
                detail,
            } => {
                if detail_type != "Object Created" {
                    return Err(TransferError::InvalidEvent(format!(
                        "not an object-creation event: {}",
                        detail_type
                    )));
                }
                // Event-bus keys arrive already decoded
                TransferEvent {
                    store_name: detail.bucket.name,
                    object_key: detail.object.key,
                    event_id: id,
                }
            }
        };

        if event.store_name.is_empty() {
            return Err(TransferError::InvalidEvent("empty bucket name".into()));
        }
        if event.object_key.is_empty() {
            return Err(TransferError::InvalidEvent("empty object key".into()));
        }

        Ok(event)
    }
}

/// Decode a notification object key (`+` is a space, then `%XX` escapes)
pub fn decode_object_key(raw: &str) -> Result<String, TransferError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| TransferError::InvalidEvent(format!("object key is not valid UTF-8: {}", e)))
}
