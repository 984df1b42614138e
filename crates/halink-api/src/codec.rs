//! Message codec for the upstream WebSocket protocol.
//!
//! Every frame exchanged with the backend is a JSON text frame. Outbound
//! traffic is either the one-off `auth` message or a command envelope
//! `{ "id": N, "type": <command>, ...params }`. Inbound traffic is decoded
//! into [`Inbound`]: handshake replies, correlated responses (anything
//! carrying an `id` that is not an event), and pushed events.
//!
//! Events are parsed once into an [`EventEnvelope`] whose [`EventHeader`]
//! carries the fields filters look at, so fan-out never re-reads the
//! payload per consumer.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Category name that subscribes to every event type.
pub const ALL_EVENTS: &str = "*";

/// Bodies longer than this are truncated in decode errors.
const MAX_ERROR_BODY: usize = 512;

// ── Category ─────────────────────────────────────────────────────────

/// Coarse-grained event classification used for subscribe/unsubscribe,
/// i.e. the backend's `event_type` (`"state_changed"`, `"call_service"`).
///
/// The special category `*` stands for all event types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Every event type.
    pub fn all() -> Self {
        Self(ALL_EVENTS.into())
    }

    /// Entity state changes, by far the most common interest.
    pub fn state_changed() -> Self {
        Self("state_changed".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_all(&self) -> bool {
        self.0 == ALL_EVENTS
    }

    /// Whether an event of `event_type` falls under this category.
    pub fn covers(&self, event_type: &str) -> bool {
        self.is_all() || self.0 == event_type
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

/// A command for the backend. `kind` becomes the envelope's `type`;
/// the `id` is assigned at send time by the request correlator.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    kind: String,
    params: Map<String, Value>,
}

impl Request {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter. `id` and `type` are reserved and always
    /// overwritten by the envelope.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Liveness probe; the backend replies with `{"type": "pong"}`.
    pub fn ping() -> Self {
        Self::new("ping")
    }

    /// Subscribe to a category. `*` subscribes without an `event_type`.
    pub fn subscribe_events(category: &Category) -> Self {
        let request = Self::new("subscribe_events");
        if category.is_all() {
            request
        } else {
            request.with("event_type", category.as_str())
        }
    }

    /// Cancel the subscription created by request `subscription`.
    pub fn unsubscribe_events(subscription: u64) -> Self {
        Self::new("unsubscribe_events").with("subscription", subscription)
    }

    /// Build a request from a free-form JSON object such as
    /// `{"type": "get_states"}`.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Object(mut params) = value else {
            return Err(Error::InvalidRequest {
                message: "request payload must be a JSON object".into(),
            });
        };

        if params.contains_key("id") {
            return Err(Error::InvalidRequest {
                message: "request payload must not carry an id; ids are assigned per connection"
                    .into(),
            });
        }

        let kind = match params.remove("type") {
            Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
            Some(_) => {
                return Err(Error::InvalidRequest {
                    message: "request `type` must be a non-empty string".into(),
                });
            }
            None => {
                return Err(Error::InvalidRequest {
                    message: "request payload is missing `type`".into(),
                });
            }
        };

        Ok(Self { kind, params })
    }
}

#[derive(Serialize)]
struct AuthMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    access_token: &'a str,
}

/// Encode the handshake credential message.
pub fn encode_auth(token: &str) -> Result<String, Error> {
    serde_json::to_string(&AuthMessage {
        kind: "auth",
        access_token: token,
    })
    .map_err(Error::Encode)
}

/// Encode a command envelope with its correlation id.
pub fn encode_request(id: u64, request: &Request) -> Result<String, Error> {
    let mut envelope = request.params.clone();
    envelope.insert("id".into(), Value::from(id));
    envelope.insert("type".into(), Value::String(request.kind.clone()));
    serde_json::to_string(&Value::Object(envelope)).map_err(Error::Encode)
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Structured error attached to a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamError {
    pub code: String,
    pub message: String,
}

/// A correlated reply to a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    pub result: Value,
    pub error: Option<UpstreamError>,
}

/// One decoded inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    AuthRequired { ha_version: Option<String> },
    AuthOk { ha_version: Option<String> },
    AuthInvalid { message: String },
    Response(Response),
    Event(EventEnvelope),
}

/// Normalized view of an event used for filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventHeader {
    pub event_type: String,
    /// `data.entity_id`, when the event concerns a single entity.
    pub entity_id: Option<String>,
    /// Entity domain (`light` for `light.kitchen`), or `data.domain`.
    pub domain: Option<String>,
    pub time_fired: Option<String>,
}

/// A parsed upstream push.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Id of the upstream subscription that produced this event, if the
    /// backend tagged it.
    pub subscription: Option<u64>,
    pub category: Category,
    pub header: EventHeader,
    /// The raw `event` object (`event_type`, `data`, `origin`, ...).
    pub payload: Arc<Value>,
    pub received_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// The event's `data` object, or `Null`.
    pub fn data(&self) -> &Value {
        self.payload.get("data").unwrap_or(&Value::Null)
    }
}

/// Decode one text frame. A frame holding a JSON array is a batch of
/// coalesced messages; each element decodes independently so one bad
/// element does not take its siblings down with it.
pub fn decode_frame(text: &str) -> Vec<Result<Inbound, Error>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items.into_iter().map(decode_value).collect(),
        Ok(value) => vec![decode_value(value)],
        Err(e) => vec![Err(Error::Deserialization {
            message: e.to_string(),
            body: truncate(text),
        })],
    }
}

/// Decode one message object.
pub fn decode_value(value: Value) -> Result<Inbound, Error> {
    let Value::Object(mut obj) = value else {
        return Err(malformed("message is not a JSON object", &value));
    };

    let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);

    match kind.as_deref() {
        Some("auth_required") => Ok(Inbound::AuthRequired {
            ha_version: string_field(&obj, "ha_version"),
        }),
        Some("auth_ok") => Ok(Inbound::AuthOk {
            ha_version: string_field(&obj, "ha_version"),
        }),
        Some("auth_invalid") => Ok(Inbound::AuthInvalid {
            message: string_field(&obj, "message").unwrap_or_else(|| "invalid access token".into()),
        }),
        Some("event") => decode_event(&mut obj),
        other => decode_response(&mut obj, other),
    }
}

fn decode_response(obj: &mut Map<String, Value>, kind: Option<&str>) -> Result<Inbound, Error> {
    let Some(id) = obj.get("id").and_then(Value::as_u64) else {
        return Err(malformed(
            "message has neither a known type nor a numeric id",
            &Value::Object(obj.clone()),
        ));
    };

    let success = match (obj.get("success").and_then(Value::as_bool), kind) {
        (Some(success), _) => success,
        (None, Some("pong")) => true,
        (None, _) => {
            return Err(malformed(
                "response is missing `success`",
                &Value::Object(obj.clone()),
            ));
        }
    };

    let error = obj.get("error").map(upstream_error);
    let result = obj.remove("result").unwrap_or(Value::Null);

    Ok(Inbound::Response(Response {
        id,
        success,
        result,
        error,
    }))
}

fn decode_event(obj: &mut Map<String, Value>) -> Result<Inbound, Error> {
    let subscription = obj.get("id").and_then(Value::as_u64);

    let event = match obj.remove("event") {
        Some(event @ Value::Object(_)) => event,
        _ => {
            return Err(malformed(
                "event message is missing its `event` object",
                &Value::Object(obj.clone()),
            ));
        }
    };

    let Some(event_type) = event.get("event_type").and_then(Value::as_str) else {
        return Err(malformed("event is missing `event_type`", &event));
    };
    let event_type = event_type.to_owned();

    let data = event.get("data");
    let entity_id = data
        .and_then(|d| d.get("entity_id"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let domain = entity_id
        .as_deref()
        .and_then(|id| id.split_once('.'))
        .map(|(domain, _)| domain.to_owned())
        .or_else(|| {
            data.and_then(|d| d.get("domain"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        });
    let time_fired = event
        .get("time_fired")
        .and_then(Value::as_str)
        .map(str::to_owned);

    Ok(Inbound::Event(EventEnvelope {
        subscription,
        category: Category::new(event_type.clone()),
        header: EventHeader {
            event_type,
            entity_id,
            domain,
            time_fired,
        },
        payload: Arc::new(event),
        received_at: Utc::now(),
    }))
}

fn upstream_error(value: &Value) -> UpstreamError {
    let code = match value.get("code") {
        Some(Value::String(code)) => code.clone(),
        Some(Value::Number(code)) => code.to_string(),
        _ => "unknown_error".into(),
    };
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message")
        .to_owned();
    UpstreamError { code, message }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn malformed(message: &str, value: &Value) -> Error {
    Error::Deserialization {
        message: message.to_owned(),
        body: truncate(&value.to_string()),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn decode_one(text: &str) -> Inbound {
        let mut decoded = decode_frame(text);
        assert_eq!(decoded.len(), 1);
        decoded.remove(0).unwrap()
    }

    #[test]
    fn auth_message_uses_access_token() {
        let text = encode_auth("s3cret").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "type": "auth", "access_token": "s3cret" }));
    }

    #[test]
    fn request_envelope_carries_id_and_type() {
        let request = Request::new("call_service")
            .with("domain", "light")
            .with("service", "turn_on");
        let value: Value = serde_json::from_str(&encode_request(7, &request).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "id": 7, "type": "call_service", "domain": "light", "service": "turn_on" })
        );
    }

    #[test]
    fn reserved_params_cannot_override_envelope() {
        let request = Request::new("ping").with("id", 99).with("type", "evil");
        let value: Value = serde_json::from_str(&encode_request(3, &request).unwrap()).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["type"], "ping");
    }

    #[test]
    fn subscribe_all_omits_event_type() {
        let all = Request::subscribe_events(&Category::all());
        assert!(all.params().is_empty());

        let state = Request::subscribe_events(&Category::state_changed());
        assert_eq!(state.params()["event_type"], "state_changed");
    }

    #[test]
    fn request_from_value_validates_shape() {
        let request = Request::from_value(json!({ "type": "get_states" })).unwrap();
        assert_eq!(request.kind(), "get_states");
        assert!(request.params().is_empty());

        assert!(Request::from_value(json!("ping")).is_err());
        assert!(Request::from_value(json!({ "domain": "light" })).is_err());
        assert!(Request::from_value(json!({ "type": "" })).is_err());
        assert!(Request::from_value(json!({ "type": "ping", "id": 4 })).is_err());
    }

    #[test]
    fn decode_successful_response() {
        let inbound = decode_one(r#"{"id": 4, "type": "result", "success": true, "result": {"a": 1}}"#);
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert_eq!(response.id, 4);
        assert!(response.success);
        assert_eq!(response.result, json!({ "a": 1 }));
        assert!(response.error.is_none());
    }

    #[test]
    fn decode_failed_response_without_type() {
        let inbound = decode_one(
            r#"{"id": 5, "success": false, "error": {"code": "unknown_command", "message": "Unknown command."}}"#,
        );
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert!(!response.success);
        assert_eq!(response.result, Value::Null);
        assert_eq!(
            response.error,
            Some(UpstreamError {
                code: "unknown_command".into(),
                message: "Unknown command.".into(),
            })
        );
    }

    #[test]
    fn decode_pong_as_success() {
        let Inbound::Response(response) = decode_one(r#"{"id": 9, "type": "pong"}"#) else {
            panic!("expected response");
        };
        assert_eq!(response.id, 9);
        assert!(response.success);
    }

    #[test]
    fn decode_event_builds_header() {
        let text = json!({
            "id": 2,
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "time_fired": "2026-10-19T10:00:00+00:00",
                "data": {
                    "entity_id": "light.kitchen",
                    "new_state": { "state": "on" }
                }
            }
        })
        .to_string();

        let Inbound::Event(event) = decode_one(&text) else {
            panic!("expected event");
        };
        assert_eq!(event.subscription, Some(2));
        assert_eq!(event.category, Category::state_changed());
        assert_eq!(
            event.header,
            EventHeader {
                event_type: "state_changed".into(),
                entity_id: Some("light.kitchen".into()),
                domain: Some("light".into()),
                time_fired: Some("2026-10-19T10:00:00+00:00".into()),
            }
        );
        assert_eq!(event.data()["new_state"]["state"], "on");
    }

    #[test]
    fn decode_event_without_entity_uses_data_domain() {
        let text = json!({
            "type": "event",
            "event": {
                "event_type": "call_service",
                "data": { "domain": "light", "service": "turn_on" }
            }
        })
        .to_string();

        let Inbound::Event(event) = decode_one(&text) else {
            panic!("expected event");
        };
        assert_eq!(event.subscription, None);
        assert_eq!(event.header.entity_id, None);
        assert_eq!(event.header.domain.as_deref(), Some("light"));
    }

    #[test]
    fn decode_auth_messages() {
        assert!(matches!(
            decode_one(r#"{"type": "auth_required", "ha_version": "2026.10.1"}"#),
            Inbound::AuthRequired { ha_version: Some(v) } if v == "2026.10.1"
        ));
        assert!(matches!(
            decode_one(r#"{"type": "auth_ok"}"#),
            Inbound::AuthOk { ha_version: None }
        ));
        assert!(matches!(
            decode_one(r#"{"type": "auth_invalid"}"#),
            Inbound::AuthInvalid { message } if message == "invalid access token"
        ));
    }

    #[test]
    fn coalesced_batch_keeps_good_siblings() {
        let text = r#"[
            {"id": 1, "type": "result", "success": true, "result": null},
            {"type": "event"},
            {"id": 2, "type": "pong"}
        ]"#;
        let decoded = decode_frame(text);
        assert_eq!(decoded.len(), 3);
        assert!(decoded[0].is_ok());
        assert!(matches!(decoded[1], Err(Error::Deserialization { .. })));
        assert!(decoded[2].is_ok());
    }

    #[test]
    fn malformed_frames_are_errors_not_panics() {
        for text in ["not json", "42", r#"{"type": "result"}"#, r#"{"id": 1}"#] {
            let decoded = decode_frame(text);
            assert_eq!(decoded.len(), 1, "{text}");
            assert!(decoded[0].is_err(), "{text} should fail to decode");
        }
    }

    #[test]
    fn category_covers() {
        assert!(Category::all().covers("anything"));
        assert!(Category::state_changed().covers("state_changed"));
        assert!(!Category::state_changed().covers("call_service"));
    }
}
