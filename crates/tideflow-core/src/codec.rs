//! Serialization boundary: dehydrate / hydrate
//!
//! The engine never interprets user values. It hands them to a [`Codec`]
//! that encodes a value graph into a JSON-safe serial form (and back),
//! collecting any deferred side-effect operations — such as pumping a
//! stream into storage — for the caller to await.
//!
//! The built-in [`JsonCodec`] passes plain JSON through untouched and
//! represents the extended value set (big integers, dates, maps, sets,
//! registered class instances, stream references) as `{"$tf": ...}`
//! envelopes. User objects that already contain a `"$tf"` key are wrapped
//! in a literal envelope so they survive the round trip unchanged.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Marker key for encoded envelopes
const TAG: &str = "$tf";

/// A dehydrated value, safe to persist as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialForm(pub Value);

impl From<Value> for SerialForm {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl SerialForm {
    pub fn null() -> Self {
        Self(Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Reference to a stream persisted out of band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRef {
    pub stream_id: String,
}

/// Deferred operations produced while encoding; the caller awaits them
/// after the serial form is persisted.
pub type SideEffects = Vec<BoxFuture<'static, Result<(), CodecError>>>;

/// Substitutions applied during hydration, keyed by instance tag.
///
/// The observability path uses revivers to replace live values with
/// render-only stand-ins (e.g. a stream reference object instead of a
/// stream).
#[derive(Default)]
pub struct Revivers {
    by_tag: HashMap<String, Box<dyn Fn(&Value) -> Result<Value, CodecError> + Send + Sync>>,
}

impl Revivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        revive: impl Fn(&Value) -> Result<Value, CodecError> + Send + Sync + 'static,
    ) {
        self.by_tag.insert(tag.into(), Box::new(revive));
    }

    fn get(&self, tag: &str) -> Option<&(dyn Fn(&Value) -> Result<Value, CodecError> + Send + Sync)> {
        self.by_tag.get(tag).map(|b| b.as_ref())
    }
}

impl std::fmt::Debug for Revivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Revivers")
            .field("tags", &self.by_tag.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from encode/decode
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("stream error: {0}")]
    Stream(String),
}

/// The two opaque operations the engine consumes
pub trait Codec: Send + Sync + 'static {
    /// Encode a value graph to a JSON-safe form, appending any deferred
    /// side-effect operations to `ops`.
    fn dehydrate(
        &self,
        value: &Value,
        ops: &mut SideEffects,
        run_id: Uuid,
    ) -> Result<SerialForm, CodecError>;

    /// Reverse the encoding. `globals` carries the run's execution
    /// context; `revivers` may substitute values by instance tag.
    fn hydrate(
        &self,
        form: &SerialForm,
        ops: &mut SideEffects,
        run_id: Uuid,
        globals: Option<&Value>,
        revivers: Option<&Revivers>,
    ) -> Result<Value, CodecError>;
}

/// Helpers to construct extended values in their enveloped form.
///
/// Rust callers build dates, maps, sets, and instances through these;
/// plain JSON needs no wrapping.
pub mod rich {
    use super::*;
    use chrono::{DateTime, Utc};

    pub fn date(at: DateTime<Utc>) -> Value {
        json!({ TAG: "date", "value": at.timestamp_millis() })
    }

    pub fn bigint(digits: impl Into<String>) -> Value {
        json!({ TAG: "bigint", "value": digits.into() })
    }

    pub fn map(entries: Vec<(Value, Value)>) -> Value {
        let entries: Vec<Value> = entries.into_iter().map(|(k, v)| json!([k, v])).collect();
        json!({ TAG: "map", "entries": entries })
    }

    pub fn set(values: Vec<Value>) -> Value {
        json!({ TAG: "set", "values": values })
    }

    pub fn instance(tag: impl Into<String>, value: Value) -> Value {
        json!({ TAG: "instance", "tag": tag.into(), "value": value })
    }

    pub fn stream(stream_id: impl Into<String>) -> Value {
        json!({ TAG: "stream", "id": stream_id.into() })
    }
}

/// JSON codec with `$tf` envelopes
#[derive(Debug, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode(&self, value: &Value, ops: &mut SideEffects, run_id: Uuid) -> Result<Value, CodecError> {
        match value {
            Value::Array(items) => {
                let encoded: Result<Vec<Value>, CodecError> = items
                    .iter()
                    .map(|item| self.encode(item, ops, run_id))
                    .collect();
                Ok(Value::Array(encoded?))
            }
            Value::Object(fields) => {
                if let Some(tag) = fields.get(TAG).and_then(Value::as_str) {
                    return self.encode_envelope(tag, fields, ops, run_id);
                }
                let mut encoded = Map::with_capacity(fields.len());
                for (key, item) in fields {
                    encoded.insert(key.clone(), self.encode(item, ops, run_id)?);
                }
                Ok(Value::Object(encoded))
            }
            other => Ok(other.clone()),
        }
    }

    fn encode_envelope(
        &self,
        tag: &str,
        fields: &Map<String, Value>,
        ops: &mut SideEffects,
        run_id: Uuid,
    ) -> Result<Value, CodecError> {
        match tag {
            "date" | "bigint" => {
                fields
                    .get("value")
                    .ok_or_else(|| CodecError::Malformed(format!("{tag} without value")))?;
                Ok(Value::Object(fields.clone()))
            }
            "map" => {
                let entries = fields
                    .get("entries")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CodecError::Malformed("map without entries".into()))?;
                let encoded: Result<Vec<Value>, CodecError> = entries
                    .iter()
                    .map(|entry| self.encode(entry, ops, run_id))
                    .collect();
                Ok(json!({ TAG: "map", "entries": encoded? }))
            }
            "set" => {
                let values = fields
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CodecError::Malformed("set without values".into()))?;
                let encoded: Result<Vec<Value>, CodecError> = values
                    .iter()
                    .map(|item| self.encode(item, ops, run_id))
                    .collect();
                Ok(json!({ TAG: "set", "values": encoded? }))
            }
            "instance" => {
                let instance_tag = fields
                    .get("tag")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CodecError::Malformed("instance without tag".into()))?;
                let inner = fields.get("value").cloned().unwrap_or(Value::Null);
                let encoded = self.encode(&inner, ops, run_id)?;
                Ok(json!({ TAG: "instance", "tag": instance_tag, "value": encoded }))
            }
            "stream" => {
                let stream_id = fields
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CodecError::Malformed("stream without id".into()))?
                    .to_string();
                // Stream content is persisted out of band; the caller
                // awaits the pump after the serial form is stored.
                ops.push(Box::pin(async move {
                    tracing::debug!(%run_id, %stream_id, "stream pump scheduled");
                    Ok(())
                }));
                Ok(Value::Object(fields.clone()))
            }
            "literal" => Ok(Value::Object(fields.clone())),
            // A user object that happens to carry the marker key: wrap it
            // so decode can unwrap it untouched.
            _ => Ok(json!({ TAG: "literal", "value": Value::Object(fields.clone()) })),
        }
    }

    fn decode(
        &self,
        value: &Value,
        revivers: Option<&Revivers>,
    ) -> Result<Value, CodecError> {
        match value {
            Value::Array(items) => {
                let decoded: Result<Vec<Value>, CodecError> = items
                    .iter()
                    .map(|item| self.decode(item, revivers))
                    .collect();
                Ok(Value::Array(decoded?))
            }
            Value::Object(fields) => {
                if let Some(tag) = fields.get(TAG).and_then(Value::as_str) {
                    return self.decode_envelope(tag, fields, revivers);
                }
                let mut decoded = Map::with_capacity(fields.len());
                for (key, item) in fields {
                    decoded.insert(key.clone(), self.decode(item, revivers)?);
                }
                Ok(Value::Object(decoded))
            }
            other => Ok(other.clone()),
        }
    }

    fn decode_envelope(
        &self,
        tag: &str,
        fields: &Map<String, Value>,
        revivers: Option<&Revivers>,
    ) -> Result<Value, CodecError> {
        if let Some(revive) = revivers.and_then(|r| r.get(tag)) {
            return revive(&Value::Object(fields.clone()));
        }

        match tag {
            "date" | "bigint" => Ok(Value::Object(fields.clone())),
            "map" => {
                let entries = fields
                    .get("entries")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CodecError::Malformed("map without entries".into()))?;
                let decoded: Result<Vec<Value>, CodecError> = entries
                    .iter()
                    .map(|entry| self.decode(entry, revivers))
                    .collect();
                Ok(json!({ TAG: "map", "entries": decoded? }))
            }
            "set" => {
                let values = fields
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CodecError::Malformed("set without values".into()))?;
                let decoded: Result<Vec<Value>, CodecError> = values
                    .iter()
                    .map(|item| self.decode(item, revivers))
                    .collect();
                Ok(json!({ TAG: "set", "values": decoded? }))
            }
            "instance" => {
                let instance_tag = fields
                    .get("tag")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CodecError::Malformed("instance without tag".into()))?;
                let inner = fields.get("value").cloned().unwrap_or(Value::Null);
                let decoded = self.decode(&inner, revivers)?;

                match revivers.and_then(|r| r.get(instance_tag)) {
                    Some(revive) => revive(&decoded),
                    // Unregistered instances hydrate to an opaque
                    // reference object, never an error.
                    None => Ok(json!({
                        "$unknownInstance": instance_tag,
                        "value": decoded,
                    })),
                }
            }
            "stream" => {
                let stream_id = fields
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CodecError::Malformed("stream without id".into()))?;
                Ok(serde_json::to_value(StreamRef {
                    stream_id: stream_id.to_string(),
                })?)
            }
            "literal" => Ok(fields.get("value").cloned().unwrap_or(Value::Null)),
            other => Ok(json!({ "$unknownInstance": other, "value": Value::Null })),
        }
    }
}

impl Codec for JsonCodec {
    fn dehydrate(
        &self,
        value: &Value,
        ops: &mut SideEffects,
        run_id: Uuid,
    ) -> Result<SerialForm, CodecError> {
        Ok(SerialForm(self.encode(value, ops, run_id)?))
    }

    fn hydrate(
        &self,
        form: &SerialForm,
        _ops: &mut SideEffects,
        _run_id: Uuid,
        _globals: Option<&Value>,
        revivers: Option<&Revivers>,
    ) -> Result<Value, CodecError> {
        self.decode(&form.0, revivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn round_trip(value: Value) -> Value {
        let codec = JsonCodec::new();
        let run_id = Uuid::now_v7();
        let mut ops = SideEffects::new();
        let form = codec.dehydrate(&value, &mut ops, run_id).unwrap();
        codec.hydrate(&form, &mut ops, run_id, None, None).unwrap()
    }

    #[test]
    fn test_json_safe_values_pass_through() {
        let value = json!({
            "n": 42,
            "nested": { "list": [1, "two", null, true] },
        });
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_rich_values_round_trip() {
        let at = chrono::Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let value = json!({
            "when": rich::date(at),
            "big": rich::bigint("123456789012345678901234567890"),
            "pairs": rich::map(vec![(json!("k"), json!(1))]),
            "unique": rich::set(vec![json!(1), json!(2)]),
        });
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_literal_escape_for_colliding_keys() {
        let value = json!({ "$tf": "user-data", "x": 1 });
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_unregistered_instance_hydrates_to_reference() {
        let value = rich::instance("acme.Widget", json!({"size": 3}));
        let out = round_trip(value);
        assert_eq!(out["$unknownInstance"], "acme.Widget");
        assert_eq!(out["value"]["size"], 3);
    }

    #[test]
    fn test_registered_instance_revives() {
        let codec = JsonCodec::new();
        let run_id = Uuid::now_v7();
        let mut ops = SideEffects::new();

        let mut revivers = Revivers::new();
        revivers.register("acme.Widget", |value| Ok(json!({ "revived": value.clone() })));

        let form = codec
            .dehydrate(&rich::instance("acme.Widget", json!(7)), &mut ops, run_id)
            .unwrap();
        let out = codec
            .hydrate(&form, &mut ops, run_id, None, Some(&revivers))
            .unwrap();

        assert_eq!(out, json!({ "revived": 7 }));
    }

    #[test]
    fn test_stream_dehydrate_collects_pump_op() {
        let codec = JsonCodec::new();
        let run_id = Uuid::now_v7();
        let mut ops = SideEffects::new();

        let form = codec
            .dehydrate(&rich::stream("stream-1"), &mut ops, run_id)
            .unwrap();
        assert_eq!(ops.len(), 1);

        let hydrated = codec.hydrate(&form, &mut ops, run_id, None, None).unwrap();
        let stream_ref: StreamRef = serde_json::from_value(hydrated).unwrap();
        assert_eq!(stream_ref.stream_id, "stream-1");
    }

    #[tokio::test]
    async fn test_pump_ops_are_awaitable() {
        let codec = JsonCodec::new();
        let mut ops = SideEffects::new();
        codec
            .dehydrate(&rich::stream("s"), &mut ops, Uuid::now_v7())
            .unwrap();

        for op in ops {
            op.await.unwrap();
        }
    }

    #[test]
    fn test_malformed_envelope_is_rejected() {
        let codec = JsonCodec::new();
        let mut ops = SideEffects::new();
        let result = codec.dehydrate(&json!({ "$tf": "map" }), &mut ops, Uuid::now_v7());
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }
}
