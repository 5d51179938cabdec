// src/envelope.rs

//! Wire envelope.
//!
//! Every broker message carries exactly one [`Envelope`], encoded as a single
//! JSON object with three mandatory fields:
//!
//! ```json
//! {
//!   "correlation_id": "9f1c7c1e-6c1e-4f43-9a59-8e2f3c2b8d11",
//!   "type_tag": "example.query.ExampleQuery",
//!   "parameters": { "parameter_one": "x", "parameter_two": "y" }
//! }
//! ```
//!
//! Field order is irrelevant on decode; unknown fields are rejected.
//!
//! The envelope is opaque to brokers. Buses build it with [`Envelope::encode`]
//! at send time, transmit [`Envelope::serialize`]d bytes, and on the receiving
//! side parse it with [`Envelope::decode`] and rebuild the typed value through
//! the [`TypeRegistry`](crate::TypeRegistry).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    // ---
    BusError,
    CorrelationId,
    Message,
    Result,
    TypeTag,
};

/// Ordered map of field name to JSON value.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// One request or response on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    // ---
    correlation_id: CorrelationId,
    type_tag: TypeTag,
    parameters: Parameters,
}

impl Envelope {
    /// Wrap a message.
    ///
    /// Pass the original request's id when encoding a reply; otherwise a
    /// fresh id is generated.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidParameters`] if the message does not
    /// serialize to a JSON object.
    pub fn encode<M: Message>(message: &M, correlation_id: Option<CorrelationId>) -> Result<Self> {
        // ---
        let parameters = match serde_json::to_value(message)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(BusError::InvalidParameters(format!(
                    "`{}` serialized to {} instead of an object",
                    M::TYPE_TAG,
                    json_kind(&other)
                )))
            }
        };

        Ok(Self {
            correlation_id: correlation_id.unwrap_or_else(CorrelationId::generate),
            type_tag: M::type_tag(),
            parameters,
        })
    }

    /// Parse an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MalformedEnvelope`] on invalid JSON, a missing or
    /// unexpected field, or a field of the wrong shape.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // ---
        serde_json::from_slice(bytes).map_err(|e| BusError::MalformedEnvelope(e.to_string()))
    }

    /// Encode to the textual wire format.
    pub fn serialize(&self) -> Result<Bytes> {
        // ---
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Rebuild a concrete message directly, bypassing the registry.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TypeMismatch`] if the envelope carries a different
    /// tag, or [`BusError::InvalidParameters`] if the parameters do not fit `M`.
    pub fn to_message<M: Message>(&self) -> Result<M> {
        // ---
        if self.type_tag.as_str() != M::TYPE_TAG {
            return Err(BusError::TypeMismatch {
                expected: M::type_tag(),
                found: self.type_tag.clone(),
            });
        }
        rebuild(&self.parameters)
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// Deserialize a message from its parameter map.
pub(crate) fn rebuild<M: Message>(parameters: &Parameters) -> Result<M> {
    // ---
    M::deserialize(serde_json::Value::Object(parameters.clone()))
        .map_err(|e| BusError::InvalidParameters(format!("`{}`: {e}", M::TYPE_TAG)))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
