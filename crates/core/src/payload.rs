//! Job payloads and the schema capability model.
//!
//! A job declares the shape of its inputs and outputs through two associated
//! types. Each is either a concrete [`Payload`] or [`NoSchema`], which yields
//! one of four [`SchemaKind`] variants known at compile time.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// A typed job payload (inputs, outputs, or next-job inputs).
///
/// The default conversions use serde field reflection. Override `to_value` /
/// `from_value` to plug in a custom representation.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// `false` only for [`NoSchema`].
    const DECLARED: bool = true;

    fn to_value(&self) -> DomainResult<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_value(value: JsonValue) -> DomainResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Marker for "no schema declared".
///
/// Uninhabited, so a job without an inputs schema cannot be handed inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSchema {}

impl Serialize for NoSchema {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        match *self {}
    }
}

impl<'de> Deserialize<'de> for NoSchema {
    fn deserialize<D: Deserializer<'de>>(_deserializer: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom("no schema declared"))
    }
}

impl Payload for NoSchema {
    const DECLARED: bool = false;
}

/// Which payload schemas a job declares.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    None,
    Inputs,
    Outputs,
    Both,
}

impl SchemaKind {
    pub const fn of<I: Payload, O: Payload>() -> Self {
        match (I::DECLARED, O::DECLARED) {
            (false, false) => SchemaKind::None,
            (true, false) => SchemaKind::Inputs,
            (false, true) => SchemaKind::Outputs,
            (true, true) => SchemaKind::Both,
        }
    }

    pub fn has_inputs(&self) -> bool {
        matches!(self, SchemaKind::Inputs | SchemaKind::Both)
    }

    pub fn has_outputs(&self) -> bool {
        matches!(self, SchemaKind::Outputs | SchemaKind::Both)
    }

    /// Symmetric inputs check for job `job`: inputs without a declared schema
    /// always fail; a declared schema without inputs fails when
    /// `require_declared` is set.
    pub fn check_inputs(
        &self,
        job: &str,
        inputs: Option<&JsonValue>,
        require_declared: bool,
    ) -> DomainResult<()> {
        match (self.has_inputs(), inputs.is_some()) {
            (true, false) if require_declared => Err(DomainError::missing_inputs(job)),
            (false, true) => Err(DomainError::unexpected_inputs(job)),
            _ => Ok(()),
        }
    }
}

/// Inputs a finished job hands to its successor(s).
///
/// `Many` fans out: one successor row per element.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum NextJobInputs {
    #[default]
    None,
    One(JsonValue),
    Many(Vec<JsonValue>),
}

impl NextJobInputs {
    pub fn is_none(&self) -> bool {
        matches!(self, NextJobInputs::None)
    }

    /// Stored form: `{}` when unset, the value, or an array of values.
    pub fn as_value(&self) -> JsonValue {
        match self {
            NextJobInputs::None => empty_object(),
            NextJobInputs::One(value) => value.clone(),
            NextJobInputs::Many(values) => JsonValue::Array(values.clone()),
        }
    }
}

/// `true` for `null`, `{}` and `[]`, which all count as "no payload".
pub fn is_absent(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Drop stored payloads that count as absent.
pub fn present(value: Option<JsonValue>) -> Option<JsonValue> {
    value.filter(|v| !is_absent(v))
}

pub fn empty_object() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}
