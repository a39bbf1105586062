//! Optional response validation, run after the response chain.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::body::ResponseBody;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// The body was inspected and rejected.
    #[error("response does not match schema: {}", .0.join("; "))]
    Mismatch(Vec<String>),
    /// The validator could not run.
    #[error("schema validator failed: {0}")]
    Internal(String),
}

pub trait ResponseSchema: Send + Sync {
    fn validate(&self, body: &ResponseBody) -> Result<(), SchemaError>;
}

impl<F> ResponseSchema for F
where
    F: Fn(&ResponseBody) -> Result<(), SchemaError> + Send + Sync,
{
    fn validate(&self, body: &ResponseBody) -> Result<(), SchemaError> {
        self(body)
    }
}

/// JSON Schema validator compiled once and reused for every response.
pub struct JsonSchema {
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for JsonSchema {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("JsonSchema").finish_non_exhaustive()
    }
}

impl JsonSchema {
    pub fn new(schema: &Value) -> Result<Self, SchemaError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|error| SchemaError::Internal(format!("invalid JSON schema: {error}")))?;
        Ok(Self { validator })
    }

    fn check(&self, instance: &Value) -> Result<(), SchemaError> {
        let messages: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|error| format!("{error} at {}", error.instance_path))
            .collect();
        if messages.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Mismatch(messages))
        }
    }
}

impl ResponseSchema for JsonSchema {
    fn validate(&self, body: &ResponseBody) -> Result<(), SchemaError> {
        match body {
            ResponseBody::Json(value) => self.check(value),
            ResponseBody::Text(text) => self.check(&Value::String(text.clone())),
            ResponseBody::Bytes(bytes) => {
                let value = serde_json::from_slice::<Value>(bytes).map_err(|error| {
                    SchemaError::Mismatch(vec![format!("binary body is not JSON: {error}")])
                })?;
                self.check(&value)
            }
            ResponseBody::Raw(_) => Err(SchemaError::Internal(
                "raw transport responses cannot be validated".to_owned(),
            )),
        }
    }
}

/// Accepts any body that deserializes into `T`.
pub struct TypedSchema<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TypedSchema<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TypedSchema")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> ResponseSchema for TypedSchema<T>
where
    T: DeserializeOwned,
{
    fn validate(&self, body: &ResponseBody) -> Result<(), SchemaError> {
        if let ResponseBody::Raw(_) = body {
            return Err(SchemaError::Internal(
                "raw transport responses cannot be validated".to_owned(),
            ));
        }
        body.deserialize::<T>()
            .map(|_| ())
            .map_err(|error| SchemaError::Mismatch(vec![error.to_string()]))
    }
}
