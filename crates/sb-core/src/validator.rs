//! The validation port.
//!
//! Schemas are opaque `serde_json::Value`s to the core; only the active
//! validator interprets them.  The router inserts a validation interceptor
//! for any handler with a registered schema: input validation runs before
//! dispatch and replaces the payload with the validator's (possibly coerced)
//! value; output validation runs on procedure results after dispatch.

use sb_protocol::FieldError;
use serde_json::Value;

pub trait Validator: Send + Sync {
    /// Validate `data` against `schema`.  `Ok` returns the value to use
    /// downstream (validators may coerce or strip fields); `Err` carries the
    /// per-field failure list that travels in `VALIDATION_ERROR` details.
    fn validate(&self, schema: &Value, data: &Value) -> Result<Value, Vec<FieldError>>;

    /// Optional JSON Schema rendering for documentation emitters.
    fn to_json_schema(&self, _schema: &Value) -> Option<Value> {
        None
    }
}
