// sb-test-utils: Shared test helpers for the dispatch suite.
//
// Provides a small structural validator (so validation paths can be
// exercised without a real schema backend), TCP frame helpers for driving
// the length-prefixed adapter from tests, and a free-port helper.

use sb_core::Validator;
use sb_protocol::{Envelope, FieldError};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ---------------------------------------------------------------------------
// Structural test validator
// ---------------------------------------------------------------------------

/// Interprets schemas shaped like
/// `{"type": "object", "properties": {"a": {"type": "number"}}, "required": ["a"]}`.
///
/// Checks `object` / `number` / `string` / `boolean` / `array` leaf types,
/// required keys, and nothing else.  Extra payload fields pass through.
pub struct TypeValidator;

impl Validator for TypeValidator {
    fn validate(&self, schema: &Value, data: &Value) -> Result<Value, Vec<FieldError>> {
        let mut errors = Vec::new();
        check(schema, data, "", &mut errors);
        if errors.is_empty() {
            Ok(data.clone())
        } else {
            Err(errors)
        }
    }

    fn to_json_schema(&self, schema: &Value) -> Option<Value> {
        Some(schema.clone())
    }
}

fn type_matches(expected: &str, data: &Value) -> bool {
    match expected {
        "object" => data.is_object(),
        "array" => data.is_array(),
        "string" => data.is_string(),
        "number" => data.is_number(),
        "boolean" => data.is_boolean(),
        "null" => data.is_null(),
        _ => true,
    }
}

fn check(schema: &Value, data: &Value, path: &str, errors: &mut Vec<FieldError>) {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, data) {
            errors.push(FieldError::new(
                path,
                format!("expected {expected}"),
                "type",
            ));
            return;
        }
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if data.get(key).is_none() {
                let field = join_path(path, key);
                errors.push(FieldError::new(field, "is required", "required"));
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, sub_schema) in properties {
            if let Some(sub_data) = data.get(key) {
                let field = join_path(path, key);
                check(sub_schema, sub_data, &field, errors);
            }
        }
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_owned()
    } else {
        format!("{path}.{key}")
    }
}

// ---------------------------------------------------------------------------
// TCP frame helpers (client side of the length-prefixed protocol)
// ---------------------------------------------------------------------------

pub async fn write_frame(stream: &mut TcpStream, envelope: &Envelope) -> std::io::Result<()> {
    let json = envelope.to_json().into_bytes();
    stream.write_all(&(json.len() as u32).to_be_bytes()).await?;
    stream.write_all(&json).await?;
    Ok(())
}

pub async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Envelope> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Envelope::from_json_bytes(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Pick a free TCP port by binding to port 0 and dropping the listener.
pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    port
}
