//! Request body decoding into context entries.
//!
//! | Content type | Result |
//! |--------------|--------|
//! | `application/x-www-form-urlencoded` | one entry per field; repeated fields become arrays |
//! | `application/json` | an object's members; any other JSON value under `body` |
//! | `multipart/form-data` | text fields as strings, files as `{filename, content_type, size}` |
//!
//! Other content types and empty bodies decode to nothing.

use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::fmt;

use crate::server::{parse_query, Request};

#[derive(Debug)]
pub enum FormError {
    Json(serde_json::Error),
    Multipart(multer::Error),
}

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormError::Json(err) => write!(f, "invalid JSON body: {err}"),
            FormError::Multipart(err) => write!(f, "invalid multipart body: {err}"),
        }
    }
}

impl std::error::Error for FormError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormError::Json(err) => Some(err),
            FormError::Multipart(err) => Some(err),
        }
    }
}

fn push_field(fields: &mut Map<String, Value>, name: String, value: Value) {
    match fields.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(name, value);
        }
    }
}

/// Decode the request body; `Ok(None)` when there is nothing to decode.
pub async fn decode(request: &Request) -> Result<Option<Map<String, Value>>, FormError> {
    let body = request.body();
    if body.is_empty() {
        return Ok(None);
    }
    let Some(content_type) = request.content_type() else {
        return Ok(None);
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        "application/x-www-form-urlencoded" => {
            let text = String::from_utf8_lossy(body);
            let mut fields = Map::new();
            for (name, value) in parse_query(&text) {
                push_field(&mut fields, name, Value::String(value));
            }
            Ok(Some(fields))
        }
        "application/json" => match serde_json::from_slice(body).map_err(FormError::Json)? {
            Value::Object(fields) => Ok(Some(fields)),
            other => {
                let mut fields = Map::new();
                fields.insert("body".to_string(), other);
                Ok(Some(fields))
            }
        },
        "multipart/form-data" => decode_multipart(content_type, body.clone()).await.map(Some),
        _ => Ok(None),
    }
}

async fn decode_multipart(content_type: &str, body: Bytes) -> Result<Map<String, Value>, FormError> {
    let boundary = multer::parse_boundary(content_type).map_err(FormError::Multipart)?;
    let stream = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Map::new();
    while let Some(field) = multipart.next_field().await.map_err(FormError::Multipart)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(FormError::Multipart)?;
                push_field(
                    &mut fields,
                    name,
                    json!({
                        "filename": filename,
                        "content_type": content_type,
                        "size": data.len(),
                    }),
                );
            }
            None => {
                let text = field.text().await.map_err(FormError::Multipart)?;
                push_field(&mut fields, name, Value::String(text));
            }
        }
    }
    Ok(fields)
}
