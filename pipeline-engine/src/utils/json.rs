//! JSON parsing/serialization helpers with consistent warning logs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Where a JSON payload came from, so parse failures log useful fields.
#[derive(Debug, Clone, Copy)]
pub enum JsonContext<'a> {
    QueueEntry {
        lane: &'a str,
    },
    ProgressPayload {
        channel: &'a str,
    },
    PipelineField {
        pipeline_id: &'a str,
        field: &'static str,
    },
}

fn warn_parse_error(
    raw_len: usize,
    error: serde_json::Error,
    ctx: JsonContext<'_>,
    msg: &'static str,
) {
    match ctx {
        JsonContext::QueueEntry { lane } => {
            warn!(lane = %lane, raw_len, error = %error, "{msg}");
        }
        JsonContext::ProgressPayload { channel } => {
            warn!(channel = %channel, raw_len, error = %error, "{msg}");
        }
        JsonContext::PipelineField { pipeline_id, field } => {
            warn!(
                pipeline_id = %pipeline_id,
                field,
                raw_len,
                error = %error,
                "{msg}"
            );
        }
    }
}

fn warn_serialize_error(error: serde_json::Error, ctx: JsonContext<'_>, msg: &'static str) {
    match ctx {
        JsonContext::QueueEntry { lane } => warn!(lane = %lane, error = %error, "{msg}"),
        JsonContext::ProgressPayload { channel } => {
            warn!(channel = %channel, error = %error, "{msg}")
        }
        JsonContext::PipelineField { pipeline_id, field } => {
            warn!(pipeline_id = %pipeline_id, field, error = %error, "{msg}")
        }
    }
}

pub fn parse_optional<T: DeserializeOwned>(
    raw: Option<&str>,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(raw) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn_parse_error(raw.len(), error, ctx, msg);
            None
        }
    }
}

pub fn parse_or_default<T: DeserializeOwned + Default>(
    raw: &str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> T {
    // Treat empty string as "no value" - return default without warning
    if raw.is_empty() {
        return T::default();
    }
    match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn_parse_error(raw.len(), error, ctx, msg);
            T::default()
        }
    }
}

/// Interpret an opaque stage result: valid JSON is kept structured, anything
/// else is stored as a JSON string.
pub fn value_or_string(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

pub fn to_string_or_fallback<T: Serialize + ?Sized>(
    value: &T,
    fallback: &'static str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> String {
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(error) => {
            warn_serialize_error(error, ctx, msg);
            fallback.to_string()
        }
    }
}
