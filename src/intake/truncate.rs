//! Field length limits applied to every record before it is encoded.
//!
//! Lengths are counted in UTF-16 code units, which is how the intake server
//! measures them, and a cut never lands inside a character.

use serde_json::{Map, Value};

use crate::config::Config;

/// Maximum length of keyword fields accepted by the intake API.
pub const INTAKE_STRING_MAX_SIZE: usize = 1024;

const OBJECT_PLACEHOLDER: &str = "[object Object]";

const URL_KEYWORD_FIELDS: [&str; 8] = [
    "protocol", "hostname", "port", "pathname", "search", "hash", "raw", "full",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationLimits {
    pub keyword_max_len: usize,
    pub long_field_max_len: usize,
    pub string_max_len: usize,
    /// `None` falls back to `long_field_max_len`, a negative value disables
    /// truncation of error messages.
    pub error_message_max_len: Option<i64>,
    pub custom_key_max_len: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        TruncationLimits {
            keyword_max_len: INTAKE_STRING_MAX_SIZE,
            long_field_max_len: 10_000,
            string_max_len: 1024,
            error_message_max_len: None,
            custom_key_max_len: 1024,
        }
    }
}

impl TruncationLimits {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        TruncationLimits {
            keyword_max_len: config.keyword_max_length,
            long_field_max_len: config.long_field_max_length,
            string_max_len: config.string_max_length,
            error_message_max_len: config.error_message_max_length,
            custom_key_max_len: config.custom_key_max_length,
        }
    }

    fn error_message_limit(&self) -> Option<usize> {
        match self.error_message_max_len {
            None => Some(self.long_field_max_len),
            Some(len) => usize::try_from(len).ok(),
        }
    }
}

/// Returns the longest prefix of `s` that fits in `max` UTF-16 code units.
#[must_use]
pub fn truncate_str(s: &str, max: usize) -> &str {
    // Fast path, a UTF-16 encoding is never longer than the UTF-8 one.
    if s.len() <= max {
        return s;
    }
    let mut units = 0;
    for (idx, ch) in s.char_indices() {
        units += ch.len_utf16();
        if units > max {
            return &s[..idx];
        }
    }
    s
}

fn truncate_value(value: &mut Value, max: usize) {
    if let Value::String(s) = value {
        let cut = truncate_str(s, max).len();
        s.truncate(cut);
    }
}

fn field_mut<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter().try_fold(value, |current, key| current.get_mut(*key))
}

fn truncate_field(value: &mut Value, path: &[&str], max: usize) {
    if let Some(field) = field_mut(value, path) {
        truncate_value(field, max);
    }
}

fn truncate_fields(value: &mut Value, fields: &[&str], max: usize) {
    for &field in fields {
        truncate_field(value, &[field], max);
    }
}

/// Renders a non-string value the way the intake server expects loosely
/// typed fields to be stringified.
fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(coerce_to_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => OBJECT_PLACEHOLDER.to_string(),
    }
}

fn truncate_labels(value: &mut Value, max: usize) {
    let Some(map) = value.as_object_mut() else {
        return;
    };
    for label in map.values_mut() {
        if matches!(label, Value::Array(_) | Value::Object(_)) {
            *label = Value::String(coerce_to_string(label));
        }
        truncate_value(label, max);
    }
}

fn stringify_headers(value: &mut Value) {
    let Some(headers) = value.as_object_mut() else {
        return;
    };
    for header in headers.values_mut() {
        match header {
            Value::String(_) | Value::Null => {}
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if !item.is_string() {
                        *item = Value::String(coerce_to_string(item));
                    }
                }
            }
            other => *other = Value::String(coerce_to_string(other)),
        }
    }
}

fn truncate_custom(value: &mut Value, limits: &TruncationLimits) {
    let Some(custom) = value.as_object_mut() else {
        return;
    };
    let entries = std::mem::take(custom);
    let mut truncated = Map::with_capacity(entries.len());
    for (key, mut entry) in entries {
        let key = truncate_str(&key, limits.custom_key_max_len).to_string();
        if matches!(entry, Value::Array(_) | Value::Object(_)) {
            entry = Value::String(coerce_to_string(&entry));
        }
        truncate_value(&mut entry, limits.string_max_len);
        truncated.insert(key, entry);
    }
    *custom = truncated;
}

fn truncate_stacktrace(frames: Option<&mut Value>, limits: &TruncationLimits) {
    let Some(Value::Array(frames)) = frames else {
        return;
    };
    for frame in frames {
        truncate_field(frame, &["context_line"], limits.string_max_len);
        for side in ["pre_context", "post_context"] {
            if let Some(Value::Array(lines)) = frame.get_mut(side) {
                for line in lines {
                    truncate_value(line, limits.string_max_len);
                }
            }
        }
    }
}

fn truncate_context(context: Option<&mut Value>, limits: &TruncationLimits) {
    let Some(context) = context else {
        return;
    };
    let keyword = limits.keyword_max_len;

    if let Some(request) = context.get_mut("request") {
        truncate_field(request, &["method"], keyword);
        if let Some(url) = request.get_mut("url") {
            truncate_fields(url, &URL_KEYWORD_FIELDS, keyword);
        }
        if let Some(headers) = request.get_mut("headers") {
            stringify_headers(headers);
        }
    }
    if let Some(headers) = field_mut(context, &["response", "headers"]) {
        stringify_headers(headers);
    }
    if let Some(user) = context.get_mut("user") {
        truncate_fields(user, &["id", "email", "username"], keyword);
    }
    if let Some(tags) = context.get_mut("tags") {
        truncate_labels(tags, keyword);
    }
    if let Some(custom) = context.get_mut("custom") {
        truncate_custom(custom, limits);
    }

    truncate_field(context, &["db", "statement"], limits.long_field_max_len);
    if let Some(destination) = context.get_mut("destination") {
        truncate_field(destination, &["address"], keyword);
        if let Some(service) = destination.get_mut("service") {
            truncate_fields(service, &["name", "resource", "type"], keyword);
        }
    }
    truncate_field(context, &["message", "queue", "name"], keyword);
}

pub fn truncate_transaction(transaction: &mut Value, limits: &TruncationLimits) {
    truncate_fields(transaction, &["name", "type", "result"], limits.keyword_max_len);
    truncate_context(transaction.get_mut("context"), limits);
}

pub fn truncate_span(span: &mut Value, limits: &TruncationLimits) {
    truncate_fields(
        span,
        &["name", "type", "subtype", "action"],
        limits.keyword_max_len,
    );
    truncate_stacktrace(span.get_mut("stacktrace"), limits);
    truncate_context(span.get_mut("context"), limits);
}

pub fn truncate_error(error: &mut Value, limits: &TruncationLimits) {
    let keyword = limits.keyword_max_len;
    let message_limit = limits.error_message_limit();

    truncate_field(error, &["culprit"], keyword);
    truncate_field(error, &["transaction", "type"], keyword);

    if let Some(log) = error.get_mut("log") {
        truncate_fields(log, &["level", "logger_name", "param_message"], keyword);
        if let Some(max) = message_limit {
            truncate_field(log, &["message"], max);
        }
        truncate_stacktrace(log.get_mut("stacktrace"), limits);
    }
    if let Some(exception) = error.get_mut("exception") {
        if let Some(max) = message_limit {
            truncate_field(exception, &["message"], max);
        }
        truncate_fields(exception, &["type", "code", "module"], keyword);
        truncate_stacktrace(exception.get_mut("stacktrace"), limits);
    }
    truncate_context(error.get_mut("context"), limits);
}

pub fn truncate_metricset(metricset: &mut Value, limits: &TruncationLimits) {
    let keyword = limits.keyword_max_len;
    if let Some(tags) = metricset.get_mut("tags") {
        truncate_labels(tags, keyword);
    }
    if let Some(transaction) = metricset.get_mut("transaction") {
        truncate_fields(transaction, &["name", "type"], keyword);
    }
    if let Some(span) = metricset.get_mut("span") {
        truncate_fields(span, &["type", "subtype"], keyword);
    }
}

pub fn truncate_metadata(metadata: &mut Value, limits: &TruncationLimits) {
    let keyword = limits.keyword_max_len;

    if let Some(service) = metadata.get_mut("service") {
        truncate_fields(service, &["name", "version", "environment"], keyword);
        for section in ["agent", "framework", "language", "runtime"] {
            if let Some(part) = service.get_mut(section) {
                truncate_fields(part, &["name", "version", "activation_method"], keyword);
            }
        }
        truncate_field(service, &["node", "configured_name"], keyword);
    }
    truncate_field(metadata, &["process", "title"], keyword);
    if let Some(system) = metadata.get_mut("system") {
        truncate_fields(
            system,
            &[
                "architecture",
                "platform",
                "detected_hostname",
                "configured_hostname",
            ],
            keyword,
        );
        truncate_field(system, &["container", "id"], keyword);
        if let Some(kubernetes) = system.get_mut("kubernetes") {
            truncate_field(kubernetes, &["namespace"], keyword);
            truncate_field(kubernetes, &["node", "name"], keyword);
            if let Some(pod) = kubernetes.get_mut("pod") {
                truncate_fields(pod, &["name", "uid"], keyword);
            }
        }
    }
    if let Some(cloud) = metadata.get_mut("cloud") {
        truncate_fields(cloud, &["availability_zone", "provider", "region"], keyword);
        for section in ["account", "instance", "project"] {
            if let Some(part) = cloud.get_mut(section) {
                truncate_fields(part, &["id", "name"], keyword);
            }
        }
        truncate_field(cloud, &["machine", "type"], keyword);
    }
    if let Some(labels) = metadata.get_mut("labels") {
        truncate_labels(labels, keyword);
    }
}
