use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type ToolArguments = BTreeMap<String, Value>;

/// Scheduling label for a planned call. Parallel calls run alongside anything;
/// calls in the same serial group run one after another in plan order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "mode", content = "group", rename_all = "snake_case")]
pub enum ConcurrencyGroup {
    Parallel,
    Serial(String),
}

impl ConcurrencyGroup {
    pub fn serial(name: impl Into<String>) -> Self {
        Self::Serial(name.into())
    }

    pub fn serial_key(&self) -> Option<&str> {
        match self {
            Self::Parallel => None,
            Self::Serial(name) => Some(name),
        }
    }
}

impl fmt::Display for ConcurrencyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => f.write_str("parallel"),
            Self::Serial(name) => write!(f, "serial:{name}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: ToolArguments,
    pub concurrency_group: ConcurrencyGroup,
    /// Indexes of earlier calls in the same plan that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<usize>,
}

impl ToolCall {
    pub fn new(
        tool_name: impl Into<String>,
        arguments: ToolArguments,
        concurrency_group: ConcurrencyGroup,
    ) -> Self {
        Self { tool_name: tool_name.into(), arguments, concurrency_group, depends_on: Vec::new() }
    }

    pub fn depending_on(mut self, index: usize) -> Self {
        if !self.depends_on.contains(&index) {
            self.depends_on.push(index);
        }
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.tool_name, &self.arguments)
    }
}

/// Content address of a call: tool name plus canonical arguments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn of(tool_name: &str, arguments: &ToolArguments) -> Self {
        let canonical: Map<String, Value> = arguments
            .iter()
            .map(|(key, value)| (key.clone(), canonicalize(value)))
            .collect();
        let mut hasher = blake3::Hasher::new();
        hasher.update(tool_name.trim().as_bytes());
        hasher.update(b"\n");
        hasher.update(render_canonical(&Value::Object(canonical)).as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(key, value)| (key, canonicalize(value))).collect();
            Value::Object(sorted.into_iter().map(|(key, value)| (key.clone(), value)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(number) => match number.as_f64() {
            Some(float) if number.is_f64() && float.fract() == 0.0 && float.abs() < 9.0e15 => {
                Value::from(float as i64)
            }
            _ => value.clone(),
        },
        other => other.clone(),
    }
}

// Renders objects with sorted keys regardless of serde_json's map ordering.
fn render_canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", Value::String(key.clone()), render_canonical(&map[key])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(render_canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    Validation,
    Auth,
    Upstream,
    Timeout,
    RateLimited,
    DependencyFailed,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Upstream => "upstream",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::DependencyFailed => "dependency_failed",
        }
    }

    /// Upstream faults, timeouts and throttling may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream | Self::Timeout | Self::RateLimited)
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    /// Upstream hint for throttled calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after_ms: None }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Validation, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Upstream, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self { kind: ToolErrorKind::RateLimited, message: message.into(), retry_after_ms }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    Timeout,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ToolError>,
    pub latency_ms: u64,
    pub attempt_count: u32,
    #[serde(default)]
    pub from_cache: bool,
}

impl ToolResult {
    pub fn ok(tool_name: impl Into<String>, payload: Value, latency_ms: u64, attempt_count: u32) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Ok,
            payload: Some(payload),
            error_detail: None,
            latency_ms,
            attempt_count,
            from_cache: false,
        }
    }

    pub fn failed(
        tool_name: impl Into<String>,
        error: ToolError,
        latency_ms: u64,
        attempt_count: u32,
    ) -> Self {
        let status =
            if error.kind == ToolErrorKind::Timeout { ToolStatus::Timeout } else { ToolStatus::Error };
        Self {
            tool_name: tool_name.into(),
            status,
            payload: None,
            error_detail: Some(error),
            latency_ms,
            attempt_count,
            from_cache: false,
        }
    }

    /// Marks a replayed result; the replay itself costs no upstream time.
    pub fn replayed_from_cache(mut self) -> Self {
        self.from_cache = true;
        self.latency_ms = 0;
        self.attempt_count = 0;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error_detail.as_ref().map(|error| error.kind)
    }
}
