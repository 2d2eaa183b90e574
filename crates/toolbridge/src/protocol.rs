//! Wire protocol for host-server communication.
//!
//! One duplex channel carries the whole conversation: the command server
//! (child) discovers and invokes host capabilities, the host streams output
//! and exactly one terminal message back per request.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Correlation identifier for an in-flight command execution.
///
/// Generated by the child's command client; unique for the lifetime of the
/// channel. A monotonic counter plus a random suffix is sufficient —
/// cryptographic uniqueness is not required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("req_{}_{}", seq, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Arguments of an execution request, as an explicit tagged variant rather
/// than runtime type inspection of raw JSON.
///
/// `Null` and a missing field both decode to [`Argument::Absent`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Argument {
    /// Ordered values, spread positionally into the capability.
    Sequence(Vec<serde_json::Value>),
    /// A single object parameter.
    Object(serde_json::Map<String, serde_json::Value>),
    /// A single scalar parameter.
    ///
    /// `Null` is not a distinct scalar: `Scalar(Null)` encodes as `null` on
    /// the wire, decodes back as [`Argument::Absent`], and invokes with no
    /// parameters. Decoding never produces `Scalar(Null)`.
    Scalar(serde_json::Value),
    /// No parameters.
    #[default]
    Absent,
}

impl Argument {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

impl From<serde_json::Value> for Argument {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Absent,
            serde_json::Value::Array(items) => Self::Sequence(items),
            serde_json::Value::Object(fields) => Self::Object(fields),
            other => Self::Scalar(other),
        }
    }
}

impl From<Argument> for serde_json::Value {
    fn from(args: Argument) -> Self {
        match args {
            Argument::Sequence(items) => Self::Array(items),
            Argument::Object(fields) => Self::Object(fields),
            Argument::Scalar(value) => value,
            Argument::Absent => Self::Null,
        }
    }
}

/// A named host capability, as advertised to the command server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
}

/// Messages exchanged between host and command server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Lifecycle handshake, the first message the command server sends once
    /// its event loop is running.
    Ready,

    /// Request the current capability list.
    DiscoverCapabilities,

    /// Capability list in host registration order, names unique.
    CapabilityList { capabilities: Vec<CapabilitySpec> },

    /// Invoke a capability. Each request id appears on at most one of these.
    ExecuteCommand {
        request_id: RequestId,
        command: String,
        #[serde(default, skip_serializing_if = "Argument::is_absent")]
        args: Argument,
    },

    /// Intermediate output chunk; zero or more per request, never terminal.
    CommandOutput { request_id: RequestId, chunk: String },

    /// Terminal success.
    CommandResult {
        request_id: RequestId,
        value: serde_json::Value,
    },

    /// Terminal failure; a human-readable message, never a stack trace.
    CommandError { request_id: RequestId, message: String },
}
