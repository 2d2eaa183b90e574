//! Host capability table and invocation shapes.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{Argument, CapabilitySpec};

/// Normalized arguments as seen by a capability handler.
///
/// Tools are authored against this normalization, so it is a total,
/// exhaustively matched function over [`Argument`]:
/// a sequence spreads positionally, an object or a scalar arrives as a single
/// parameter, absent (or null) arguments arrive as no parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Positional(Vec<Value>),
    Single(Value),
    Empty,
}

impl Invocation {
    pub fn normalize(args: Argument) -> Self {
        match args {
            Argument::Sequence(items) => Self::Positional(items),
            Argument::Object(fields) => Self::Single(Value::Object(fields)),
            Argument::Scalar(Value::Null) => Self::Empty,
            Argument::Scalar(value) => Self::Single(value),
            Argument::Absent => Self::Empty,
        }
    }
}

/// Failure raised by a capability handler.
///
/// Carries a human-readable message only; the bridge forwards it verbatim as
/// the terminal error payload.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CapabilityFailure {
    message: String,
}

impl CapabilityFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Handle for streaming intermediate output chunks during an invocation.
///
/// Chunks are queued and written asynchronously; per-request emission order is
/// preserved and the terminal message is always sent after the last chunk.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<String>,
}

impl OutputSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Queue a chunk for delivery. Empty chunks are skipped.
    pub fn emit(&self, chunk: impl Into<String>) -> io::Result<()> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output channel closed"))
    }
}

/// A named operation the host exposes for the command server to invoke.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    async fn invoke(&self, args: Invocation, output: OutputSink)
    -> Result<Value, CapabilityFailure>;
}

type BoxedCapabilityFn =
    Box<dyn Fn(Invocation) -> BoxFuture<'static, Result<Value, CapabilityFailure>> + Send + Sync>;

struct FnCapability {
    f: BoxedCapabilityFn,
}

#[async_trait]
impl Capability for FnCapability {
    async fn invoke(
        &self,
        args: Invocation,
        _output: OutputSink,
    ) -> Result<Value, CapabilityFailure> {
        (self.f)(args).await
    }
}

struct Entry {
    description: String,
    handler: Arc<dyn Capability>,
}

/// Registration-ordered mapping from command name to handler.
///
/// Populated by the host before the bridge starts serving; read-only from the
/// bridge's perspective. Names are unique: re-registering a name replaces the
/// handler but keeps its original position.
#[derive(Default)]
pub struct CapabilityTable {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn Capability>,
    ) {
        let name = name.into();
        if !self.entries.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.entries.insert(
            name,
            Entry {
                description: description.into(),
                handler,
            },
        );
    }

    /// Register an async closure as a capability.
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, CapabilityFailure>> + Send + 'static,
    {
        let f: BoxedCapabilityFn = Box::new(move |args| Box::pin(f(args)));
        self.register(name, description, Arc::new(FnCapability { f }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).map(|e| Arc::clone(&e.handler))
    }

    /// Capability specs in registration order.
    pub fn specs(&self) -> Vec<CapabilitySpec> {
        self.order
            .iter()
            .filter_map(|name| {
                self.entries.get(name).map(|e| CapabilitySpec {
                    name: name.clone(),
                    description: e.description.clone(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
