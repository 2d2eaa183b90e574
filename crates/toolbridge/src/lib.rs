//! toolbridge: supervised command-server bridge over framed JSON stdio.

mod bridge;
mod capability;
mod channel;
mod client;
mod codec;
mod correlation;
mod lifecycle;
pub mod protocol;

pub use bridge::CommandBridge;
pub use capability::{Capability, CapabilityFailure, CapabilityTable, Invocation, OutputSink};
pub use channel::BridgeChannel;
pub use client::{CallError, CommandClient, CommandClientConfig};
pub use correlation::{CorrelationTable, PendingRequest};
pub use lifecycle::{
    CommandSpawner, LifecycleConfig, LifecycleError, PORT_ENV, PortRemediator,
    ProcessLifecycleManager, ServerSpawner, ServerState, SpawnError, SystemRemediator,
};
pub use protocol::{Argument, CapabilitySpec, Message, RequestId};
