//! Child-side command client.
//!
//! Turns external tool invocations into correlated round-trips: each call
//! sends an `ExecuteCommand` tagged with a fresh request id, then awaits the
//! matching terminal message under a bounded timeout. Intermediate output is
//! forwarded to a caller-provided sink without settling the request.
//!
//! One event loop task owns the channel and the correlation table; handles
//! are cheap clones that talk to it over an in-process queue.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{BridgeChannel, MessageReader, MessageWriter};
use crate::codec::Decoded;
use crate::correlation::{CorrelationTable, PendingRequest};
use crate::protocol::{Argument, CapabilitySpec, Message, RequestId};

/// Client-visible failure of a call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The channel was not writable when the send was attempted; nothing was
    /// registered.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No terminal message arrived within the configured budget.
    #[error("command {command:?} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    /// The host reported a terminal error (unknown command or a capability
    /// failure).
    #[error("{message}")]
    Command { message: String },

    /// The channel died before a response arrived.
    #[error("channel closed before a response arrived")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct CommandClientConfig {
    /// Budget for one call, discovery included.
    pub call_timeout: Duration,
    /// Send the `Ready` handshake as the loop's first message.
    pub announce_ready: bool,
}

impl Default for CommandClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            announce_ready: true,
        }
    }
}

enum ClientCommand {
    Execute {
        request_id: RequestId,
        command: String,
        args: Argument,
        reply: oneshot::Sender<Result<Value, CallError>>,
        sink: Option<mpsc::UnboundedSender<String>>,
    },
    /// Caller gave up waiting; drop the pending entry so late messages for
    /// this id are ignored.
    Abandon { request_id: RequestId },
    Discover {
        reply: oneshot::Sender<Result<Vec<CapabilitySpec>, CallError>>,
    },
}

/// Handle to the client event loop.
#[derive(Clone)]
pub struct CommandClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    call_timeout: Duration,
}

impl CommandClient {
    /// Spawn the client event loop over the channel.
    pub fn connect(channel: BridgeChannel, config: CommandClientConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let call_timeout = config.call_timeout;
        let (reader, writer) = channel.into_parts();
        tokio::spawn(run_loop(reader, writer, commands_rx, config));
        Self {
            commands: commands_tx,
            call_timeout,
        }
    }

    /// Invoke a host capability and await its result.
    pub async fn call(&self, command: &str, args: Argument) -> Result<Value, CallError> {
        self.call_streaming(command, args, None).await
    }

    /// Like [`call`](Self::call), forwarding intermediate output chunks to
    /// `sink` as they arrive.
    pub async fn call_streaming(
        &self,
        command: &str,
        args: Argument,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Value, CallError> {
        let request_id = RequestId::next();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(ClientCommand::Execute {
                request_id: request_id.clone(),
                command: command.to_string(),
                args,
                reply: reply_tx,
                sink,
            })
            .map_err(|_| CallError::TransportUnavailable("client event loop stopped".to_string()))?;

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::ChannelClosed),
            Err(_) => {
                let _ = self.commands.send(ClientCommand::Abandon { request_id });
                Err(CallError::CommandTimeout {
                    command: command.to_string(),
                    timeout: self.call_timeout,
                })
            }
        }
    }

    /// The host's capability list; served from cache after the first
    /// discovery, re-requested whenever the cache is empty.
    pub async fn capabilities(&self) -> Result<Vec<CapabilitySpec>, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Discover { reply: reply_tx })
            .map_err(|_| CallError::TransportUnavailable("client event loop stopped".to_string()))?;

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::ChannelClosed),
            Err(_) => Err(CallError::CommandTimeout {
                command: "<discover_capabilities>".to_string(),
                timeout: self.call_timeout,
            }),
        }
    }
}

async fn run_loop(
    mut reader: MessageReader,
    mut writer: MessageWriter,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    config: CommandClientConfig,
) {
    let mut table = CorrelationTable::new();
    let mut capability_cache: Vec<CapabilitySpec> = Vec::new();
    let mut discovery_waiters: Vec<oneshot::Sender<Result<Vec<CapabilitySpec>, CallError>>> =
        Vec::new();

    if config.announce_ready {
        if let Err(e) = writer.send(Message::Ready).await {
            tracing::warn!(error = %e, "Failed to announce readiness");
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ClientCommand::Execute { request_id, command, args, reply, sink }) => {
                    let message = Message::ExecuteCommand {
                        request_id: request_id.clone(),
                        command: command.clone(),
                        args,
                    };
                    match writer.send(message).await {
                        Ok(()) => {
                            tracing::debug!(%request_id, %command, "Command sent");
                            table.insert(request_id, PendingRequest::new(command, reply, sink));
                        }
                        Err(e) => {
                            tracing::warn!(%request_id, %command, error = %e, "Channel not writable");
                            let _ = reply.send(Err(CallError::TransportUnavailable(e.to_string())));
                        }
                    }
                }
                Some(ClientCommand::Abandon { request_id }) => {
                    if let Some(request) = table.remove(&request_id) {
                        tracing::debug!(
                            %request_id,
                            command = request.command(),
                            age = ?request.age(),
                            "Abandoning timed-out request"
                        );
                    }
                }
                Some(ClientCommand::Discover { reply }) => {
                    if !capability_cache.is_empty() {
                        let _ = reply.send(Ok(capability_cache.clone()));
                    } else {
                        // Concurrent discoveries coalesce onto one in-flight
                        // request; every waiter gets the same list. Waiters
                        // whose caller already timed out do not count as an
                        // in-flight discovery, otherwise one lost reply would
                        // wedge every later request.
                        discovery_waiters.retain(|waiter| !waiter.is_closed());
                        let in_flight = !discovery_waiters.is_empty();
                        discovery_waiters.push(reply);
                        if !in_flight {
                            if let Err(e) = writer.send(Message::DiscoverCapabilities).await {
                                tracing::warn!(error = %e, "Failed to send capability discovery");
                                for waiter in discovery_waiters.drain(..) {
                                    let _ = waiter.send(Err(CallError::TransportUnavailable(
                                        e.to_string(),
                                    )));
                                }
                            }
                        }
                    }
                }
                None => break,
            },

            frame = reader.next() => match frame {
                Some(Ok(Decoded::Valid(message))) => match message {
                    Message::CapabilityList { capabilities } => {
                        tracing::debug!(count = capabilities.len(), "Capability list received");
                        capability_cache = capabilities;
                        for waiter in discovery_waiters.drain(..) {
                            let _ = waiter.send(Ok(capability_cache.clone()));
                        }
                    }
                    Message::CommandOutput { request_id, chunk } => {
                        if !table.forward_output(&request_id, chunk) {
                            tracing::trace!(%request_id, "Dropping output for unknown request");
                        }
                    }
                    Message::CommandResult { request_id, value } => {
                        if !table.settle(&request_id, Ok(value)) {
                            tracing::trace!(%request_id, "Dropping terminal for unknown request");
                        }
                    }
                    Message::CommandError { request_id, message } => {
                        if !table.settle(&request_id, Err(CallError::Command { message })) {
                            tracing::trace!(%request_id, "Dropping terminal for unknown request");
                        }
                    }
                    other => {
                        tracing::warn!(?other, "Unexpected message on client channel");
                    }
                },
                Some(Ok(Decoded::Malformed { error })) => {
                    tracing::warn!(%error, "Discarding malformed frame");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Channel read error");
                    break;
                }
                None => {
                    tracing::warn!("Channel closed (host gone?)");
                    break;
                }
            },
        }
    }

    // Channel is gone: reject everything that is or becomes pending.
    table.fail_all(|| CallError::ChannelClosed);
    for waiter in discovery_waiters.drain(..) {
        let _ = waiter.send(Err(CallError::ChannelClosed));
    }
    commands.close();
    while let Ok(command) = commands.try_recv() {
        match command {
            ClientCommand::Execute { reply, .. } => {
                let _ = reply.send(Err(CallError::TransportUnavailable(
                    "channel closed".to_string(),
                )));
            }
            ClientCommand::Discover { reply } => {
                let _ = reply.send(Err(CallError::TransportUnavailable(
                    "channel closed".to_string(),
                )));
            }
            ClientCommand::Abandon { .. } => {}
        }
    }
    tracing::debug!("Client event loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CommandBridge;
    use crate::capability::{
        Capability, CapabilityFailure, CapabilityTable, Invocation, OutputSink,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::Notify;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    }

    /// Wire a client to a bridge over an in-memory duplex pipe.
    fn connect_pair(table: CapabilityTable) -> CommandClient {
        connect_pair_with(table, CommandClientConfig::default())
    }

    fn connect_pair_with(table: CapabilityTable, config: CommandClientConfig) -> CommandClient {
        init_test_tracing();
        let (host_io, client_io) = tokio::io::duplex(1 << 16);
        let (host_read, host_write) = tokio::io::split(host_io);
        let bridge = CommandBridge::new(Arc::new(table));
        tokio::spawn(async move {
            let _ = bridge.serve(BridgeChannel::new(host_read, host_write)).await;
        });
        let (client_read, client_write) = tokio::io::split(client_io);
        CommandClient::connect(BridgeChannel::new(client_read, client_write), config)
    }

    struct Recorder {
        invocations: Arc<StdMutex<Vec<Invocation>>>,
    }

    #[async_trait]
    impl Capability for Recorder {
        async fn invoke(
            &self,
            args: Invocation,
            _output: OutputSink,
        ) -> Result<Value, CapabilityFailure> {
            self.invocations.lock().unwrap().push(args);
            Ok(Value::Null)
        }
    }

    struct Stalled {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Capability for Stalled {
        async fn invoke(
            &self,
            _args: Invocation,
            _output: OutputSink,
        ) -> Result<Value, CapabilityFailure> {
            self.release.notified().await;
            Ok(json!("finally"))
        }
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let mut table = CapabilityTable::new();
        table.register_fn("echo", "echoes its argument", |args| async move {
            match args {
                Invocation::Single(value) => Ok(value),
                Invocation::Empty => Ok(Value::Null),
                Invocation::Positional(values) => Ok(Value::Array(values)),
            }
        });
        let client = connect_pair(table);

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let value = client
            .call_streaming("echo", Argument::from(json!("hi")), Some(sink_tx))
            .await
            .unwrap();
        assert_eq!(value, json!("hi"));
        // Plain capabilities emit no output chunks.
        assert!(sink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_command_rejects_with_its_name() {
        let client = connect_pair(CapabilityTable::new());

        let err = client
            .call("nope", Argument::from(json!({})))
            .await
            .unwrap_err();
        match err {
            CallError::Command { message } => assert!(message.contains("nope")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn argument_normalization_is_observed_by_the_capability() {
        let invocations = Arc::new(StdMutex::new(Vec::new()));
        let mut table = CapabilityTable::new();
        table.register(
            "record",
            "records how it was called",
            Arc::new(Recorder {
                invocations: Arc::clone(&invocations),
            }),
        );
        let client = connect_pair(table);

        client
            .call("record", Argument::from(json!([1, 2])))
            .await
            .unwrap();
        client
            .call("record", Argument::from(json!({"key": "value"})))
            .await
            .unwrap();
        client.call("record", Argument::Absent).await.unwrap();
        client
            .call("record", Argument::from(json!("scalar")))
            .await
            .unwrap();

        let seen = invocations.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                Invocation::Positional(vec![json!(1), json!(2)]),
                Invocation::Single(json!({"key": "value"})),
                Invocation::Empty,
                Invocation::Single(json!("scalar")),
            ]
        );
    }

    #[tokio::test]
    async fn streaming_chunks_arrive_in_order_before_the_result() {
        let mut table = CapabilityTable::new();
        table.register(
            "countdown",
            "streams three chunks",
            Arc::new(CountdownForTest),
        );
        let client = connect_pair(table);

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let value = client
            .call_streaming("countdown", Argument::Absent, Some(sink_tx))
            .await
            .unwrap();
        assert_eq!(value, json!("done"));

        let mut chunks = Vec::new();
        while let Ok(chunk) = sink_rx.try_recv() {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["one", "two", "three"]);
    }

    struct CountdownForTest;

    #[async_trait]
    impl Capability for CountdownForTest {
        async fn invoke(
            &self,
            _args: Invocation,
            output: OutputSink,
        ) -> Result<Value, CapabilityFailure> {
            for chunk in ["one", "two", "three"] {
                output
                    .emit(chunk)
                    .map_err(|e| CapabilityFailure::new(e.to_string()))?;
            }
            Ok(json!("done"))
        }
    }

    #[tokio::test]
    async fn timeout_rejects_and_late_completion_is_ignored() {
        let release = Arc::new(Notify::new());
        let mut table = CapabilityTable::new();
        table.register(
            "stall",
            "waits for an external nudge",
            Arc::new(Stalled {
                release: Arc::clone(&release),
            }),
        );
        table.register_fn("ping", "answers pong", |_| async { Ok(json!("pong")) });
        let client = connect_pair_with(
            table,
            CommandClientConfig {
                call_timeout: Duration::from_millis(100),
                announce_ready: true,
            },
        );

        let err = client.call("stall", Argument::Absent).await.unwrap_err();
        assert!(matches!(err, CallError::CommandTimeout { .. }));

        // Let the stalled capability complete now; its late terminal message
        // must be dropped without disturbing the client.
        release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = client.call("ping", Argument::Absent).await.unwrap();
        assert_eq!(value, json!("pong"));
    }

    #[tokio::test]
    async fn duplicate_terminal_from_buggy_host_is_ignored() {
        init_test_tracing();
        let (host_io, client_io) = tokio::io::duplex(1 << 16);
        let (host_read, host_write) = tokio::io::split(host_io);
        let mut host = BridgeChannel::new(host_read, host_write);

        tokio::spawn(async move {
            assert_eq!(host.recv().await, Some(Message::Ready));
            let request_id = match host.recv().await {
                Some(Message::ExecuteCommand { request_id, .. }) => request_id,
                other => panic!("expected ExecuteCommand, got {:?}", other),
            };
            host.send(Message::CommandResult {
                request_id: request_id.clone(),
                value: json!("first"),
            })
            .await
            .unwrap();
            // Buggy host: second terminal for the same id.
            host.send(Message::CommandResult {
                request_id,
                value: json!("second"),
            })
            .await
            .unwrap();

            // Keep serving so the client loop stays alive.
            while let Some(message) = host.recv().await {
                if matches!(message, Message::DiscoverCapabilities) {
                    host.send(Message::CapabilityList {
                        capabilities: vec![],
                    })
                    .await
                    .unwrap();
                }
            }
        });

        let (client_read, client_write) = tokio::io::split(client_io);
        let client = CommandClient::connect(
            BridgeChannel::new(client_read, client_write),
            CommandClientConfig::default(),
        );

        let value = client.call("anything", Argument::Absent).await.unwrap();
        assert_eq!(value, json!("first"));

        // The stray terminal had no observable effect; the loop still works.
        assert_eq!(client.capabilities().await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn dead_channel_fails_fast_with_transport_unavailable() {
        init_test_tracing();
        let (client_io, host_io) = tokio::io::duplex(64);
        drop(host_io);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = CommandClient::connect(
            BridgeChannel::new(client_read, client_write),
            CommandClientConfig::default(),
        );

        // Give the loop a moment to observe the closed channel.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = client.call("echo", Argument::Absent).await.unwrap_err();
        assert!(matches!(err, CallError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn concurrent_discoveries_coalesce_into_one_request() {
        init_test_tracing();
        let (host_io, client_io) = tokio::io::duplex(1 << 16);
        let (host_read, host_write) = tokio::io::split(host_io);
        let mut host = BridgeChannel::new(host_read, host_write);

        let requests = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let requests_seen = Arc::clone(&requests);
        tokio::spawn(async move {
            assert_eq!(host.recv().await, Some(Message::Ready));
            while let Some(message) = host.recv().await {
                if matches!(message, Message::DiscoverCapabilities) {
                    requests_seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    // Hold the reply long enough for a second caller to queue.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    host.send(Message::CapabilityList {
                        capabilities: vec![crate::protocol::CapabilitySpec {
                            name: "echo".to_string(),
                            description: "echoes its argument".to_string(),
                        }],
                    })
                    .await
                    .unwrap();
                }
            }
        });

        let (client_read, client_write) = tokio::io::split(client_io);
        let client = CommandClient::connect(
            BridgeChannel::new(client_read, client_write),
            CommandClientConfig::default(),
        );

        let (first, second) = tokio::join!(client.capabilities(), client.capabilities());
        assert_eq!(first.unwrap()[0].name, "echo");
        assert_eq!(second.unwrap()[0].name, "echo");
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_is_resent_after_a_timed_out_attempt() {
        init_test_tracing();
        let (host_io, client_io) = tokio::io::duplex(1 << 16);
        let (host_read, host_write) = tokio::io::split(host_io);
        let mut host = BridgeChannel::new(host_read, host_write);

        // A host that loses the first discovery request but answers later
        // ones; the client must re-send once its first caller gave up.
        tokio::spawn(async move {
            assert_eq!(host.recv().await, Some(Message::Ready));
            let mut seen = 0;
            while let Some(message) = host.recv().await {
                if matches!(message, Message::DiscoverCapabilities) {
                    seen += 1;
                    if seen == 1 {
                        continue;
                    }
                    host.send(Message::CapabilityList {
                        capabilities: vec![crate::protocol::CapabilitySpec {
                            name: "ping".to_string(),
                            description: "answers pong".to_string(),
                        }],
                    })
                    .await
                    .unwrap();
                }
            }
        });

        let (client_read, client_write) = tokio::io::split(client_io);
        let client = CommandClient::connect(
            BridgeChannel::new(client_read, client_write),
            CommandClientConfig {
                call_timeout: Duration::from_millis(200),
                announce_ready: true,
            },
        );

        let err = client.capabilities().await.unwrap_err();
        assert!(matches!(err, CallError::CommandTimeout { .. }));

        let list = client.capabilities().await.unwrap();
        assert_eq!(list[0].name, "ping");
    }

    #[tokio::test]
    async fn capabilities_are_cached_after_first_discovery() {
        let mut table = CapabilityTable::new();
        table.register_fn("alpha", "first", |_| async { Ok(Value::Null) });
        table.register_fn("beta", "second", |_| async { Ok(Value::Null) });
        let client = connect_pair(table);

        let first = client.capabilities().await.unwrap();
        let names: Vec<_> = first.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        // Served from cache; identical either way.
        let second = client.capabilities().await.unwrap();
        assert_eq!(first, second);
    }
}
