//! Host-side command execution bridge.
//!
//! Answers `DiscoverCapabilities` with the capability list and
//! `ExecuteCommand` by invoking the named capability, streaming
//! `CommandOutput` chunks and exactly one terminal message per request.
//!
//! All writes funnel through a single writer task, so the channel stays FIFO
//! while capability invocations run concurrently. Per-request ordering is
//! preserved: the terminal message is sent only after that request's output
//! forwarder has drained.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::capability::{Capability, CapabilityTable, Invocation, OutputSink};
use crate::channel::{BridgeChannel, MessageWriter};
use crate::codec::Decoded;
use crate::protocol::{Argument, Message, RequestId};

/// Host-side bridge over one channel to the command server.
pub struct CommandBridge {
    capabilities: Arc<CapabilityTable>,
}

impl CommandBridge {
    pub fn new(capabilities: Arc<CapabilityTable>) -> Self {
        Self { capabilities }
    }

    /// Serve the channel until the command server closes it.
    pub async fn serve(&self, channel: BridgeChannel) -> io::Result<()> {
        let (mut reader, writer) = channel.into_parts();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, writer_rx));

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Decoded::Valid(message)) => self.dispatch(message, &writer_tx),
                Ok(Decoded::Malformed { error }) => {
                    tracing::warn!(%error, "Discarding malformed frame");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Channel read error");
                    break;
                }
            }
        }

        tracing::debug!("Bridge channel closed");
        drop(writer_tx);
        let _ = writer_task.await;
        Ok(())
    }

    fn dispatch(&self, message: Message, writer_tx: &mpsc::UnboundedSender<Message>) {
        match message {
            Message::Ready => {
                tracing::debug!("Command server announced ready");
            }
            Message::DiscoverCapabilities => {
                let capabilities = self.capabilities.specs();
                tracing::debug!(count = capabilities.len(), "Answering capability discovery");
                let _ = writer_tx.send(Message::CapabilityList { capabilities });
            }
            Message::ExecuteCommand {
                request_id,
                command,
                args,
            } => match self.capabilities.get(&command) {
                Some(handler) => {
                    tracing::debug!(%request_id, %command, "Executing command");
                    let writer_tx = writer_tx.clone();
                    tokio::spawn(execute(handler, request_id, command, args, writer_tx));
                }
                None => {
                    // Reported back over the channel, never raised locally.
                    tracing::warn!(%request_id, %command, "Unknown command requested");
                    let _ = writer_tx.send(Message::CommandError {
                        request_id,
                        message: format!("unknown command: {}", command),
                    });
                }
            },
            other => {
                tracing::warn!(?other, "Unexpected message on host channel");
            }
        }
    }
}

async fn execute(
    handler: Arc<dyn Capability>,
    request_id: RequestId,
    command: String,
    args: Argument,
    writer_tx: mpsc::UnboundedSender<Message>,
) {
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
    let sink = OutputSink::new(chunk_tx);

    let forwarder = {
        let writer_tx = writer_tx.clone();
        let request_id = request_id.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let message = Message::CommandOutput {
                    request_id: request_id.clone(),
                    chunk,
                };
                if writer_tx.send(message).is_err() {
                    break;
                }
            }
        })
    };

    let result = handler.invoke(Invocation::normalize(args), sink).await;

    // The sink is gone once invoke returns; wait for the forwarder so every
    // output chunk precedes the terminal message.
    let _ = forwarder.await;

    let terminal = match result {
        Ok(value) => {
            tracing::debug!(%request_id, %command, "Command succeeded");
            Message::CommandResult { request_id, value }
        }
        Err(e) => {
            tracing::debug!(%request_id, %command, error = %e, "Command failed");
            Message::CommandError {
                request_id,
                message: e.to_string(),
            }
        }
    };
    let _ = writer_tx.send(terminal);
}

async fn write_loop(mut writer: MessageWriter, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.send(message).await {
            tracing::warn!(error = %e, "Channel write failed");
            break;
        }
    }
}
