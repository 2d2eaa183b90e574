//! Framed duplex channel carrying the bridge protocol.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{Decoded, JsonCodec};
use crate::protocol::Message;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) type MessageReader = FramedRead<BoxedRead, JsonCodec<Message>>;
pub(crate) type MessageWriter = FramedWrite<BoxedWrite, JsonCodec<Message>>;

/// One end of the host-server channel.
///
/// The halves are boxed so the same type carries child stdio, a socket, or an
/// in-memory pipe in tests.
pub struct BridgeChannel {
    reader: MessageReader,
    writer: MessageWriter,
}

impl BridgeChannel {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: FramedRead::new(Box::new(reader), JsonCodec::new()),
            writer: FramedWrite::new(Box::new(writer), JsonCodec::new()),
        }
    }

    /// Next well-formed message; malformed frames are logged and dropped.
    /// `None` once the channel is closed or unreadable.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.reader.next().await? {
                Ok(Decoded::Valid(message)) => return Some(message),
                Ok(Decoded::Malformed { error }) => {
                    tracing::warn!(%error, "Discarding malformed frame");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Channel read error");
                    return None;
                }
            }
        }
    }

    pub async fn send(&mut self, message: Message) -> io::Result<()> {
        self.writer.send(message).await
    }

    pub(crate) fn into_parts(self) -> (MessageReader, MessageWriter) {
        (self.reader, self.writer)
    }
}
