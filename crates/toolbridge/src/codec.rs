//! Framed codec for the bridge channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (child stdio, sockets, test pipes).
//!
//! Parsing never fails the stream across the channel boundary: a frame whose
//! body is not valid JSON decodes to [`Decoded::Malformed`], which receivers
//! log and discard. Only genuine I/O faults surface as stream errors.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Decode outcome for a single frame.
#[derive(Debug)]
pub enum Decoded<T> {
    Valid(T),
    /// Frame consumed but body unparseable; safe to drop and keep reading.
    Malformed { error: String },
}

/// Codec that frames messages with a 4-byte length prefix and serializes
/// with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Decoded<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(item) => Ok(Some(Decoded::Valid(item))),
                Err(e) => Ok(Some(Decoded::Malformed {
                    error: e.to_string(),
                })),
            },
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
