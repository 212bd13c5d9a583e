//! Message encoding and decoding (§4.6): frames a single protobuf message
//! into (or out of) the length-prefixed gRPC wire format, with optional
//! per-message compression.

mod buffer;
pub(crate) mod compression;
mod decode;
mod encode;
#[cfg(feature = "prost")]
mod prost;

pub(crate) use self::buffer::{DecodeBuf, EncodeBuf};
pub(crate) use self::decode::MessageReader;
pub(crate) use self::encode::{encode_message, HEADER_SIZE};
#[cfg(feature = "prost")]
pub use self::prost::ProstCodec;

/// Knows how to encode a message into an [`EncodeBuf`].
pub trait Encoder {
    type Item;
    type Error;

    fn encode(&mut self, item: Self::Item, buf: &mut EncodeBuf<'_>) -> Result<(), Self::Error>;

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

/// Knows how to decode a message from a [`DecodeBuf`] holding exactly one
/// message's uncompressed bytes.
pub trait Decoder {
    type Item;
    type Error;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error>;

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

/// Hints for how much buffer space a codec expects to need.
#[derive(Clone, Copy, Debug)]
pub struct BufferSettings {
    pub buffer_size: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings { buffer_size: 8 * 1024 }
    }
}

/// A pair of encoder/decoder constructors for one message format, e.g. protobuf via prost.
pub trait Codec: Default {
    type Encode: Send + 'static;
    type Decode: Send + 'static;

    type Encoder: Encoder<Item = Self::Encode, Error = crate::Status> + Send + 'static;
    type Decoder: Decoder<Item = Self::Decode, Error = crate::Status> + Send + 'static;

    fn encoder(&mut self) -> Self::Encoder;
    fn decoder(&mut self) -> Self::Decoder;
}
