//! Per-message gRPC compression (§4.6): negotiated via `grpc-encoding` /
//! `grpc-accept-encoding`, applied to one message frame at a time.

mod compressors;
mod errors;

#[cfg(feature = "gzip")]
mod gzip;
#[cfg(feature = "zstd")]
mod zstd;

pub(crate) use self::compressors::IDENTITY;
pub(crate) use self::errors::DecompressionError;

use bytes::BytesMut;

pub(crate) const ENCODING_HEADER: &str = "grpc-encoding";
pub(crate) const ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// A negotiated compression algorithm, identified by its `grpc-encoding` name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionEncoding(&'static str);

impl CompressionEncoding {
    /// Parses a `grpc-encoding` header value into a known encoding, if this
    /// build of the crate has a compressor registered for it.
    pub(crate) fn from_header_value(value: &str) -> Option<Self> {
        if value == IDENTITY {
            return None;
        }
        compressors::get(value).map(|c| CompressionEncoding(c.name()))
    }

    pub(crate) fn as_str(&self) -> &'static str {
        self.0
    }
}

/// The value to advertise in `grpc-accept-encoding`: every compressor this
/// build was compiled with support for.
pub(crate) fn accept_encoding_header_value() -> String {
    compressors::get_accept_encoding_header()
}

/// Picks the first encoding in `accept_encoding` (a comma-separated
/// `grpc-accept-encoding` value) that a locally registered compressor
/// supports.
pub(crate) fn negotiate(accept_encoding: &str) -> Option<CompressionEncoding> {
    accept_encoding
        .split(',')
        .map(str::trim)
        .find_map(CompressionEncoding::from_header_value)
}

pub(crate) fn compress(
    encoding: CompressionEncoding,
    uncompressed: &BytesMut,
    out: &mut BytesMut,
) -> Result<(), DecompressionError> {
    let compressor = compressors::get(encoding.as_str()).ok_or_else(|| DecompressionError::NotFound {
        requested: encoding.as_str().to_string(),
        known: compressors::names(),
    })?;
    compressor.compress(uncompressed, out)?;
    Ok(())
}

pub(crate) fn decompress(
    encoding: CompressionEncoding,
    compressed: &BytesMut,
    out: &mut BytesMut,
) -> Result<(), DecompressionError> {
    let compressor = compressors::get(encoding.as_str()).ok_or_else(|| DecompressionError::NotFound {
        requested: encoding.as_str().to_string(),
        known: compressors::names(),
    })?;
    compressor.decompress(compressed, out)?;
    Ok(())
}
