use bytes::BytesMut;
use once_cell::sync::Lazy;
use std::{collections::HashMap, io};

pub(crate) const IDENTITY: &str = "identity";

/// List of known compressors, keyed by their `grpc-encoding` name.
static COMPRESSORS: Lazy<HashMap<String, Box<dyn Compressor>>> = Lazy::new(|| {
    let mut m: HashMap<String, Box<dyn Compressor>> = HashMap::new();

    let mut add = |compressor: Box<dyn Compressor>| {
        m.insert(compressor.name().to_string(), compressor);
    };

    #[cfg(feature = "gzip")]
    add(Box::new(super::gzip::GZipCompressor));

    #[cfg(feature = "zstd")]
    add(Box::new(super::zstd::ZstdCompressor));

    m
});

/// Get a compressor from its `grpc-encoding` name.
pub(crate) fn get(name: impl AsRef<str>) -> Option<&'static dyn Compressor> {
    COMPRESSORS.get(name.as_ref()).map(|c| c.as_ref())
}

/// Get all known compressor names.
pub(crate) fn names() -> Vec<String> {
    COMPRESSORS.keys().cloned().collect()
}

/// Compresses and decompresses a single gRPC message body.
pub(crate) trait Compressor: Sync + Send {
    /// The name of this compressor as it appears in `grpc-encoding`/`grpc-accept-encoding`.
    fn name(&self) -> &'static str;

    /// Decompress all of `in_buffer` into `out_buffer`.
    fn decompress(&self, in_buffer: &BytesMut, out_buffer: &mut BytesMut) -> io::Result<()>;

    /// Compress all of `in_buffer` into `out_buffer`.
    fn compress(&self, in_buffer: &BytesMut, out_buffer: &mut BytesMut) -> io::Result<()>;
}

pub(crate) fn get_accept_encoding_header() -> String {
    COMPRESSORS.keys().map(|s| &**s).collect::<Vec<_>>().join(",")
}
