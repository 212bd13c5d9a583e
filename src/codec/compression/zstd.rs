use std::io;

use super::Compressor;
use bytes::{BufMut, BytesMut};

/// `zstd`, offered alongside `gzip` as an alternate `grpc-encoding` (not part
/// of the core gRPC wire spec, but a common extension the reference
/// ecosystem supports).
#[derive(Debug)]
pub(crate) struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn decompress(&self, in_buffer: &BytesMut, out_buffer: &mut BytesMut) -> io::Result<()> {
        let mut writer = out_buffer.writer();
        zstd::stream::copy_decode(&in_buffer[..], &mut writer)
    }

    fn compress(&self, in_buffer: &BytesMut, out_buffer: &mut BytesMut) -> io::Result<()> {
        let mut writer = out_buffer.writer();
        zstd::stream::copy_encode(&in_buffer[..], &mut writer, 0)
    }
}
