use std::io;

use super::Compressor;
use bytes::{BufMut, BytesMut};
use flate2::bufread::{GzDecoder, GzEncoder};
use flate2::Compression;

/// `gzip` per RFC 1952, matching the `grpc-encoding: gzip` wire convention.
#[derive(Debug)]
pub(crate) struct GZipCompressor;

impl Compressor for GZipCompressor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn decompress(&self, in_buffer: &BytesMut, out_buffer: &mut BytesMut) -> io::Result<()> {
        let mut decoder = GzDecoder::new(&in_buffer[..]);
        let mut writer = out_buffer.writer();
        io::copy(&mut decoder, &mut writer)?;
        Ok(())
    }

    fn compress(&self, in_buffer: &BytesMut, out_buffer: &mut BytesMut) -> io::Result<()> {
        let mut encoder = GzEncoder::new(&in_buffer[..], Compression::default());
        let mut writer = out_buffer.writer();
        io::copy(&mut encoder, &mut writer)?;
        Ok(())
    }
}
