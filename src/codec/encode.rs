use super::compression::{compress, CompressionEncoding};
use super::{EncodeBuf, Encoder};
use crate::Status;
use bytes::{BufMut, Bytes, BytesMut};

/// 1 byte compressed-flag + 4 byte big-endian length, per the gRPC wire format.
pub(crate) const HEADER_SIZE: usize = 5;

/// Encodes one message into a single length-prefixed gRPC frame (§4.6),
/// compressing it first if `compression` was negotiated for this call.
pub(crate) fn encode_message<T>(
    encoder: &mut T,
    item: T::Item,
    compression: Option<CompressionEncoding>,
    max_message_size: Option<usize>,
) -> Result<Bytes, Status>
where
    T: Encoder<Error = Status>,
{
    let buffer_size = encoder.buffer_settings().buffer_size;
    let mut buf = BytesMut::with_capacity(buffer_size.max(HEADER_SIZE));
    buf.resize(HEADER_SIZE, 0);

    let compressed = match compression {
        Some(encoding) => {
            let mut uncompressed = BytesMut::with_capacity(buffer_size);
            encoder
                .encode(item, &mut EncodeBuf::new(&mut uncompressed))
                .map_err(|err| Status::internal(format!("error encoding message: {err}")))?;
            compress(encoding, &uncompressed, &mut buf)
                .map_err(|err| Status::internal(format!("error compressing message: {err}")))?;
            true
        }
        None => {
            encoder
                .encode(item, &mut EncodeBuf::new(&mut buf))
                .map_err(|err| Status::internal(format!("error encoding message: {err}")))?;
            false
        }
    };

    let len = buf.len() - HEADER_SIZE;
    if let Some(max) = max_message_size {
        if len > max {
            return Err(Status::resource_exhausted(format!(
                "message length too large: found {len} bytes, the limit is {max} bytes"
            )));
        }
    }
    let len_u32 = u32::try_from(len)
        .map_err(|_| Status::resource_exhausted("encoded message length overflows u32"))?;

    buf[0] = compressed as u8;
    (&mut buf[1..HEADER_SIZE]).put_u32(len_u32);

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferSettings;

    #[derive(Default)]
    struct RawEncoder;

    impl Encoder for RawEncoder {
        type Item = Vec<u8>;
        type Error = Status;

        fn encode(&mut self, item: Self::Item, buf: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
            buf.reserve(item.len());
            buf.put(&item[..]);
            Ok(())
        }

        fn buffer_settings(&self) -> BufferSettings {
            BufferSettings::default()
        }
    }

    #[test]
    fn frame_has_correct_header() {
        let mut encoder = RawEncoder;
        let msg = vec![1u8, 2, 3, 4];
        let frame = encode_message(&mut encoder, msg.clone(), None, None).unwrap();

        assert_eq!(frame[0], 0);
        assert_eq!(u32::from_be_bytes(frame[1..5].try_into().unwrap()), msg.len() as u32);
        assert_eq!(&frame[5..], &msg[..]);
    }

    #[test]
    fn message_over_limit_is_resource_exhausted() {
        let mut encoder = RawEncoder;
        let msg = vec![0u8; 16];
        let err = encode_message(&mut encoder, msg, None, Some(4)).unwrap_err();
        assert_eq!(err.code(), crate::Code::ResourceExhausted);
    }
}
