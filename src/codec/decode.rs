use super::compression::{decompress, CompressionEncoding};
use super::{DecodeBuf, Decoder, HEADER_SIZE};
use crate::Status;
use bytes::{Buf, Bytes, BytesMut};
use http_body::Body;
use http_body_util::BodyExt;
use std::pin::Pin;

/// Pulls complete gRPC frames off a body and decodes them one at a time,
/// matching the Call Runtime's `ReadMessage` primitive (§4.6): each call
/// reads and returns the next message, or `None` once the body ends cleanly.
pub(crate) struct MessageReader<B> {
    body: Pin<Box<B>>,
    buf: BytesMut,
    max_message_size: Option<usize>,
    finished: bool,
    trailers: Option<http::HeaderMap>,
}

impl<B> MessageReader<B>
where
    B: Body<Data = Bytes, Error = Status>,
{
    pub(crate) fn new(body: B, max_message_size: Option<usize>) -> Self {
        MessageReader {
            body: Box::pin(body),
            buf: BytesMut::new(),
            max_message_size,
            finished: false,
            trailers: None,
        }
    }

    /// Returns the trailers frame seen at the end of the body, if any.
    ///
    /// Only meaningful once `read_message` has returned `Ok(None)`.
    pub(crate) fn take_trailers(&mut self) -> Option<http::HeaderMap> {
        self.trailers.take()
    }

    /// Reads the next message, decompressing it with `compression` if the
    /// frame's compressed flag is set.
    pub(crate) async fn read_message<D>(
        &mut self,
        decoder: &mut D,
        compression: Option<CompressionEncoding>,
    ) -> Result<Option<D::Item>, Status>
    where
        D: Decoder<Error = Status>,
    {
        loop {
            if let Some(item) = self.try_decode_one(decoder, compression)? {
                return Ok(Some(item));
            }

            if self.finished {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Status::internal("unexpected end of stream mid-frame"));
            }

            match self.body.as_mut().frame().await {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => self.buf.extend_from_slice(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers = Some(trailers);
                        }
                        self.finished = true;
                    }
                },
                Some(Err(status)) => return Err(status),
                None => self.finished = true,
            }
        }
    }

    fn try_decode_one<D>(
        &mut self,
        decoder: &mut D,
        compression: Option<CompressionEncoding>,
    ) -> Result<Option<D::Item>, Status>
    where
        D: Decoder<Error = Status>,
    {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let compressed_flag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;

        if let Some(max) = self.max_message_size {
            if len > max {
                return Err(Status::resource_exhausted(format!(
                    "message length too large: found {len} bytes, the limit is {max} bytes"
                )));
            }
        }

        if self.buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_SIZE);
        let mut message = self.buf.split_to(len);

        if compressed_flag == 1 {
            let encoding = compression.ok_or_else(|| {
                Status::internal(
                    "protocol error: received a compressed message but no grpc-encoding was negotiated",
                )
            })?;
            let mut decompressed = BytesMut::new();
            decompress(encoding, &message, &mut decompressed)
                .map_err(|err| Status::internal(format!("error decompressing message: {err}")))?;
            message = decompressed;
        }

        let message_len = message.len();
        decoder
            .decode(&mut DecodeBuf::new(&mut message, message_len))
            .map_err(|err| Status::internal(format!("error decoding message: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferSettings;
    use bytes::BufMut;
    use http_body_util::StreamBody;

    #[derive(Default)]
    struct RawDecoder;

    impl Decoder for RawDecoder {
        type Item = Vec<u8>;
        type Error = Status;

        fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
            Ok(Some(buf.copy_to_bytes(buf.remaining()).to_vec()))
        }

        fn buffer_settings(&self) -> BufferSettings {
            BufferSettings::default()
        }
    }

    fn frame(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(payload.len() as u32);
        buf.put(payload);
        buf.freeze()
    }

    #[tokio::test]
    async fn reads_one_message_split_across_chunks() {
        let whole = frame(b"hello world");
        let (first, second) = whole.split_at(3);
        let chunks: Vec<Result<http_body::Frame<Bytes>, Status>> = vec![
            Ok(http_body::Frame::data(Bytes::copy_from_slice(first))),
            Ok(http_body::Frame::data(Bytes::copy_from_slice(second))),
        ];
        let body = StreamBody::new(tokio_stream::iter(chunks));

        let mut reader = MessageReader::new(body, None);
        let mut decoder = RawDecoder;
        let msg = reader.read_message(&mut decoder, None).await.unwrap().unwrap();
        assert_eq!(msg, b"hello world");
        assert!(reader.read_message(&mut decoder, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let whole = frame(&vec![0u8; 32]);
        let chunks: Vec<Result<http_body::Frame<Bytes>, Status>> = vec![Ok(http_body::Frame::data(whole))];
        let body = StreamBody::new(tokio_stream::iter(chunks));

        let mut reader = MessageReader::new(body, Some(8));
        let mut decoder = RawDecoder;
        let err = reader.read_message(&mut decoder, None).await.unwrap_err();
        assert_eq!(err.code(), crate::Code::ResourceExhausted);
    }
}
