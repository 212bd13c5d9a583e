use super::{CallOptions, MethodDescriptor};
use crate::body::{boxed, BoxBody};
use crate::codec::compression::{self, CompressionEncoding, ACCEPT_ENCODING_HEADER, ENCODING_HEADER};
use crate::codec::{encode_message, Codec, Decoder, Encoder, MessageReader};
use crate::metadata::{GrpcTimeout, MetadataMap, GRPC_TIMEOUT_HEADER};
use crate::status::infer_grpc_status;
use crate::subchannel::Subchannel;
use crate::{Code, Request, Response, Status};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, TE};
use http::uri::{Authority, Parts, Scheme};
use http::Uri;
use http_body_util::{BodyExt, Full, StreamBody};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const CONTENT_TYPE_GRPC: &str = "application/grpc";

fn build_uri(scheme: &Scheme, authority: &Authority, method: &MethodDescriptor) -> Uri {
    let mut parts = Parts::default();
    parts.scheme = Some(scheme.clone());
    parts.authority = Some(authority.clone());
    parts.path_and_query = Some(method.path_and_query());
    Uri::from_parts(parts).expect("scheme, authority and path form a valid uri")
}

fn response_encoding(headers: &http::HeaderMap) -> Option<CompressionEncoding> {
    headers
        .get(ENCODING_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(CompressionEncoding::from_header_value)
}

/// Builds and sends one HTTP/2 request for this attempt (§4.6 wire-level
/// contract): `TE: trailers`, `content-type: application/grpc`, negotiated
/// compression headers, and `grpc-timeout` if a deadline was given.
async fn send_attempt(
    subchannel: &Subchannel,
    scheme: &Scheme,
    authority: &Authority,
    method: &MethodDescriptor,
    options: &CallOptions,
    metadata: MetadataMap,
    body: BoxBody,
) -> Result<http::Response<BoxBody>, Status> {
    let uri = build_uri(scheme, authority, method);
    let request = Request::from_parts(metadata, body);
    let mut http_request = request.into_http(uri);

    let headers = http_request.headers_mut();
    headers.insert(TE, HeaderValue::from_static("trailers"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));

    let accept_encoding = compression::accept_encoding_header_value();
    if !accept_encoding.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&accept_encoding) {
            headers.insert(ACCEPT_ENCODING_HEADER, value);
        }
    }
    if let Some(encoding) = options.compression {
        headers.insert(ENCODING_HEADER, HeaderValue::from_static(encoding.as_str()));
    }
    if let Some(timeout) = options.timeout {
        headers.insert(GRPC_TIMEOUT_HEADER, HeaderValue::from(GrpcTimeout::from(timeout)));
    }

    subchannel.transport().send(http_request).await
}

fn single_message_body<T>(
    encoder: &mut T,
    item: T::Item,
    compression: Option<CompressionEncoding>,
    max_send_message_size: Option<usize>,
) -> Result<BoxBody, Status>
where
    T: Encoder<Error = Status>,
{
    let frame = encode_message(encoder, item, compression, max_send_message_size)?;
    Ok(boxed(Full::new(frame).map_err(|never: Infallible| match never {})))
}

/// Spawns a task pulling messages off `rx`, framing and (optionally)
/// compressing each one, and feeding them into the request body as they
/// arrive — the "finite sequence of Send operations followed by Complete"
/// request writer contract (§4.6).
fn streamed_request_body<Enc>(
    mut encoder: Enc,
    mut rx: mpsc::Receiver<Enc::Item>,
    compression: Option<CompressionEncoding>,
    max_send_message_size: Option<usize>,
) -> BoxBody
where
    Enc: Encoder<Error = Status> + Send + 'static,
    Enc::Item: Send + 'static,
{
    let (tx, body_rx) = mpsc::channel::<Result<http_body::Frame<Bytes>, Status>>(1);

    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let frame = encode_message(&mut encoder, item, compression, max_send_message_size)
                .map(http_body::Frame::data);
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    boxed(StreamBody::new(ReceiverStream::new(body_rx)))
}

/// Reads exactly one response message, the null-response and too-many-
/// messages edge cases from §4.6, then folds any trailing metadata into the
/// response.
async fn read_unary_response<D>(
    mut decoder: D,
    response: http::Response<BoxBody>,
    options: &CallOptions,
) -> Result<Response<D::Item>, Status>
where
    D: Decoder<Error = Status>,
{
    let (parts, body) = response.into_parts();

    if let Some(status) = Status::from_header_map(&parts.headers) {
        if status.code() != Code::Ok {
            return Err(status);
        }
    }

    let encoding = response_encoding(&parts.headers);
    let mut reader = MessageReader::new(body, options.max_recv_message_size);

    let message = reader
        .read_message(&mut decoder, encoding)
        .await?
        .ok_or_else(|| Status::new(Code::Cancelled, "No message returned from method."))?;

    if reader.read_message(&mut decoder, encoding).await?.is_some() {
        return Err(Status::internal("Too many messages returned for unary call."));
    }

    let trailers = reader.take_trailers();
    infer_grpc_status(trailers.as_ref(), parts.status)?;

    let mut metadata = MetadataMap::from_headers(parts.headers);
    if let Some(trailers) = trailers {
        metadata.merge(trailers);
    }

    Ok(Response::from_parts(metadata, message))
}

fn open_response_stream<D>(
    decoder: D,
    response: http::Response<BoxBody>,
    options: &CallOptions,
) -> Result<Response<ResponseStream<D>>, Status>
where
    D: Decoder<Error = Status>,
{
    let (parts, body) = response.into_parts();

    if let Some(status) = Status::from_header_map(&parts.headers) {
        if status.code() != Code::Ok {
            return Err(status);
        }
    }

    let compression = response_encoding(&parts.headers);
    let status_code = parts.status;
    let metadata = MetadataMap::from_headers(parts.headers);
    let reader = MessageReader::new(body, options.max_recv_message_size);

    Ok(Response::from_parts(
        metadata,
        ResponseStream {
            reader,
            decoder,
            compression,
            status_code,
        },
    ))
}

/// A lazy, non-restartable response reader (§4.6): each `message()` call
/// pulls the next frame, or `None` at clean end-of-stream, or `Err` once the
/// trailing `grpc-status` is non-OK.
pub struct ResponseStream<D> {
    reader: MessageReader<BoxBody>,
    decoder: D,
    compression: Option<CompressionEncoding>,
    status_code: http::StatusCode,
}

impl<D> ResponseStream<D>
where
    D: Decoder<Error = Status>,
{
    pub async fn message(&mut self) -> Result<Option<D::Item>, Status> {
        match self.reader.read_message(&mut self.decoder, self.compression).await? {
            Some(item) => Ok(Some(item)),
            None => {
                let trailers = self.reader.take_trailers();
                infer_grpc_status(trailers.as_ref(), self.status_code)?;
                Ok(None)
            }
        }
    }
}

pub(crate) async fn unary<C>(
    subchannel: &Subchannel,
    scheme: &Scheme,
    authority: &Authority,
    method: &MethodDescriptor,
    mut codec: C,
    request: Request<C::Encode>,
    options: &CallOptions,
) -> Result<Response<C::Decode>, Status>
where
    C: Codec,
{
    let (metadata, message) = request.into_parts();
    let body = single_message_body(
        &mut codec.encoder(),
        message,
        options.compression,
        options.max_send_message_size,
    )?;

    let response = send_attempt(subchannel, scheme, authority, method, options, metadata, body).await?;
    read_unary_response(codec.decoder(), response, options).await
}

pub(crate) async fn client_streaming<C>(
    subchannel: &Subchannel,
    scheme: &Scheme,
    authority: &Authority,
    method: &MethodDescriptor,
    mut codec: C,
    request: Request<mpsc::Receiver<C::Encode>>,
    options: &CallOptions,
) -> Result<Response<C::Decode>, Status>
where
    C: Codec,
{
    let (metadata, receiver) = request.into_parts();
    let body = streamed_request_body(
        codec.encoder(),
        receiver,
        options.compression,
        options.max_send_message_size,
    );

    let response = send_attempt(subchannel, scheme, authority, method, options, metadata, body).await?;
    read_unary_response(codec.decoder(), response, options).await
}

pub(crate) async fn server_streaming<C>(
    subchannel: &Subchannel,
    scheme: &Scheme,
    authority: &Authority,
    method: &MethodDescriptor,
    mut codec: C,
    request: Request<C::Encode>,
    options: &CallOptions,
) -> Result<Response<ResponseStream<C::Decoder>>, Status>
where
    C: Codec,
{
    let (metadata, message) = request.into_parts();
    let body = single_message_body(
        &mut codec.encoder(),
        message,
        options.compression,
        options.max_send_message_size,
    )?;

    let response = send_attempt(subchannel, scheme, authority, method, options, metadata, body).await?;
    open_response_stream(codec.decoder(), response, options)
}

pub(crate) async fn streaming<C>(
    subchannel: &Subchannel,
    scheme: &Scheme,
    authority: &Authority,
    method: &MethodDescriptor,
    mut codec: C,
    request: Request<mpsc::Receiver<C::Encode>>,
    options: &CallOptions,
) -> Result<Response<ResponseStream<C::Decoder>>, Status>
where
    C: Codec,
{
    let (metadata, receiver) = request.into_parts();
    let body = streamed_request_body(
        codec.encoder(),
        receiver,
        options.compression,
        options.max_send_message_size,
    );

    let response = send_attempt(subchannel, scheme, authority, method, options, metadata, body).await?;
    open_response_stream(codec.decoder(), response, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferSettings;
    use crate::transport::{ConnectOutcome, SubchannelTransport, TransportListener};
    use crate::types::BalancerAddress;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct BytesCodec;

    impl Encoder for BytesCodec {
        type Item = Vec<u8>;
        type Error = Status;

        fn encode(&mut self, item: Self::Item, buf: &mut crate::codec::EncodeBuf<'_>) -> Result<(), Self::Error> {
            use bytes::BufMut;
            buf.reserve(item.len());
            buf.put(&item[..]);
            Ok(())
        }

        fn buffer_settings(&self) -> BufferSettings {
            BufferSettings::default()
        }
    }

    impl Decoder for BytesCodec {
        type Item = Vec<u8>;
        type Error = Status;

        fn decode(&mut self, buf: &mut crate::codec::DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
            use bytes::Buf;
            Ok(Some(buf.copy_to_bytes(buf.remaining()).to_vec()))
        }
    }

    impl Codec for BytesCodec {
        type Encode = Vec<u8>;
        type Decode = Vec<u8>;
        type Encoder = BytesCodec;
        type Decoder = BytesCodec;

        fn encoder(&mut self) -> Self::Encoder {
            BytesCodec
        }

        fn decoder(&mut self) -> Self::Decoder {
            BytesCodec
        }
    }

    /// A transport that always reports Ready and answers a single `send` with
    /// a pre-scripted response built from frames and trailers handed to it at
    /// construction.
    struct ScriptedTransport {
        response: Mutex<Option<ScriptedResponse>>,
    }

    struct ScriptedResponse {
        status: http::StatusCode,
        headers: http::HeaderMap,
        frames: Vec<Bytes>,
        trailers: Option<http::HeaderMap>,
    }

    impl ScriptedTransport {
        fn new(response: ScriptedResponse) -> Arc<Self> {
            Arc::new(ScriptedTransport {
                response: Mutex::new(Some(response)),
            })
        }
    }

    #[async_trait]
    impl SubchannelTransport for ScriptedTransport {
        async fn try_connect(&self, _addr: std::net::SocketAddr, _timeout: std::time::Duration) -> ConnectOutcome {
            ConnectOutcome::Success
        }

        async fn send(&self, _request: http::Request<BoxBody>) -> Result<http::Response<BoxBody>, Status> {
            let scripted = self
                .response
                .lock()
                .unwrap()
                .take()
                .expect("scripted transport only handles one request in these tests");

            let mut frames: Vec<Result<http_body::Frame<Bytes>, Status>> =
                scripted.frames.into_iter().map(|b| Ok(http_body::Frame::data(b))).collect();
            if let Some(trailers) = scripted.trailers {
                frames.push(Ok(http_body::Frame::trailers(trailers)));
            }

            let body = boxed(http_body_util::StreamBody::new(tokio_stream::iter(frames)));

            let mut response = http::Response::new(body);
            *response.status_mut() = scripted.status;
            *response.headers_mut() = scripted.headers;
            Ok(response)
        }

        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn close(&self) {}
    }

    fn test_subchannel(response: ScriptedResponse) -> Arc<Subchannel> {
        let transport = ScriptedTransport::new(response);
        let addr = BalancerAddress::new("127.0.0.1:0".parse().unwrap());
        Subchannel::new(vec![addr], transport, std::time::Duration::from_secs(1))
    }

    fn method() -> MethodDescriptor {
        MethodDescriptor::new("test.Service", "Method")
    }

    fn frame(payload: &[u8]) -> Bytes {
        encode_message(&mut BytesCodec, payload.to_vec(), None, None).unwrap()
    }

    fn ok_trailers() -> http::HeaderMap {
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        trailers
    }

    #[tokio::test]
    async fn unary_round_trip() {
        let subchannel = test_subchannel(ScriptedResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            frames: vec![frame(b"pong")],
            trailers: Some(ok_trailers()),
        });

        let response = unary(
            &subchannel,
            &Scheme::HTTP,
            &"localhost:1".parse().unwrap(),
            &method(),
            BytesCodec,
            Request::new(b"ping".to_vec()),
            &CallOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(response.into_inner(), b"pong".to_vec());
    }

    #[tokio::test]
    async fn unary_with_no_response_message_is_cancelled() {
        let subchannel = test_subchannel(ScriptedResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            frames: vec![],
            trailers: Some(ok_trailers()),
        });

        let err = unary(
            &subchannel,
            &Scheme::HTTP,
            &"localhost:1".parse().unwrap(),
            &method(),
            BytesCodec,
            Request::new(b"ping".to_vec()),
            &CallOptions::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn unary_with_too_many_messages_is_internal() {
        let subchannel = test_subchannel(ScriptedResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            frames: vec![frame(b"one"), frame(b"two")],
            trailers: Some(ok_trailers()),
        });

        let err = unary(
            &subchannel,
            &Scheme::HTTP,
            &"localhost:1".parse().unwrap(),
            &method(),
            BytesCodec,
            Request::new(b"ping".to_vec()),
            &CallOptions::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn server_streaming_clean_end_returns_none() {
        let subchannel = test_subchannel(ScriptedResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            frames: vec![frame(b"one"), frame(b"two")],
            trailers: Some(ok_trailers()),
        });

        let response = server_streaming(
            &subchannel,
            &Scheme::HTTP,
            &"localhost:1".parse().unwrap(),
            &method(),
            BytesCodec,
            Request::new(b"ping".to_vec()),
            &CallOptions::default(),
        )
        .await
        .unwrap();

        let mut stream = response.into_inner();
        assert_eq!(stream.message().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(stream.message().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(stream.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_streaming_non_ok_trailer_surfaces_as_err() {
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("2"));
        trailers.insert("grpc-message", http::HeaderValue::from_static("boom"));

        let subchannel = test_subchannel(ScriptedResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            frames: vec![frame(b"one")],
            trailers: Some(trailers),
        });

        let response = server_streaming(
            &subchannel,
            &Scheme::HTTP,
            &"localhost:1".parse().unwrap(),
            &method(),
            BytesCodec,
            Request::new(b"ping".to_vec()),
            &CallOptions::default(),
        )
        .await
        .unwrap();

        let mut stream = response.into_inner();
        assert_eq!(stream.message().await.unwrap(), Some(b"one".to_vec()));
        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Unknown);
        assert_eq!(err.message(), "boom");
    }

    #[tokio::test]
    async fn client_streaming_round_trip() {
        let subchannel = test_subchannel(ScriptedResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            frames: vec![frame(b"ack")],
            trailers: Some(ok_trailers()),
        });

        let (tx, rx) = mpsc::channel(4);
        tx.send(b"one".to_vec()).await.unwrap();
        tx.send(b"two".to_vec()).await.unwrap();
        drop(tx);

        let response = client_streaming(
            &subchannel,
            &Scheme::HTTP,
            &"localhost:1".parse().unwrap(),
            &method(),
            BytesCodec,
            Request::new(rx),
            &CallOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(response.into_inner(), b"ack".to_vec());
    }
}
