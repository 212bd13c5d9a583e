//! Retry / Hedging Controller (§4.7): wraps a single unary attempt
//! (Call Runtime, §4.6) with re-pick-and-reissue, either sequentially
//! (retry) or as a timer-driven fan-out racing several attempts at once
//! (hedging). The two policies are mutually exclusive per method, so this
//! module dispatches on whichever one a method's [`MethodPolicy`] names.

use super::buffer::{CallBuffer, ChannelBudget};
use super::throttle::Throttle;
use crate::backoff::{Backoff, BackoffConfig};
use crate::call::{self, CallOptions, MethodDescriptor};
use crate::codec::{encode_message, Codec};
use crate::connection_manager::{ConnectionManager, PickOutcome};
use crate::metadata::MetadataMap;
use crate::service_config::{HedgingPolicy, MethodPolicy, RetryPolicy};
use crate::{Request, Response, Status};
use http::uri::{Authority, Scheme};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::boxed;
    use crate::codec::{encode_message as encode, BufferSettings, DecodeBuf, EncodeBuf, Decoder, Encoder};
    use crate::connection_manager::ConnectionManager;
    use crate::resolver::StaticResolver;
    use crate::target::Target;
    use crate::transport::{ConnectOutcome, SubchannelTransport, TransportListener};
    use crate::Code;
    use async_trait::async_trait;
    use bytes::{Buf, BufMut, Bytes};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct BytesCodec;

    impl Encoder for BytesCodec {
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

    impl Decoder for BytesCodec {
        type Item = Vec<u8>;
        type Error = Status;

        fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
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

    enum Scripted {
        Ok(&'static [u8]),
        Fail(Code),
    }

    fn scripted_response(outcome: &Scripted) -> http::Response<crate::body::BoxBody> {
        let mut trailers = http::HeaderMap::new();
        let body = match outcome {
            Scripted::Ok(payload) => {
                trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
                let frame = encode(&mut BytesCodec, payload.to_vec(), None, None).unwrap();
                vec![Ok(http_body::Frame::data(frame)), Ok(http_body::Frame::trailers(trailers))]
            }
            Scripted::Fail(code) => {
                trailers.insert(
                    "grpc-status",
                    http::HeaderValue::from_str(&(*code as i32).to_string()).unwrap(),
                );
                vec![Ok(http_body::Frame::trailers(trailers))]
            }
        };
        let body: Vec<Result<http_body::Frame<Bytes>, Status>> = body;
        let stream_body = http_body_util::StreamBody::new(tokio_stream::iter(body));
        let mut response = http::Response::new(boxed(stream_body));
        *response.status_mut() = http::StatusCode::OK;
        response
    }

    /// Answers a fixed, ordered script of per-attempt outcomes and counts how
    /// many attempts it actually served.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Scripted>) -> Arc<Self> {
            Arc::new(ScriptedTransport {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SubchannelTransport for ScriptedTransport {
        async fn try_connect(&self, _addr: std::net::SocketAddr, _timeout: Duration) -> ConnectOutcome {
            ConnectOutcome::Success
        }

        async fn send(
            &self,
            _request: http::Request<crate::body::BoxBody>,
        ) -> Result<http::Response<crate::body::BoxBody>, Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Scripted::Fail(Code::Unavailable));
            Ok(scripted_response(&outcome))
        }

        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn close(&self) {}
    }

    fn test_ctx(transport: Arc<ScriptedTransport>) -> (RetryContext, Arc<ScriptedTransport>) {
        let target = Target::from_shared("http://127.0.0.1:0").unwrap();
        let resolver = Box::new(StaticResolver::new(target));
        let factory_transport = Arc::clone(&transport);
        let manager = ConnectionManager::new(
            resolver,
            Arc::new(move || Arc::clone(&factory_transport) as Arc<dyn SubchannelTransport>),
            Duration::from_secs(1),
        );

        let ctx = RetryContext {
            manager,
            scheme: Scheme::HTTP,
            authority: "localhost:1".parse().unwrap(),
            throttle: None,
            buffer_budget: ChannelBudget::new(1 << 20),
            max_retry_buffer_per_call: 1 << 16,
        };
        (ctx, transport)
    }

    fn method() -> MethodDescriptor {
        MethodDescriptor::new("test.Service", "Method")
    }

    async fn wait_ready(ctx: &RetryContext) {
        ctx.manager.connect(true).await.unwrap();
    }

    #[tokio::test]
    async fn retry_succeeds_after_retryable_failures() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Fail(Code::Unavailable),
            Scripted::Fail(Code::Unavailable),
            Scripted::Ok(b"done"),
        ]);
        let (ctx, transport) = test_ctx(transport);
        wait_ready(&ctx).await;

        let policy = MethodPolicy::Retry(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            retryable_status_codes: vec![Code::Unavailable],
        });

        let response = call_unary::<BytesCodec>(
            &ctx,
            method(),
            Request::new(b"ping".to_vec()),
            CallOptions::default(),
            Some(&policy),
        )
        .await
        .unwrap();

        assert_eq!(response.into_inner(), b"done".to_vec());
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Fail(Code::Unavailable),
            Scripted::Fail(Code::Unavailable),
        ]);
        let (ctx, transport) = test_ctx(transport);
        wait_ready(&ctx).await;

        let policy = MethodPolicy::Retry(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            retryable_status_codes: vec![Code::Unavailable],
        });

        let err = call_unary::<BytesCodec>(
            &ctx,
            method(),
            Request::new(b"ping".to_vec()),
            CallOptions::default(),
            Some(&policy),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn retry_does_not_retry_non_retryable_status() {
        let transport = ScriptedTransport::new(vec![Scripted::Fail(Code::PermissionDenied)]);
        let (ctx, transport) = test_ctx(transport);
        wait_ready(&ctx).await;

        let policy = MethodPolicy::Retry(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            retryable_status_codes: vec![Code::Unavailable],
        });

        let err = call_unary::<BytesCodec>(
            &ctx,
            method(),
            Request::new(b"ping".to_vec()),
            CallOptions::default(),
            Some(&policy),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn hedging_commits_to_first_success_and_ignores_later_losers() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Fail(Code::Unavailable),
            Scripted::Fail(Code::Unavailable),
            Scripted::Ok(b"ok"),
        ]);
        let (ctx, transport) = test_ctx(transport);
        wait_ready(&ctx).await;

        let policy = MethodPolicy::Hedging(HedgingPolicy {
            max_attempts: 3,
            hedging_delay: Duration::from_millis(10),
            non_fatal_status_codes: vec![Code::Unavailable],
        });

        let response = call_unary::<BytesCodec>(
            &ctx,
            method(),
            Request::new(b"ping".to_vec()),
            CallOptions::default(),
            Some(&policy),
        )
        .await
        .unwrap();

        assert_eq!(response.into_inner(), b"ok".to_vec());
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn hedging_surfaces_last_status_once_every_attempt_is_non_fatal_and_exhausted() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Fail(Code::Unavailable),
            Scripted::Fail(Code::Unavailable),
        ]);
        let (ctx, transport) = test_ctx(transport);
        wait_ready(&ctx).await;

        let policy = MethodPolicy::Hedging(HedgingPolicy {
            max_attempts: 2,
            hedging_delay: Duration::from_millis(10),
            non_fatal_status_codes: vec![Code::Unavailable],
        });

        let err = call_unary::<BytesCodec>(
            &ctx,
            method(),
            Request::new(b"ping".to_vec()),
            CallOptions::default(),
            Some(&policy),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn no_policy_means_exactly_one_attempt() {
        let transport = ScriptedTransport::new(vec![Scripted::Fail(Code::Unavailable)]);
        let (ctx, transport) = test_ctx(transport);
        wait_ready(&ctx).await;

        let err = call_unary::<BytesCodec>(
            &ctx,
            method(),
            Request::new(b"ping".to_vec()),
            CallOptions::default(),
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(transport.call_count(), 1);
    }

    struct NeverConnects;

    #[async_trait]
    impl SubchannelTransport for NeverConnects {
        async fn try_connect(&self, _addr: std::net::SocketAddr, _timeout: Duration) -> ConnectOutcome {
            std::future::pending::<()>().await;
            unreachable!("cancelled by the deadline before this resolves")
        }

        async fn send(
            &self,
            _request: http::Request<crate::body::BoxBody>,
        ) -> Result<http::Response<crate::body::BoxBody>, Status> {
            unreachable!("a call that times out while picking never reaches the transport")
        }

        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn deadline_while_waiting_for_ready_fails_without_issuing_a_request() {
        let target = Target::from_shared("http://127.0.0.1:0").unwrap();
        let resolver = Box::new(StaticResolver::new(target));
        let manager = ConnectionManager::new(
            resolver,
            Arc::new(|| Arc::new(NeverConnects) as Arc<dyn SubchannelTransport>),
            Duration::from_secs(5),
        );
        let ctx = RetryContext {
            manager,
            scheme: Scheme::HTTP,
            authority: "localhost:1".parse().unwrap(),
            throttle: None,
            buffer_budget: ChannelBudget::new(1 << 20),
            max_retry_buffer_per_call: 1 << 16,
        };

        let options = CallOptions {
            timeout: Some(Duration::from_millis(20)),
            wait_for_ready: true,
            ..CallOptions::default()
        };

        let err = call_unary::<BytesCodec>(&ctx, method(), Request::new(b"ping".to_vec()), options, None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::DeadlineExceeded);
    }
}

/// Everything a call needs to drive retries or hedging: where to pick from,
/// the channel-wide throttle and buffer budget, and how to reach the method.
pub(crate) struct RetryContext {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) scheme: Scheme,
    pub(crate) authority: Authority,
    pub(crate) throttle: Option<Arc<Throttle>>,
    pub(crate) buffer_budget: Arc<ChannelBudget>,
    pub(crate) max_retry_buffer_per_call: usize,
}

/// Drives one unary call to completion, applying `policy` if one is given
/// for this method. Calls with no matching policy get exactly one attempt.
///
/// The whole attempt — including the pick, every retry/hedge re-pick, and
/// each attempt's transport round trip — runs under `options.timeout`
/// (§4.6): cancellation is expressed by dropping the attempt future when the
/// deadline elapses, the same idiom `ConnectionManager`'s own suspending
/// methods document, rather than threading a cancellation token through.
pub(crate) async fn call_unary<C>(
    ctx: &RetryContext,
    method: MethodDescriptor,
    request: Request<C::Encode>,
    options: CallOptions,
    policy: Option<&MethodPolicy>,
) -> Result<Response<C::Decode>, Status>
where
    C: Codec,
    C::Encode: Clone + Send + 'static,
    C::Decode: Send + 'static,
{
    let timeout = options.timeout;
    let attempt = async move {
        match policy {
            Some(MethodPolicy::Retry(retry_policy)) => {
                retry_unary::<C>(ctx, method, request, options, retry_policy).await
            }
            Some(MethodPolicy::Hedging(hedging_policy)) => {
                let (metadata, message) = request.into_parts();
                hedge_unary::<C>(ctx, method, metadata, message, options, hedging_policy).await
            }
            None => {
                let (subchannel, _address) = match ctx.manager.pick_outcome(options.wait_for_ready).await {
                    PickOutcome::Picked(subchannel, address) => (subchannel, address),
                    PickOutcome::Dropped(status) | PickOutcome::Failed(status) => return Err(status),
                };
                call::unary(&subchannel, &ctx.scheme, &ctx.authority, &method, C::default(), request, &options).await
            }
        }
    };

    match timeout {
        Some(duration) => match tokio::time::timeout(duration, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded("deadline exceeded before the call completed")),
        },
        None => attempt.await,
    }
}

async fn retry_unary<C>(
    ctx: &RetryContext,
    method: MethodDescriptor,
    request: Request<C::Encode>,
    options: CallOptions,
    policy: &RetryPolicy,
) -> Result<Response<C::Decode>, Status>
where
    C: Codec,
    C::Encode: Clone + Send + 'static,
    C::Decode: Send + 'static,
{
    let (metadata, message) = request.into_parts();

    let mut buffer = CallBuffer::new(Arc::clone(&ctx.buffer_budget), ctx.max_retry_buffer_per_call);
    let reserved = {
        let mut encoder = C::default().encoder();
        let size = encode_message(&mut encoder, message.clone(), options.compression, options.max_send_message_size)?.len();
        buffer.try_add(size)
    };
    // A message too large to reserve still gets sent once; it simply cannot
    // be retried (§4.7 Buffering: "on failure to reserve, the call commits
    // to the current attempt").
    let retries_allowed = reserved;

    let mut backoff = Backoff::new(BackoffConfig {
        initial: policy.initial_backoff,
        max: policy.max_backoff,
        multiplier: policy.backoff_multiplier,
        jitter: 0.2,
    });

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        let (subchannel, _address) = match ctx.manager.pick_outcome(options.wait_for_ready).await {
            PickOutcome::Picked(subchannel, address) => (subchannel, address),
            // Drop bypasses retry and hedging unconditionally (§4.4, §4.7).
            PickOutcome::Dropped(status) => {
                buffer.release_all();
                return Err(status);
            }
            PickOutcome::Failed(status) => {
                buffer.release_all();
                return Err(status);
            }
        };

        let attempt_request = Request::from_parts(metadata.clone(), message.clone());
        let result = call::unary(&subchannel, &ctx.scheme, &ctx.authority, &method, C::default(), attempt_request, &options).await;

        match result {
            Ok(response) => {
                if let Some(throttle) = &ctx.throttle {
                    throttle.record_success();
                }
                buffer.release_all();
                return Ok(response);
            }
            Err(status) => {
                if let Some(throttle) = &ctx.throttle {
                    throttle.record_failure();
                }

                let retryable = policy.retryable_status_codes.contains(&status.code());
                let throttle_allows = ctx.throttle.as_ref().map_or(true, |t| t.allow_retry());

                if !retries_allowed || !retryable || attempt >= policy.max_attempts || !throttle_allows {
                    buffer.release_all();
                    return Err(status);
                }

                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

fn spawn_hedge_attempt<C>(
    ctx: &RetryContext,
    method: MethodDescriptor,
    metadata: MetadataMap,
    message: C::Encode,
    options: CallOptions,
    tx: mpsc::Sender<Result<Response<C::Decode>, Status>>,
) -> JoinHandle<()>
where
    C: Codec,
    C::Encode: Send + 'static,
    C::Decode: Send + 'static,
{
    let manager = Arc::clone(&ctx.manager);
    let scheme = ctx.scheme.clone();
    let authority = ctx.authority.clone();

    tokio::spawn(async move {
        let outcome = match manager.pick_outcome(options.wait_for_ready).await {
            PickOutcome::Picked(subchannel, _address) => {
                let request = Request::from_parts(metadata, message);
                call::unary(&subchannel, &scheme, &authority, &method, C::default(), request, &options).await
            }
            PickOutcome::Dropped(status) | PickOutcome::Failed(status) => Err(status),
        };
        let _ = tx.send(outcome).await;
    })
}

async fn hedge_unary<C>(
    ctx: &RetryContext,
    method: MethodDescriptor,
    metadata: MetadataMap,
    message: C::Encode,
    options: CallOptions,
    policy: &HedgingPolicy,
) -> Result<Response<C::Decode>, Status>
where
    C: Codec,
    C::Encode: Clone + Send + 'static,
    C::Decode: Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(policy.max_attempts.max(1) as usize);

    let mut handles = vec![spawn_hedge_attempt::<C>(
        ctx,
        method,
        metadata.clone(),
        message.clone(),
        options.clone(),
        tx.clone(),
    )];
    let mut started: u32 = 1;
    let mut completed: u32 = 0;
    let mut last_status = Status::unavailable("hedging produced no attempts");

    let mut delay = Box::pin(tokio::time::sleep(policy.hedging_delay));

    loop {
        tokio::select! {
            _ = &mut delay, if started < policy.max_attempts => {
                let throttle_allows = ctx.throttle.as_ref().map_or(true, |t| t.allow_retry());
                if throttle_allows {
                    handles.push(spawn_hedge_attempt::<C>(
                        ctx,
                        method,
                        metadata.clone(),
                        message.clone(),
                        options.clone(),
                        tx.clone(),
                    ));
                    started += 1;
                }
                delay.as_mut().reset(tokio::time::Instant::now() + policy.hedging_delay);
            }
            received = rx.recv() => {
                let Some(result) = received else {
                    return Err(last_status);
                };
                completed += 1;

                match result {
                    Ok(response) => {
                        if let Some(throttle) = &ctx.throttle {
                            throttle.record_success();
                        }
                        for handle in &handles {
                            handle.abort();
                        }
                        return Ok(response);
                    }
                    Err(status) => {
                        if let Some(throttle) = &ctx.throttle {
                            throttle.record_failure();
                        }

                        let non_fatal = policy.non_fatal_status_codes.contains(&status.code());
                        last_status = status;
                        if !non_fatal {
                            for handle in &handles {
                                handle.abort();
                            }
                            return Err(last_status);
                        }

                        if completed >= started && started >= policy.max_attempts {
                            return Err(last_status);
                        }
                    }
                }
            }
        }
    }
}
