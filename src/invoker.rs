//! The call-dispatch entry point (§6): turns a [`Channel`] into the object
//! application code actually issues RPCs through.

use crate::call::{self, CallOptions, MethodDescriptor};
use crate::channel::Channel;
use crate::codec::Codec;
use crate::connection_manager::PickOutcome;
use crate::retry::call_unary;
use crate::{Request, Response, ResponseStream, Status};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Failure mode of a call attempted through a disposed [`Channel`], kept
/// distinct from an ordinary wire [`Status`] so callers can't mistake a
/// programmer error (using a channel after `dispose()`) for an RPC outcome.
#[derive(Debug)]
pub enum CallUsageError {
    ChannelDisposed,
    Rpc(Status),
}

impl fmt::Display for CallUsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallUsageError::ChannelDisposed => write!(f, "channel has been disposed"),
            CallUsageError::Rpc(status) => write!(f, "{status}"),
        }
    }
}

impl std::error::Error for CallUsageError {}

impl From<Status> for CallUsageError {
    fn from(status: Status) -> Self {
        CallUsageError::Rpc(status)
    }
}

/// Issues calls on behalf of one [`Channel`] (§6). Cheap to clone; every
/// method borrows the channel's shared retry/hedging context and picker.
pub struct Invoker {
    channel: Arc<Channel>,
}

impl Invoker {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Invoker { channel }
    }

    fn check_disposed(&self) -> Result<(), CallUsageError> {
        if self.channel.is_disposed() {
            Err(CallUsageError::ChannelDisposed)
        } else {
            Ok(())
        }
    }

    fn apply_interceptor<T>(&self, request: Request<T>) -> Result<Request<T>, CallUsageError> {
        match &self.channel.interceptor {
            Some(interceptor) => Ok(interceptor.call(request)?),
            None => Ok(request),
        }
    }

    /// Fills in the channel-wide message size caps (§6 "Configuration") for
    /// whichever side the caller left unset on this call's `CallOptions`.
    fn effective_options(&self, mut options: CallOptions) -> CallOptions {
        if options.max_send_message_size.is_none() {
            options.max_send_message_size = self.channel.max_send_message_size;
        }
        if options.max_recv_message_size.is_none() {
            options.max_recv_message_size = self.channel.max_recv_message_size;
        }
        options
    }

    /// Runs `fut` under `timeout`, the same cancel-by-drop idiom the Retry/
    /// Hedging Controller uses for unary calls (§4.6): once the deadline
    /// elapses, `fut` is dropped mid-flight and the call fails with
    /// `DeadlineExceeded`, without ever reaching the transport if it hadn't
    /// already.
    async fn with_deadline<T>(
        &self,
        timeout: Option<Duration>,
        fut: impl Future<Output = Result<T, CallUsageError>>,
    ) -> Result<T, CallUsageError> {
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_) => Err(CallUsageError::Rpc(Status::deadline_exceeded(
                    "deadline exceeded before the call completed",
                ))),
            },
            None => fut.await,
        }
    }

    /// Unary call, driven through the Retry/Hedging Controller (§4.7): the
    /// method's [`crate::MethodPolicy`], looked up from the channel's current
    /// service config, decides whether this is a single attempt, a sequence
    /// of retries, or a hedged fan-out.
    pub async fn unary<C>(
        &self,
        method: MethodDescriptor,
        request: Request<C::Encode>,
        options: CallOptions,
    ) -> Result<Response<C::Decode>, CallUsageError>
    where
        C: Codec,
        C::Encode: Clone + Send + 'static,
        C::Decode: Send + 'static,
    {
        self.check_disposed()?;
        let request = self.apply_interceptor(request)?;
        let options = self.effective_options(options);
        let service_config = self.channel.manager.service_config();
        let policy = service_config
            .as_ref()
            .and_then(|sc| sc.method_policy(method.service(), method.method()));
        call_unary::<C>(&self.channel.retry_ctx, method, request, options, policy)
            .await
            .map_err(CallUsageError::Rpc)
    }

    /// A blocking convenience for non-async callers, matching how the
    /// reference ecosystem offers a synchronous wrapper over its async unary
    /// call: must not be invoked from within the channel's own runtime.
    pub fn unary_blocking<C>(
        &self,
        method: MethodDescriptor,
        request: Request<C::Encode>,
        options: CallOptions,
    ) -> Result<Response<C::Decode>, CallUsageError>
    where
        C: Codec,
        C::Encode: Clone + Send + 'static,
        C::Decode: Send + 'static,
    {
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(self.unary::<C>(method, request, options))
        })
    }

    /// Client-streaming call: one attempt only, no retry or hedging (§4.7
    /// scopes both to unary calls).
    pub async fn client_streaming<C>(
        &self,
        method: MethodDescriptor,
        request: Request<mpsc::Receiver<C::Encode>>,
        options: CallOptions,
    ) -> Result<Response<C::Decode>, CallUsageError>
    where
        C: Codec,
    {
        self.check_disposed()?;
        let request = self.apply_interceptor(request)?;
        let options = self.effective_options(options);
        let timeout = options.timeout;
        self.with_deadline(timeout, async {
            let (subchannel, _address) = self.pick(&options).await?;
            let result = call::client_streaming(
                &subchannel,
                &self.channel.scheme,
                &self.channel.authority,
                &method,
                C::default(),
                request,
                &options,
            )
            .await?;
            Ok(result)
        })
        .await
    }

    /// Server-streaming call: one attempt only.
    pub async fn server_streaming<C>(
        &self,
        method: MethodDescriptor,
        request: Request<C::Encode>,
        options: CallOptions,
    ) -> Result<Response<ResponseStream<C::Decoder>>, CallUsageError>
    where
        C: Codec,
    {
        self.check_disposed()?;
        let request = self.apply_interceptor(request)?;
        let options = self.effective_options(options);
        let timeout = options.timeout;
        self.with_deadline(timeout, async {
            let (subchannel, _address) = self.pick(&options).await?;
            let result = call::server_streaming(
                &subchannel,
                &self.channel.scheme,
                &self.channel.authority,
                &method,
                C::default(),
                request,
                &options,
            )
            .await?;
            Ok(result)
        })
        .await
    }

    /// Duplex-streaming call: one attempt only.
    pub async fn duplex_streaming<C>(
        &self,
        method: MethodDescriptor,
        request: Request<mpsc::Receiver<C::Encode>>,
        options: CallOptions,
    ) -> Result<Response<ResponseStream<C::Decoder>>, CallUsageError>
    where
        C: Codec,
    {
        self.check_disposed()?;
        let request = self.apply_interceptor(request)?;
        let options = self.effective_options(options);
        let timeout = options.timeout;
        self.with_deadline(timeout, async {
            let (subchannel, _address) = self.pick(&options).await?;
            let result = call::streaming(
                &subchannel,
                &self.channel.scheme,
                &self.channel.authority,
                &method,
                C::default(),
                request,
                &options,
            )
            .await?;
            Ok(result)
        })
        .await
    }

    async fn pick(
        &self,
        options: &CallOptions,
    ) -> Result<(Arc<crate::subchannel::Subchannel>, crate::types::BalancerAddress), CallUsageError> {
        match self.channel.manager.pick_outcome(options.wait_for_ready).await {
            PickOutcome::Picked(subchannel, address) => Ok((subchannel, address)),
            PickOutcome::Dropped(status) | PickOutcome::Failed(status) => Err(CallUsageError::Rpc(status)),
        }
    }
}
