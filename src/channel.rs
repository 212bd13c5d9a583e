//! Channel construction (§6): the application-facing factory that wires a
//! [`Target`] into a running [`ConnectionManager`] plus the retry/hedging
//! context an [`crate::Invoker`] drives calls through.
//!
//! A consuming builder (`ChannelOptions`) validates every option and is then
//! turned into a running `Channel` by `ChannelOptions::connect`.

use crate::connection_manager;
use crate::connection_manager::ConnectionManager;
use crate::interceptor::Interceptor;
use crate::resolver::{Resolver, ResolverListener, ResolverRegistry};
use crate::retry::{ChannelBudget, RetryContext, Throttle};
use crate::service_config::{ServiceConfig, ServiceConfigError};
use crate::target::{InvalidTarget, Target};
use crate::transport::active::{ActiveTransport, ActiveTransportConfig};
use crate::transport::executor::SharedExec;
use crate::transport::passive::PassiveTransport;
use crate::transport::SubchannelTransport;
use crate::types::{ConnectivityState, ResolverUpdate};
use crate::Status;
use http::uri::{Authority, Scheme};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Channel credentials (§6 "Scheme-to-TLS rules"). Custom key material is out
/// of scope (the TLS stack itself is a Non-goal); only the posture matters
/// for `:scheme` negotiation and construction-time validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Credentials {
    Insecure,
    SecureSsl,
}

/// A synchronous, construction-time validation failure (§6, §7).
#[derive(Debug)]
pub enum ChannelBuildError {
    InvalidTarget(InvalidTarget),
    /// `http://` with `SecureSsl`, or `https://` with `Insecure`.
    SchemeCredentialMismatch { scheme: &'static str, credentials: Credentials },
    /// A scheme other than `http`/`https` was given no explicit credentials.
    MissingCredentials { scheme: String },
    /// No resolver factory (built in or registered) handles this target's scheme.
    UnknownScheme(String),
    /// `InitialReconnectBackoff`/`MaxReconnectBackoff` must be `> 0`.
    NonPositiveBackoff,
    /// The inline service config failed validation against this channel's
    /// `MaxRetryAttempts` (§4.7).
    InvalidServiceConfig(ServiceConfigError),
}

impl fmt::Display for ChannelBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelBuildError::InvalidTarget(err) => write!(f, "{err}"),
            ChannelBuildError::SchemeCredentialMismatch { scheme, credentials } => {
                write!(f, "{scheme} scheme is incompatible with {credentials:?} credentials")
            }
            ChannelBuildError::MissingCredentials { scheme } => {
                write!(f, "scheme {scheme:?} requires explicit credentials")
            }
            ChannelBuildError::UnknownScheme(scheme) => {
                write!(f, "no resolver registered for scheme {scheme:?}")
            }
            ChannelBuildError::NonPositiveBackoff => {
                write!(f, "reconnect backoff durations must be greater than zero")
            }
            ChannelBuildError::InvalidServiceConfig(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChannelBuildError {}

impl From<InvalidTarget> for ChannelBuildError {
    fn from(err: InvalidTarget) -> Self {
        ChannelBuildError::InvalidTarget(err)
    }
}

type ResolverFactory = Arc<dyn Fn(&Target) -> Box<dyn Resolver> + Send + Sync>;

/// Consuming builder for a [`Channel`] (§6 "Configuration").
pub struct ChannelOptions {
    target: Target,
    credentials: Option<Credentials>,
    max_send_message_size: Option<usize>,
    max_recv_message_size: Option<usize>,
    max_retry_attempts: u32,
    max_retry_buffer_size: usize,
    max_retry_buffer_per_call_size: usize,
    service_config: Option<ServiceConfig>,
    disable_resolver_service_config: bool,
    initial_reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
    unsafe_use_insecure_channel_call_credentials: bool,
    throw_operation_canceled_on_cancellation: bool,
    dispose_http_client: bool,
    init_stream_window_size: Option<u32>,
    init_connection_window_size: Option<u32>,
    http2_keep_alive_interval: Option<Duration>,
    http2_keep_alive_timeout: Option<Duration>,
    resolver_overrides: Vec<(String, ResolverFactory)>,
    interceptor: Option<Interceptor>,
    custom_transport: Option<connection_manager::TransportFactory>,
}

impl ChannelOptions {
    /// Parse `target` and seed every option with its documented default.
    pub fn new(target: impl Into<String>) -> Result<Self, ChannelBuildError> {
        Ok(ChannelOptions {
            target: Target::from_shared(target)?,
            credentials: None,
            max_send_message_size: None,
            max_recv_message_size: None,
            max_retry_attempts: 5,
            max_retry_buffer_size: 16 * 1024 * 1024,
            max_retry_buffer_per_call_size: 1024 * 1024,
            service_config: None,
            disable_resolver_service_config: false,
            initial_reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(120),
            unsafe_use_insecure_channel_call_credentials: false,
            throw_operation_canceled_on_cancellation: true,
            dispose_http_client: true,
            init_stream_window_size: None,
            init_connection_window_size: None,
            http2_keep_alive_interval: None,
            http2_keep_alive_timeout: None,
            resolver_overrides: Vec::new(),
            interceptor: None,
            custom_transport: None,
        })
    }

    /// Applies `interceptor` to the metadata of every call issued through
    /// this channel's [`crate::Invoker`].
    pub fn interceptor(self, interceptor: impl Into<Interceptor>) -> Self {
        ChannelOptions { interceptor: Some(interceptor.into()), ..self }
    }

    pub fn credentials(self, credentials: Credentials) -> Self {
        ChannelOptions { credentials: Some(credentials), ..self }
    }

    pub fn max_send_message_size(self, sz: impl Into<Option<usize>>) -> Self {
        ChannelOptions { max_send_message_size: sz.into(), ..self }
    }

    pub fn max_recv_message_size(self, sz: impl Into<Option<usize>>) -> Self {
        ChannelOptions { max_recv_message_size: sz.into(), ..self }
    }

    pub fn max_retry_attempts(self, n: u32) -> Self {
        ChannelOptions { max_retry_attempts: n, ..self }
    }

    pub fn max_retry_buffer_size(self, n: usize) -> Self {
        ChannelOptions { max_retry_buffer_size: n, ..self }
    }

    pub fn max_retry_buffer_per_call_size(self, n: usize) -> Self {
        ChannelOptions { max_retry_buffer_per_call_size: n, ..self }
    }

    /// Inline service config, used when the resolver supplies none (or
    /// always, if [`Self::disable_resolver_service_config`] is set).
    pub fn service_config(self, service_config: ServiceConfig) -> Self {
        ChannelOptions { service_config: Some(service_config), ..self }
    }

    pub fn disable_resolver_service_config(self, disabled: bool) -> Self {
        ChannelOptions { disable_resolver_service_config: disabled, ..self }
    }

    pub fn initial_reconnect_backoff(self, dur: Duration) -> Result<Self, ChannelBuildError> {
        if dur.is_zero() {
            return Err(ChannelBuildError::NonPositiveBackoff);
        }
        Ok(ChannelOptions { initial_reconnect_backoff: dur, ..self })
    }

    pub fn max_reconnect_backoff(self, dur: Duration) -> Result<Self, ChannelBuildError> {
        if dur.is_zero() {
            return Err(ChannelBuildError::NonPositiveBackoff);
        }
        Ok(ChannelOptions { max_reconnect_backoff: dur, ..self })
    }

    pub fn unsafe_use_insecure_channel_call_credentials(self, allow: bool) -> Self {
        ChannelOptions { unsafe_use_insecure_channel_call_credentials: allow, ..self }
    }

    pub fn throw_operation_canceled_on_cancellation(self, enabled: bool) -> Self {
        ChannelOptions { throw_operation_canceled_on_cancellation: enabled, ..self }
    }

    pub fn dispose_http_client(self, enabled: bool) -> Self {
        ChannelOptions { dispose_http_client: enabled, ..self }
    }

    pub fn initial_stream_window_size(self, sz: impl Into<Option<u32>>) -> Self {
        ChannelOptions { init_stream_window_size: sz.into(), ..self }
    }

    pub fn initial_connection_window_size(self, sz: impl Into<Option<u32>>) -> Self {
        ChannelOptions { init_connection_window_size: sz.into(), ..self }
    }

    pub fn http2_keep_alive_interval(self, dur: Duration) -> Self {
        ChannelOptions { http2_keep_alive_interval: Some(dur), ..self }
    }

    pub fn http2_keep_alive_timeout(self, dur: Duration) -> Self {
        ChannelOptions { http2_keep_alive_timeout: Some(dur), ..self }
    }

    /// Register a resolver factory for an additional target scheme, layered
    /// on top of the registry's `http`/`https`/`dns` defaults (§4.1 supplement).
    pub fn register_resolver<F>(mut self, scheme: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Target) -> Box<dyn Resolver> + Send + Sync + 'static,
    {
        self.resolver_overrides.push((scheme.into(), Arc::new(factory)));
        self
    }

    /// Backs every subchannel with a passive transport (§4.2) that delegates
    /// to `service` instead of opening its own connections — for a caller
    /// that already owns a pooling HTTP/2 client and wants this channel's
    /// resolver/balancer/retry machinery layered on top of it. `service` is
    /// cloned once per subchannel, so it must be cheap to clone (a `tower`
    /// client handle, not the connection pool itself).
    pub fn with_transport_service<S>(self, service: S) -> Self
    where
        S: tower_service::Service<http::Request<crate::body::BoxBody>, Response = http::Response<crate::body::BoxBody>>
            + Clone
            + Send
            + 'static,
        S::Error: Into<crate::Error> + Send,
        S::Future: Send,
    {
        let factory: connection_manager::TransportFactory = Arc::new(move || {
            Arc::new(PassiveTransport::new(service.clone())) as Arc<dyn SubchannelTransport>
        });
        ChannelOptions { custom_transport: Some(factory), ..self }
    }

    fn effective_credentials(&self) -> Result<Credentials, ChannelBuildError> {
        let scheme = self.target.scheme();
        match (scheme, self.credentials) {
            ("http", Some(Credentials::SecureSsl)) => Err(ChannelBuildError::SchemeCredentialMismatch {
                scheme: "http",
                credentials: Credentials::SecureSsl,
            }),
            ("http", _) => Ok(Credentials::Insecure),
            ("https", Some(Credentials::Insecure)) => Err(ChannelBuildError::SchemeCredentialMismatch {
                scheme: "https",
                credentials: Credentials::Insecure,
            }),
            ("https", _) => Ok(Credentials::SecureSsl),
            (_, Some(credentials)) => Ok(credentials),
            (other, None) => Err(ChannelBuildError::MissingCredentials { scheme: other.to_string() }),
        }
    }

    /// Validate and start the channel: builds the resolver, the transport
    /// factory, the Connection Manager, and the retry/hedging context.
    pub fn connect(mut self) -> Result<Arc<Channel>, ChannelBuildError> {
        let credentials = self.effective_credentials()?;
        let scheme = match credentials {
            Credentials::Insecure => Scheme::HTTP,
            Credentials::SecureSsl => Scheme::HTTPS,
        };

        // The channel's MaxRetryAttempts caps every method's retry/hedging
        // policy (§4.7), even for a config supplied already-built via
        // `ChannelOptions::service_config`.
        if let Some(sc) = self.service_config.as_mut() {
            sc.cap_retry_attempts(self.max_retry_attempts)
                .map_err(ChannelBuildError::InvalidServiceConfig)?;
        }

        let authority: Authority = self
            .target
            .authority()
            .parse()
            .unwrap_or_else(|_| Authority::from_static("localhost"));

        let mut registry = ResolverRegistry::new();
        for (scheme_name, factory) in &self.resolver_overrides {
            let factory = Arc::clone(factory);
            registry.register(scheme_name.as_str(), move |target| factory(target));
        }
        let inner_resolver = registry
            .build(&self.target)
            .map_err(|_| ChannelBuildError::UnknownScheme(self.target.scheme().to_string()))?;
        let resolver: Box<dyn Resolver> = Box::new(ServiceConfigOverrideResolver {
            inner: inner_resolver,
            local_service_config: self.service_config.clone(),
            disable_resolver_service_config: self.disable_resolver_service_config,
            max_retry_attempts: self.max_retry_attempts,
        });

        let transport_config = ActiveTransportConfig {
            connect_timeout: self.initial_reconnect_backoff.max(Duration::from_secs(1)),
            init_stream_window_size: self.init_stream_window_size,
            init_connection_window_size: self.init_connection_window_size,
            keep_alive_interval: self.http2_keep_alive_interval,
            keep_alive_timeout: self.http2_keep_alive_timeout,
            ..ActiveTransportConfig::default()
        };
        let transport_factory: connection_manager::TransportFactory = match self.custom_transport.clone() {
            Some(factory) => factory,
            None => Arc::new(move || {
                Arc::new(ActiveTransport::new(transport_config.clone(), SharedExec::tokio())) as Arc<dyn SubchannelTransport>
            }),
        };

        let manager = ConnectionManager::new(resolver, transport_factory, transport_config_timeout(&self));

        let throttle = self
            .service_config
            .as_ref()
            .and_then(|sc| sc.retry_throttling())
            .map(|policy| Arc::new(Throttle::new(policy)));

        let retry_ctx = RetryContext {
            manager: Arc::clone(&manager),
            scheme: scheme.clone(),
            authority: authority.clone(),
            throttle,
            buffer_budget: ChannelBudget::new(self.max_retry_buffer_size),
            max_retry_buffer_per_call: self.max_retry_buffer_per_call_size,
        };

        Ok(Arc::new(Channel {
            manager,
            retry_ctx,
            scheme,
            authority,
            max_send_message_size: self.max_send_message_size,
            max_recv_message_size: self.max_recv_message_size,
            interceptor: self.interceptor,
            disposed: AtomicBool::new(false),
        }))
    }
}

fn transport_config_timeout(options: &ChannelOptions) -> Duration {
    options.initial_reconnect_backoff.max(Duration::from_millis(100))
}

/// Wraps a resolver and applies `DisableResolverServiceConfig`/the inline
/// `ServiceConfig` fallback (§6) without the Connection Manager needing to
/// know about either knob.
struct ServiceConfigOverrideResolver {
    inner: Box<dyn Resolver>,
    local_service_config: Option<ServiceConfig>,
    disable_resolver_service_config: bool,
    max_retry_attempts: u32,
}

struct OverrideListener {
    inner: Arc<dyn ResolverListener>,
    local_service_config: Option<ServiceConfig>,
    disable_resolver_service_config: bool,
    max_retry_attempts: u32,
}

impl ResolverListener for OverrideListener {
    fn update(&self, update: ResolverUpdate) {
        let update = match update {
            ResolverUpdate::Result(mut result) => {
                if self.disable_resolver_service_config {
                    result.service_config = self.local_service_config.clone();
                } else if result.service_config.is_none() {
                    result.service_config = self.local_service_config.clone();
                }
                // The channel's MaxRetryAttempts caps every active service
                // config, not just one supplied inline at construction (§4.7).
                if let Some(sc) = result.service_config.as_mut() {
                    if sc.cap_retry_attempts(self.max_retry_attempts).is_err() {
                        warn!("resolver-supplied service config has a method policy with max_attempts 0; ignoring it");
                        result.service_config = None;
                    }
                }
                ResolverUpdate::Result(result)
            }
            other => other,
        };
        self.inner.update(update);
    }
}

impl Resolver for ServiceConfigOverrideResolver {
    fn start(&mut self, listener: Arc<dyn ResolverListener>) {
        self.inner.start(Arc::new(OverrideListener {
            inner: listener,
            local_service_config: self.local_service_config.clone(),
            disable_resolver_service_config: self.disable_resolver_service_config,
            max_retry_attempts: self.max_retry_attempts,
        }));
    }

    fn refresh(&mut self) {
        self.inner.refresh();
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

/// The application-facing gRPC channel: one running Connection Manager plus
/// the retry/hedging context every call through its [`crate::Invoker`] shares.
pub struct Channel {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) retry_ctx: RetryContext,
    pub(crate) scheme: Scheme,
    pub(crate) authority: Authority,
    pub(crate) max_send_message_size: Option<usize>,
    pub(crate) max_recv_message_size: Option<usize>,
    pub(crate) interceptor: Option<Interceptor>,
    disposed: AtomicBool,
}

impl Channel {
    /// The per-call entry point (§6): unary/server-streaming/client-streaming/
    /// duplex-streaming, plus a blocking unary convenience.
    pub fn create_call_invoker(self: &Arc<Self>) -> crate::Invoker {
        crate::Invoker::new(Arc::clone(self))
    }

    pub fn state(&self) -> ConnectivityState {
        self.manager.state()
    }

    pub async fn wait_for_state_changed(&self, last_observed: ConnectivityState) {
        self.manager.wait_for_state_changed(last_observed).await
    }

    pub async fn connect(&self, wait_for_ready: bool) -> Result<(), Status> {
        self.manager.connect(wait_for_ready).await
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Aborts all outstanding calls and releases underlying transports.
    /// Idempotent: disposing an already-disposed channel is a no-op (§8).
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.manager.shutdown();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.dispose();
    }
}
