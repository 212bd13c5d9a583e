//! Connection Manager (§4.5): owns the Resolver, the outer Balancer, and the
//! channel-wide lock; exposes pick/connect/state-change operations.
//!
//! Cancellation here is expressed the idiomatic Rust way: every suspending
//! method is itself a plain `Future`, cancellable by the caller dropping it
//! (e.g. inside a `tokio::select!` against a deadline), rather than via an
//! explicit cancellation-token parameter.

use crate::balancer::{
    BalancerUpdateListener, ChannelState, ChildHandlerLoadBalancer, LoadBalancer, PickResult,
    Picker,
};
use crate::resolver::{Resolver, ResolverListener};
use crate::service_config::ServiceConfig;
use crate::subchannel::Subchannel;
use crate::transport::SubchannelTransport;
use crate::types::{BalancerAddress, ConnectivityState, ResolverUpdate};
use crate::Status;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Constructs the transport used for subchannels created by the balancer.
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn SubchannelTransport> + Send + Sync>;

struct Published {
    state: ConnectivityState,
    picker: Arc<dyn Picker>,
    /// Last service config from a resolver update, kept so
    /// `DisableResolverServiceConfig` can be layered in by the channel.
    service_config: Option<ServiceConfig>,
}

struct NotifyingListener {
    published: Mutex<Published>,
    notify: Notify,
}

impl BalancerUpdateListener for NotifyingListener {
    fn on_update(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        {
            let mut guard = self.published.lock().unwrap();
            guard.state = state;
            guard.picker = picker;
        }
        self.notify.notify_waiters();
    }
}

struct NoopPicker;
impl Picker for NoopPicker {
    fn pick(&self) -> PickResult {
        PickResult::Queue { last_status: None }
    }
}

/// Owns the Resolver, the outer Balancer, and the subchannels they create.
pub struct ConnectionManager {
    resolver: Mutex<Box<dyn Resolver>>,
    balancer: Mutex<ChildHandlerLoadBalancer>,
    listener: Arc<NotifyingListener>,
    connect_timeout: Duration,
}

struct ResolverBridge {
    manager: std::sync::Weak<ConnectionManager>,
}

impl ResolverListener for ResolverBridge {
    fn update(&self, update: ResolverUpdate) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        let state = match update {
            ResolverUpdate::Result(result) => {
                manager.listener.published.lock().unwrap().service_config = result.service_config.clone();
                ChannelState {
                    addresses: result.addresses,
                    service_config: result.service_config,
                }
            }
            ResolverUpdate::Error(status) => {
                debug!("resolver error: {:?}", status);
                ChannelState {
                    addresses: Vec::new(),
                    service_config: None,
                }
            }
        };

        manager.balancer.lock().unwrap().update_channel_state(state);
    }
}

impl ConnectionManager {
    pub fn new(
        mut resolver: Box<dyn Resolver>,
        transport_factory: TransportFactory,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let listener = Arc::new(NotifyingListener {
            published: Mutex::new(Published {
                state: ConnectivityState::Idle,
                picker: Arc::new(NoopPicker),
                service_config: None,
            }),
            notify: Notify::new(),
        });

        let factory: crate::balancer::pick_first::SubchannelFactory = {
            let transport_factory = transport_factory.clone();
            Arc::new(move |addresses: Vec<BalancerAddress>| {
                Subchannel::new(addresses, transport_factory(), connect_timeout)
            })
        };

        let balancer = ChildHandlerLoadBalancer::new(factory, listener.clone() as Arc<dyn BalancerUpdateListener>);

        let manager = Arc::new_cyclic(|weak: &std::sync::Weak<ConnectionManager>| {
            resolver.start(Arc::new(ResolverBridge {
                manager: weak.clone(),
            }));
            ConnectionManager {
                resolver: Mutex::new(resolver),
                balancer: Mutex::new(balancer),
                listener,
                connect_timeout,
            }
        });

        manager
    }

    /// Disposes the resolver and shuts down the current balancer and its subchannels.
    pub fn shutdown(&self) {
        self.resolver.lock().unwrap().dispose();
        self.balancer.lock().unwrap().shutdown();
    }

    /// Current aggregate connectivity state.
    pub fn state(&self) -> ConnectivityState {
        self.listener.published.lock().unwrap().state
    }

    /// The most recent service config observed from a resolver update, if any.
    pub(crate) fn service_config(&self) -> Option<ServiceConfig> {
        self.listener.published.lock().unwrap().service_config.clone()
    }

    /// Completes on the next state different from `last_observed`.
    pub async fn wait_for_state_changed(&self, last_observed: ConnectivityState) {
        loop {
            let notified = self.listener.notify.notified();
            if self.state() != last_observed {
                return;
            }
            notified.await;
            if self.state() != last_observed {
                return;
            }
        }
    }

    /// Returns once the aggregate state reaches Ready (or fails/blocks per `wait_for_ready`).
    pub async fn connect(&self, wait_for_ready: bool) -> Result<(), Status> {
        loop {
            match self.state() {
                ConnectivityState::Ready => return Ok(()),
                ConnectivityState::TransientFailure if !wait_for_ready => {
                    let status = self.listener.published.lock().unwrap().picker.pick();
                    return Err(match status {
                        PickResult::Drop(status) | PickResult::Queue { last_status: Some(status) } => status,
                        _ => Status::unavailable("channel is not ready"),
                    });
                }
                _ => {
                    self.request_connection();
                    self.wait_for_state_changed(self.state()).await;
                }
            }
        }
    }

    fn request_connection(&self) {
        self.resolver.lock().unwrap().refresh();
    }

    /// Pick algorithm (§4.5). `Queue` re-enters when `wait_for_ready` and the
    /// picker later changes; otherwise it fails fast with `Unavailable`.
    pub async fn pick(&self, wait_for_ready: bool) -> Result<(Arc<Subchannel>, BalancerAddress), Status> {
        match self.pick_outcome(wait_for_ready).await {
            PickOutcome::Picked(subchannel, address) => Ok((subchannel, address)),
            PickOutcome::Dropped(status) | PickOutcome::Failed(status) => Err(status),
        }
    }

    /// Same algorithm as [`Self::pick`], but keeps a `Drop` outcome distinct
    /// from an ordinary pick failure so the Retry/Hedging Controller can
    /// bypass retry and hedging for it unconditionally (§4.4, §4.7).
    pub(crate) async fn pick_outcome(&self, wait_for_ready: bool) -> PickOutcome {
        loop {
            let picker = self.listener.published.lock().unwrap().picker.clone();
            match picker.pick() {
                PickResult::Complete { subchannel, address } => return PickOutcome::Picked(subchannel, address),
                PickResult::Drop(status) => return PickOutcome::Dropped(status),
                PickResult::Queue { last_status } => {
                    if !wait_for_ready {
                        return PickOutcome::Failed(
                            last_status.unwrap_or_else(|| Status::unavailable("no ready subchannel")),
                        );
                    }
                    let state = self.state();
                    self.wait_for_state_changed(state).await;
                }
            }
        }
    }
}

/// Richer pick result used internally by the Retry/Hedging Controller, which
/// needs to tell a `Drop` apart from an ordinary queue-timeout failure.
pub(crate) enum PickOutcome {
    Picked(Arc<Subchannel>, BalancerAddress),
    Dropped(Status),
    Failed(Status),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use crate::target::Target;
    use crate::transport::{ConnectOutcome, TransportListener};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysReady;

    #[async_trait]
    impl SubchannelTransport for AlwaysReady {
        async fn try_connect(&self, _addr: std::net::SocketAddr, _timeout: Duration) -> ConnectOutcome {
            ConnectOutcome::Success
        }

        async fn send(
            &self,
            _request: http::Request<crate::body::BoxBody>,
        ) -> Result<http::Response<crate::body::BoxBody>, Status> {
            unimplemented!("connection manager tests never issue calls")
        }

        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn close(&self) {}
    }

    struct AlwaysFails;

    #[async_trait]
    impl SubchannelTransport for AlwaysFails {
        async fn try_connect(&self, _addr: std::net::SocketAddr, _timeout: Duration) -> ConnectOutcome {
            ConnectOutcome::Failure(Status::unavailable("connect refused"))
        }

        async fn send(
            &self,
            _request: http::Request<crate::body::BoxBody>,
        ) -> Result<http::Response<crate::body::BoxBody>, Status> {
            unimplemented!("connection manager tests never issue calls")
        }

        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn close(&self) {}
    }

    fn manager_with(transport: Arc<dyn SubchannelTransport>) -> Arc<ConnectionManager> {
        let target = Target::from_shared("http://127.0.0.1:0").unwrap();
        let resolver = Box::new(StaticResolver::new(target));
        ConnectionManager::new(
            resolver,
            Arc::new(move || Arc::clone(&transport)),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn pick_outcome_resolves_once_the_subchannel_is_ready() {
        let manager = manager_with(Arc::new(AlwaysReady));

        match manager.pick_outcome(true).await {
            PickOutcome::Picked(_, address) => assert_eq!(address.addr.port(), 0),
            _ => panic!("expected a completed pick once the subchannel connects"),
        }
        assert_eq!(manager.state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn connect_fails_fast_without_wait_for_ready() {
        let manager = manager_with(Arc::new(AlwaysFails));

        let err = manager.connect(false).await.unwrap_err();
        assert_eq!(err.code(), crate::Code::Unavailable);
    }

    #[tokio::test]
    async fn pick_outcome_fails_fast_without_wait_for_ready() {
        let manager = manager_with(Arc::new(AlwaysFails));

        match manager.pick_outcome(false).await {
            PickOutcome::Failed(status) => assert_eq!(status.code(), crate::Code::Unavailable),
            _ => panic!("expected a failed pick"),
        }
    }
}

