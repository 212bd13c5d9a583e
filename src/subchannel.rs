//! Subchannel (§4.3): binds a transport to an address list and exposes a
//! connectivity state machine plus a connect-on-demand API.

use crate::backoff::{Backoff, BackoffConfig};
use crate::transport::{ConnectOutcome, SubchannelTransport, TransportEvent, TransportListener};
use crate::types::{BalancerAddress, ConnectivityState};
use crate::Status;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Listener the balancer registers on a [`Subchannel`]; invoked for every
/// state change. Invocations for one subchannel are serialized; between
/// subchannels they may interleave (§4.3).
pub trait SubchannelListener: Send + Sync + 'static {
    fn on_state_change(&self, state: ConnectivityState, last_status: Option<Status>);
}

impl<F> SubchannelListener for F
where
    F: Fn(ConnectivityState, Option<Status>) + Send + Sync + 'static,
{
    fn on_state_change(&self, state: ConnectivityState, last_status: Option<Status>) {
        (self)(state, last_status)
    }
}

struct Inner {
    state: ConnectivityState,
    addresses: Vec<BalancerAddress>,
    current: usize,
    last_status: Option<Status>,
    listener: Option<Arc<dyn SubchannelListener>>,
    backoff: Backoff,
}

/// One stateful handle to one endpoint; owns its connection attempts.
pub struct Subchannel {
    inner: Mutex<Inner>,
    transport: Arc<dyn SubchannelTransport>,
    generation: AtomicU64,
    connect_timeout: Duration,
}

impl Subchannel {
    pub fn new(
        addresses: Vec<BalancerAddress>,
        transport: Arc<dyn SubchannelTransport>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let sc = Arc::new(Subchannel {
            inner: Mutex::new(Inner {
                state: ConnectivityState::Idle,
                addresses,
                current: 0,
                last_status: None,
                listener: None,
                backoff: Backoff::new(BackoffConfig::default()),
            }),
            transport,
            generation: AtomicU64::new(0),
            connect_timeout,
        });

        let listener_target = Arc::downgrade(&sc);
        sc.transport.set_listener(Arc::new(TransportEventBridge {
            subchannel: listener_target,
        }));

        sc
    }

    pub fn set_listener(&self, listener: Arc<dyn SubchannelListener>) {
        self.inner.lock().unwrap().listener = Some(listener);
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().unwrap().state
    }

    pub fn current_address(&self) -> Option<BalancerAddress> {
        let inner = self.inner.lock().unwrap();
        inner.addresses.get(inner.current).cloned()
    }

    pub fn addresses(&self) -> Vec<BalancerAddress> {
        self.inner.lock().unwrap().addresses.clone()
    }

    pub(crate) fn transport(&self) -> Arc<dyn SubchannelTransport> {
        Arc::clone(&self.transport)
    }

    fn publish(&self, state: ConnectivityState, status: Option<Status>) {
        let listener = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = state;
            if status.is_some() {
                inner.last_status = status.clone();
            }
            inner.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_state_change(state, status);
        }
    }

    /// Idempotent: a `Connecting` or already-`Ready` subchannel ignores a
    /// repeated request.
    pub fn request_connection(self: &Arc<Self>) {
        let should_connect = {
            let inner = self.inner.lock().unwrap();
            matches!(inner.state, ConnectivityState::Idle)
        };
        if should_connect {
            self.start_connecting(0);
        }
    }

    fn start_connecting(self: &Arc<Self>, generation: u64) {
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        self.publish(ConnectivityState::Connecting, None);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.connect_loop(generation).await;
        });
    }

    async fn connect_loop(self: Arc<Self>, generation: u64) {
        loop {
            if generation != self.generation.load(Ordering::SeqCst) {
                return;
            }

            let (addr, is_last) = {
                let inner = self.inner.lock().unwrap();
                let Some(addr) = inner.addresses.get(inner.current).cloned() else {
                    return;
                };
                (addr, inner.current + 1 >= inner.addresses.len())
            };

            trace!("subchannel connecting to {:?}", addr.addr);
            let outcome = self.transport.try_connect(addr.addr, self.connect_timeout).await;

            if generation != self.generation.load(Ordering::SeqCst) {
                return;
            }

            match outcome {
                ConnectOutcome::Success => {
                    self.inner.lock().unwrap().backoff.reset();
                    self.publish(ConnectivityState::Ready, None);
                    return;
                }
                ConnectOutcome::Timeout | ConnectOutcome::Failure(_) => {
                    let status = match outcome {
                        ConnectOutcome::Failure(s) => s,
                        _ => Status::deadline_exceeded("connect attempt timed out"),
                    };
                    debug!("subchannel connect to {:?} failed: {:?}", addr.addr, status);

                    if is_last {
                        self.publish(ConnectivityState::TransientFailure, Some(status));
                        let delay = self.inner.lock().unwrap().backoff.next_delay();
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if generation == this.generation.load(Ordering::SeqCst) {
                                this.inner.lock().unwrap().current = 0;
                                this.start_connecting(generation);
                            }
                        });
                        return;
                    } else {
                        self.inner.lock().unwrap().current += 1;
                        continue;
                    }
                }
            }
        }
    }

    /// A subchannel whose address list is replaced with the same set of
    /// endpoints keeps its current state; a replacement with a different set
    /// forces a reconnect attempt unless the subchannel is already Shutdown
    /// (§4.3): Idle and Connecting/TransientFailure start connecting the new
    /// set, Ready is torn down to be re-established against it.
    pub fn update_addresses(self: &Arc<Self>, new_addresses: Vec<BalancerAddress>) {
        let equivalent = {
            let inner = self.inner.lock().unwrap();
            same_endpoint_set(&inner.addresses, &new_addresses)
        };

        let mut inner = self.inner.lock().unwrap();
        if equivalent {
            // Attributes may change without forcing subchannel re-creation (§3).
            inner.addresses = new_addresses;
            return;
        }

        let state = inner.state;
        inner.addresses = new_addresses;
        inner.current = 0;
        drop(inner);

        match state {
            ConnectivityState::Idle => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.start_connecting(generation);
            }
            ConnectivityState::Connecting | ConnectivityState::TransientFailure => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.start_connecting(generation);
            }
            ConnectivityState::Ready => {
                self.shutdown();
            }
            ConnectivityState::Shutdown => {}
        }
    }

    /// Monotonic: Shutdown is terminal.
    pub fn shutdown(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            transport.close().await;
        });
        self.publish(ConnectivityState::Shutdown, None);
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let state = self.state();
        if state != ConnectivityState::Ready {
            return;
        }
        match event {
            TransportEvent::Idle => self.publish(ConnectivityState::Idle, None),
            TransportEvent::TransientFailure => {
                self.publish(
                    ConnectivityState::TransientFailure,
                    Some(Status::unavailable("connection lost")),
                );
                self.inner.lock().unwrap().current = 0;
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.start_connecting(generation);
            }
        }
    }
}

fn same_endpoint_set(a: &[BalancerAddress], b: &[BalancerAddress]) -> bool {
    use std::collections::HashSet;
    let a: HashSet<_> = a.iter().map(|addr| addr.addr).collect();
    let b: HashSet<_> = b.iter().map(|addr| addr.addr).collect();
    a == b
}

struct TransportEventBridge {
    subchannel: std::sync::Weak<Subchannel>,
}

impl TransportListener for TransportEventBridge {
    fn on_event(&self, event: TransportEvent) {
        if let Some(subchannel) = self.subchannel.upgrade() {
            subchannel.on_transport_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_endpoint_set_ignores_order() {
        let a = vec![
            BalancerAddress::new("127.0.0.1:80".parse().unwrap()),
            BalancerAddress::new("127.0.0.1:81".parse().unwrap()),
        ];
        let b = vec![
            BalancerAddress::new("127.0.0.1:81".parse().unwrap()),
            BalancerAddress::new("127.0.0.1:80".parse().unwrap()),
        ];
        assert!(same_endpoint_set(&a, &b));
    }

    #[test]
    fn disjoint_sets_are_not_equivalent() {
        let a = vec![BalancerAddress::new("127.0.0.1:80".parse().unwrap())];
        let b = vec![BalancerAddress::new("127.0.0.1:81".parse().unwrap())];
        assert!(!same_endpoint_set(&a, &b));
    }
}
