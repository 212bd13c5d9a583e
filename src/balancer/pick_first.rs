use super::{BalancerUpdateListener, ChannelState, LoadBalancer, PickResult, Picker, QueuePicker};
use crate::subchannel::{Subchannel, SubchannelListener};
use crate::types::{BalancerAddress, ConnectivityState};
use crate::Status;
use std::sync::{Arc, Mutex};

/// Constructs a [`Subchannel`] covering a given address list; supplied by the
/// Connection Manager, which owns transport creation (§4.5).
pub type SubchannelFactory = Arc<dyn Fn(Vec<BalancerAddress>) -> Arc<Subchannel> + Send + Sync>;

/// Holds at most one Subchannel covering the entire address list in order (§4.4).
pub struct PickFirst {
    factory: SubchannelFactory,
    listener: Arc<dyn BalancerUpdateListener>,
    shared: Arc<Mutex<Shared>>,
}

struct Shared {
    current: Option<Arc<Subchannel>>,
    replacement: Option<Arc<Subchannel>>,
    last_status: Option<Status>,
}

impl PickFirst {
    pub fn new(factory: SubchannelFactory, listener: Arc<dyn BalancerUpdateListener>) -> Self {
        PickFirst {
            factory,
            listener,
            shared: Arc::new(Mutex::new(Shared {
                current: None,
                replacement: None,
                last_status: None,
            })),
        }
    }

    fn install_listener(&self, subchannel: &Arc<Subchannel>, is_replacement: bool) {
        let shared = Arc::clone(&self.shared);
        let listener = Arc::clone(&self.listener);
        let weak_sc = Arc::downgrade(subchannel);

        subchannel.set_listener(Arc::new(move |state: ConnectivityState, status: Option<Status>| {
            let Some(sc) = weak_sc.upgrade() else { return };
            let mut guard = shared.lock().unwrap();

            if is_replacement && state == ConnectivityState::Ready {
                if let Some(old) = guard.current.take() {
                    old.shutdown();
                }
                guard.current = guard.replacement.take();
            }

            guard.last_status = status.clone();
            let is_live = guard
                .current
                .as_ref()
                .map(|c| Arc::ptr_eq(c, &sc))
                .unwrap_or(false)
                || (is_replacement && guard.replacement.as_ref().map(|r| Arc::ptr_eq(r, &sc)).unwrap_or(false));

            if !is_live {
                return;
            }

            let picker: Arc<dyn Picker> = match state {
                ConnectivityState::Ready => Arc::new(ReadyPicker { subchannel: sc }),
                _ => Arc::new(QueuePicker {
                    last_status: status,
                }),
            };
            listener.on_update(state, picker);
        }) as Arc<dyn SubchannelListener>);

        subchannel.request_connection();
    }
}

impl LoadBalancer for PickFirst {
    fn update_channel_state(&mut self, state: ChannelState) {
        if state.addresses.is_empty() {
            let mut guard = self.shared.lock().unwrap();
            if let Some(old) = guard.current.take() {
                old.shutdown();
            }
            drop(guard);
            self.listener.on_update(
                ConnectivityState::TransientFailure,
                Arc::new(QueuePicker {
                    last_status: Some(Status::unavailable(
                        "resolver produced an empty address list",
                    )),
                }),
            );
            return;
        }

        let existing = self.shared.lock().unwrap().current.clone();
        match existing {
            Some(current) if same_endpoints(&current.addresses(), &state.addresses) => {
                current.update_addresses(state.addresses);
            }
            Some(_current) => {
                let new_sc = (self.factory)(state.addresses);
                self.shared.lock().unwrap().replacement = Some(Arc::clone(&new_sc));
                self.install_listener(&new_sc, true);
            }
            None => {
                let new_sc = (self.factory)(state.addresses);
                self.shared.lock().unwrap().current = Some(Arc::clone(&new_sc));
                self.install_listener(&new_sc, false);
            }
        }
    }

    fn name(&self) -> &'static str {
        "pick_first"
    }

    fn shutdown(&mut self) {
        let mut guard = self.shared.lock().unwrap();
        if let Some(sc) = guard.current.take() {
            sc.shutdown();
        }
        if let Some(sc) = guard.replacement.take() {
            sc.shutdown();
        }
    }
}

fn same_endpoints(a: &[BalancerAddress], b: &[BalancerAddress]) -> bool {
    use std::collections::HashSet;
    let a: HashSet<_> = a.iter().map(|x| x.addr).collect();
    let b: HashSet<_> = b.iter().map(|x| x.addr).collect();
    a == b
}

struct ReadyPicker {
    subchannel: Arc<Subchannel>,
}

impl Picker for ReadyPicker {
    fn pick(&self) -> PickResult {
        match self.subchannel.current_address() {
            Some(address) => PickResult::Complete {
                subchannel: Arc::clone(&self.subchannel),
                address,
            },
            None => PickResult::Queue { last_status: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectOutcome, TransportListener};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct AlwaysReady;

    #[async_trait]
    impl crate::transport::SubchannelTransport for AlwaysReady {
        async fn try_connect(&self, _addr: std::net::SocketAddr, _timeout: Duration) -> ConnectOutcome {
            ConnectOutcome::Success
        }

        async fn send(
            &self,
            _request: http::Request<crate::body::BoxBody>,
        ) -> Result<http::Response<crate::body::BoxBody>, Status> {
            unimplemented!("balancer tests never issue calls")
        }

        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn close(&self) {}
    }

    struct RecordingListener {
        updates: Mutex<Vec<(ConnectivityState, Arc<dyn Picker>)>>,
        notify: Notify,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(RecordingListener {
                updates: Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        fn last_ready(&self) -> Option<Arc<dyn Picker>> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(state, _)| *state == ConnectivityState::Ready)
                .map(|(_, picker)| Arc::clone(picker))
        }

        async fn wait_for_ready(&self) -> Arc<dyn Picker> {
            loop {
                if let Some(picker) = self.last_ready() {
                    return picker;
                }
                self.notify.notified().await;
            }
        }

        /// Waits for the first `Ready` update at or after index `after`, and
        /// returns the index just past it along with its picker, so a caller
        /// can chain another wait for a *later* Ready without re-observing
        /// this one.
        async fn wait_for_next_ready(&self, after: usize) -> (usize, Arc<dyn Picker>) {
            loop {
                {
                    let updates = self.updates.lock().unwrap();
                    if let Some((i, (_, picker))) = updates
                        .iter()
                        .enumerate()
                        .skip(after)
                        .find(|(_, (state, _))| *state == ConnectivityState::Ready)
                    {
                        return (i + 1, Arc::clone(picker));
                    }
                }
                self.notify.notified().await;
            }
        }
    }

    impl BalancerUpdateListener for RecordingListener {
        fn on_update(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
            self.updates.lock().unwrap().push((state, picker));
            self.notify.notify_waiters();
        }
    }

    fn addr(port: u16) -> BalancerAddress {
        BalancerAddress::new(format!("127.0.0.1:{port}").parse().unwrap())
    }

    fn counting_factory(created: Arc<AtomicUsize>) -> SubchannelFactory {
        Arc::new(move |addresses: Vec<BalancerAddress>| {
            created.fetch_add(1, Ordering::SeqCst);
            Subchannel::new(addresses, Arc::new(AlwaysReady), Duration::from_secs(1))
        })
    }

    #[tokio::test]
    async fn picks_the_single_ready_subchannel() {
        let created = Arc::new(AtomicUsize::new(0));
        let listener = RecordingListener::new();
        let mut balancer = PickFirst::new(
            counting_factory(Arc::clone(&created)),
            listener.clone() as Arc<dyn BalancerUpdateListener>,
        );

        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(80)],
            service_config: None,
        });

        let picker = listener.wait_for_ready().await;
        match picker.pick() {
            PickResult::Complete { address, .. } => assert_eq!(address.addr.port(), 80),
            _ => panic!("expected a completed pick"),
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reusing_the_same_endpoint_set_does_not_recreate_the_subchannel() {
        let created = Arc::new(AtomicUsize::new(0));
        let listener = RecordingListener::new();
        let mut balancer = PickFirst::new(
            counting_factory(Arc::clone(&created)),
            listener.clone() as Arc<dyn BalancerUpdateListener>,
        );

        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(80), addr(81)],
            service_config: None,
        });
        listener.wait_for_ready().await;

        // Same endpoints, different order: must not create a second subchannel.
        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(81), addr(80)],
            service_config: None,
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_changed_endpoint_set_replaces_the_subchannel_once_ready() {
        let created = Arc::new(AtomicUsize::new(0));
        let listener = RecordingListener::new();
        let mut balancer = PickFirst::new(
            counting_factory(Arc::clone(&created)),
            listener.clone() as Arc<dyn BalancerUpdateListener>,
        );

        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(80)],
            service_config: None,
        });
        let (next, _) = listener.wait_for_next_ready(0).await;

        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(81)],
            service_config: None,
        });
        let (_, picker) = listener.wait_for_next_ready(next).await;

        match picker.pick() {
            PickResult::Complete { address, .. } => assert_eq!(address.addr.port(), 81),
            _ => panic!("expected a completed pick"),
        }
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
