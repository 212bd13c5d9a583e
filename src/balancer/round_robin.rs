use super::pick_first::SubchannelFactory;
use super::{BalancerUpdateListener, ChannelState, LoadBalancer, PickResult, Picker, QueuePicker};
use crate::subchannel::SubchannelListener;
use crate::subchannel::Subchannel;
use crate::types::{BalancerAddress, ConnectivityState};
use crate::Status;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Creates one Subchannel per address (§4.4).
pub struct RoundRobin {
    factory: SubchannelFactory,
    listener: Arc<dyn BalancerUpdateListener>,
    shared: Arc<Mutex<Shared>>,
}

struct Entry {
    subchannel: Arc<Subchannel>,
    state: ConnectivityState,
}

struct Shared {
    entries: HashMap<SocketAddr, Entry>,
    last_status: Option<Status>,
}

impl RoundRobin {
    pub fn new(factory: SubchannelFactory, listener: Arc<dyn BalancerUpdateListener>) -> Self {
        RoundRobin {
            factory,
            listener,
            shared: Arc::new(Mutex::new(Shared {
                entries: HashMap::new(),
                last_status: None,
            })),
        }
    }

    fn publish(&self) {
        publish_from(&self.shared, &self.listener);
    }

    fn install_listener(&self, addr: SocketAddr, subchannel: &Arc<Subchannel>) {
        let shared = Arc::clone(&self.shared);
        let this_listener = Arc::clone(&self.listener);
        let shared_for_publish = Arc::clone(&self.shared);
        subchannel.set_listener(Arc::new(move |state: ConnectivityState, status: Option<Status>| {
            {
                let mut guard = shared.lock().unwrap();
                if let Some(entry) = guard.entries.get_mut(&addr) {
                    entry.state = state;
                }
                if status.is_some() {
                    guard.last_status = status;
                }
            }
            publish_from(&shared_for_publish, &this_listener);
        }) as Arc<dyn SubchannelListener>);

        subchannel.request_connection();
    }
}

fn publish_from(shared: &Arc<Mutex<Shared>>, listener: &Arc<dyn BalancerUpdateListener>) {
    let guard = shared.lock().unwrap();
    let ready: Vec<Arc<Subchannel>> = guard
        .entries
        .values()
        .filter(|e| e.state == ConnectivityState::Ready)
        .map(|e| Arc::clone(&e.subchannel))
        .collect();

    let aggregate = if !ready.is_empty() {
        ConnectivityState::Ready
    } else if guard
        .entries
        .values()
        .any(|e| e.state == ConnectivityState::Connecting)
    {
        ConnectivityState::Connecting
    } else if !guard.entries.is_empty()
        && guard
            .entries
            .values()
            .all(|e| e.state == ConnectivityState::TransientFailure)
    {
        ConnectivityState::TransientFailure
    } else {
        ConnectivityState::Idle
    };
    let last_status = guard.last_status.clone();
    drop(guard);

    let picker: Arc<dyn Picker> = if ready.is_empty() {
        Arc::new(QueuePicker { last_status })
    } else {
        Arc::new(RoundRobinPicker {
            subchannels: ready,
            cursor: AtomicUsize::new(0),
        })
    };
    listener.on_update(aggregate, picker);
}

impl LoadBalancer for RoundRobin {
    fn update_channel_state(&mut self, state: ChannelState) {
        let new_addrs: HashMap<SocketAddr, BalancerAddress> =
            state.addresses.into_iter().map(|a| (a.addr, a)).collect();

        let mut to_shut_down = Vec::new();
        let mut to_create: Vec<BalancerAddress> = Vec::new();
        let mut to_update: Vec<(Arc<Subchannel>, BalancerAddress)> = Vec::new();

        {
            let mut guard = self.shared.lock().unwrap();

            let stale: Vec<SocketAddr> = guard
                .entries
                .keys()
                .filter(|addr| !new_addrs.contains_key(addr))
                .copied()
                .collect();
            for addr in stale {
                if let Some(entry) = guard.entries.remove(&addr) {
                    to_shut_down.push(entry.subchannel);
                }
            }

            for (addr, balancer_addr) in &new_addrs {
                match guard.entries.get(addr) {
                    Some(entry) => to_update.push((Arc::clone(&entry.subchannel), balancer_addr.clone())),
                    None => to_create.push(balancer_addr.clone()),
                }
            }
        }

        for sc in to_shut_down {
            sc.shutdown();
        }

        // A preserved endpoint keeps its subchannel; only its attributes change (§4.4).
        for (sc, addr) in to_update {
            sc.update_addresses(vec![addr]);
        }

        for addr in to_create {
            let key = addr.addr;
            let sc = (self.factory)(vec![addr]);
            self.shared.lock().unwrap().entries.insert(
                key,
                Entry {
                    subchannel: Arc::clone(&sc),
                    state: ConnectivityState::Idle,
                },
            );
            self.install_listener(key, &sc);
        }

        self.publish();
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn shutdown(&mut self) {
        let mut guard = self.shared.lock().unwrap();
        for (_, entry) in guard.entries.drain() {
            entry.subchannel.shutdown();
        }
    }
}

struct RoundRobinPicker {
    subchannels: Vec<Arc<Subchannel>>,
    cursor: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self) -> PickResult {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        let subchannel = Arc::clone(&self.subchannels[idx]);
        match subchannel.current_address() {
            Some(address) => PickResult::Complete {
                subchannel,
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
    use std::collections::HashSet;
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
        last: Mutex<Option<(ConnectivityState, Arc<dyn Picker>)>>,
        notify: Notify,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(RecordingListener {
                last: Mutex::new(None),
                notify: Notify::new(),
            })
        }

        async fn wait_for_ready_with(&self, count: usize) -> Arc<dyn Picker> {
            loop {
                if let Some((ConnectivityState::Ready, picker)) = self.last.lock().unwrap().clone() {
                    if picker_len(&picker) == count {
                        return picker;
                    }
                }
                self.notify.notified().await;
            }
        }
    }

    fn picker_len(picker: &Arc<dyn Picker>) -> usize {
        // RoundRobinPicker cycles through every ready subchannel once per
        // `subchannels.len()` picks; probe by counting distinct addresses
        // returned over that many picks.
        let mut seen = HashSet::new();
        for _ in 0..8 {
            if let PickResult::Complete { address, .. } = picker.pick() {
                seen.insert(address.addr);
            }
        }
        seen.len()
    }

    impl BalancerUpdateListener for RecordingListener {
        fn on_update(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
            *self.last.lock().unwrap() = Some((state, picker));
            self.notify.notify_waiters();
        }
    }

    fn addr(port: u16) -> BalancerAddress {
        BalancerAddress::new(format!("127.0.0.1:{port}").parse().unwrap())
    }

    fn factory() -> SubchannelFactory {
        Arc::new(|addresses: Vec<BalancerAddress>| {
            Subchannel::new(addresses, Arc::new(AlwaysReady), Duration::from_secs(1))
        })
    }

    #[tokio::test]
    async fn cycles_across_every_ready_subchannel() {
        let listener = RecordingListener::new();
        let mut balancer =
            RoundRobin::new(factory(), listener.clone() as Arc<dyn BalancerUpdateListener>);

        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(80), addr(81), addr(82)],
            service_config: None,
        });

        let picker = listener.wait_for_ready_with(3).await;
        let mut seen = HashSet::new();
        for _ in 0..6 {
            if let PickResult::Complete { address, .. } = picker.pick() {
                seen.insert(address.addr.port());
            }
        }
        assert_eq!(seen, HashSet::from([80, 81, 82]));
    }

    #[tokio::test]
    async fn dropped_addresses_are_removed_and_new_ones_join() {
        let listener = RecordingListener::new();
        let mut balancer =
            RoundRobin::new(factory(), listener.clone() as Arc<dyn BalancerUpdateListener>);

        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(80), addr(81), addr(82)],
            service_config: None,
        });
        listener.wait_for_ready_with(3).await;

        balancer.update_channel_state(ChannelState {
            addresses: vec![addr(81), addr(82), addr(83)],
            service_config: None,
        });
        let picker = listener.wait_for_ready_with(3).await;

        let mut seen = HashSet::new();
        for _ in 0..8 {
            if let PickResult::Complete { address, .. } = picker.pick() {
                seen.insert(address.addr.port());
            }
        }
        assert_eq!(seen, HashSet::from([81, 82, 83]));
    }
}
