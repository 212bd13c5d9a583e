//! Load balancer (§4.4): from the latest resolver result, maintains
//! subchannels and produces a [`Picker`] that selects one per call.

pub(crate) mod child;
pub(crate) mod pick_first;
pub(crate) mod round_robin;

pub use child::ChildHandlerLoadBalancer;
pub use pick_first::PickFirst;
pub use round_robin::RoundRobin;

use crate::service_config::ServiceConfig;
use crate::subchannel::Subchannel;
use crate::types::{BalancerAddress, ConnectivityState};
use crate::Status;
use std::sync::Arc;

/// The triple supplied to a balancer on every resolver update (§4.4, GLOSSARY).
#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    pub addresses: Vec<BalancerAddress>,
    pub service_config: Option<ServiceConfig>,
}

/// Result of invoking a [`Picker`] for one call.
pub enum PickResult {
    /// A subchannel was selected.
    Complete {
        subchannel: Arc<Subchannel>,
        address: BalancerAddress,
    },
    /// No subchannel is currently available; the caller should wait for the
    /// next Picker change and retry (if `waitForReady`), or fail `Unavailable`
    /// (using `last_status`, the balancer's last-observed failure, if any).
    Queue { last_status: Option<Status> },
    /// Terminal: the call fails with `status` unconditionally, bypassing
    /// retry/hedging regardless of `waitForReady` (§4.4, §4.7).
    Drop(Status),
}

/// A pure function of subchannel states that maps a call to a pick outcome (GLOSSARY).
pub trait Picker: Send + Sync {
    fn pick(&self) -> PickResult;
}

/// A picker that always queues; used while a balancer has no ready subchannels yet.
pub struct QueuePicker {
    pub last_status: Option<Status>,
}
impl Picker for QueuePicker {
    fn pick(&self) -> PickResult {
        PickResult::Queue {
            last_status: self.last_status.clone(),
        }
    }
}

/// Callback a balancer invokes whenever its aggregate state or picker changes.
/// The Connection Manager supplies this at construction and publishes both
/// atomically under its own serial worker (§4.5).
pub trait BalancerUpdateListener: Send + Sync + 'static {
    fn on_update(&self, state: ConnectivityState, picker: Arc<dyn Picker>);
}

impl<F> BalancerUpdateListener for F
where
    F: Fn(ConnectivityState, Arc<dyn Picker>) + Send + Sync + 'static,
{
    fn on_update(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        (self)(state, picker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropPicker;
    impl Picker for DropPicker {
        fn pick(&self) -> PickResult {
            PickResult::Drop(Status::new(crate::Code::DataLoss, "dropped by policy"))
        }
    }

    #[test]
    fn drop_outcome_carries_its_status_through_unconditionally() {
        let picker: Arc<dyn Picker> = Arc::new(DropPicker);
        match picker.pick() {
            PickResult::Drop(status) => assert_eq!(status.code(), crate::Code::DataLoss),
            _ => panic!("expected a Drop outcome"),
        }
    }

    #[test]
    fn queue_picker_carries_last_status_forward() {
        let picker = QueuePicker {
            last_status: Some(Status::unavailable("no ready subchannel")),
        };
        match picker.pick() {
            PickResult::Queue { last_status: Some(status) } => {
                assert_eq!(status.code(), crate::Code::Unavailable);
            }
            _ => panic!("expected a Queue outcome with a carried status"),
        }
    }
}

/// Given ChannelState and subchannel state changes, maintains the balancer's
/// subchannel set and publishes `(AggregateState, Picker)` via its listener.
pub trait LoadBalancer: Send {
    /// A fresh resolver result (or an error with `addresses` empty and
    /// `service_config` carrying the last-known config).
    fn update_channel_state(&mut self, state: ChannelState);

    /// The balancer's own policy name, e.g. `"pick_first"`, `"round_robin"`.
    fn name(&self) -> &'static str;

    /// Tear down every owned subchannel. Called when this instance is being replaced.
    fn shutdown(&mut self);
}
