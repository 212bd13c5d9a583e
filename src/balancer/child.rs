use super::pick_first::SubchannelFactory;
use super::{BalancerUpdateListener, ChannelState, LoadBalancer, PickFirst, RoundRobin};
use tracing::warn;

/// Resolves a balancer name from the service config and delegates to the
/// selected policy; installs the default (PickFirst) when no recognized
/// policy is named (§4.4).
///
/// Per the open-question resolution in DESIGN.md: when a later update names
/// an unrecognized policy, the active policy is left in place and a warning
/// is logged, rather than replacing it with the default.
pub struct ChildHandlerLoadBalancer {
    factory: SubchannelFactory,
    listener: std::sync::Arc<dyn BalancerUpdateListener>,
    current_name: &'static str,
    current: Box<dyn LoadBalancer>,
}

const DEFAULT_POLICY: &str = "pick_first";

impl ChildHandlerLoadBalancer {
    pub fn new(factory: SubchannelFactory, listener: std::sync::Arc<dyn BalancerUpdateListener>) -> Self {
        let current: Box<dyn LoadBalancer> =
            Box::new(PickFirst::new(factory.clone(), listener.clone()));
        ChildHandlerLoadBalancer {
            factory,
            listener,
            current_name: DEFAULT_POLICY,
            current,
        }
    }

    /// The set of policy names this handler knows how to construct.
    pub fn known_policies(&self) -> &'static [&'static str] {
        &["pick_first", "round_robin"]
    }

    fn build(&self, name: &str) -> Option<Box<dyn LoadBalancer>> {
        match name {
            "pick_first" => Some(Box::new(PickFirst::new(self.factory.clone(), self.listener.clone()))),
            "round_robin" => Some(Box::new(RoundRobin::new(self.factory.clone(), self.listener.clone()))),
            _ => None,
        }
    }

    /// First policy name in the service config's preference order (§3), not
    /// prefiltered against `known_policies()`: an unrecognized name is
    /// returned as-is so `build()`'s rejection path actually runs.
    fn requested_policy_name(&self, state: &ChannelState) -> Option<String> {
        let sc = state.service_config.as_ref()?;
        sc.load_balancing_policy_names().first().cloned()
    }
}

impl LoadBalancer for ChildHandlerLoadBalancer {
    fn update_channel_state(&mut self, state: ChannelState) {
        if let Some(requested) = self.requested_policy_name(&state) {
            if requested != self.current_name {
                if let Some(replacement) = self.build(&requested) {
                    self.current.shutdown();
                    self.current = replacement;
                    self.current_name = match requested.as_str() {
                        "pick_first" => "pick_first",
                        "round_robin" => "round_robin",
                        _ => unreachable!("build() only returns Some for a known policy name"),
                    };
                } else {
                    warn!(
                        "service config named unknown load balancing policy {:?}; keeping {}",
                        requested, self.current_name
                    );
                }
            }
        }

        self.current.update_channel_state(state);
    }

    fn name(&self) -> &'static str {
        self.current_name
    }

    fn shutdown(&mut self) {
        self.current.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Picker;
    use crate::service_config::ServiceConfig;
    use crate::subchannel::Subchannel;
    use crate::transport::{ConnectOutcome, SubchannelTransport, TransportListener};
    use crate::types::{BalancerAddress, ConnectivityState};
    use crate::Status;
    use async_trait::async_trait;
    use std::sync::Arc;
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
            unimplemented!("balancer tests never issue calls")
        }

        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn close(&self) {}
    }

    struct NoopListener;
    impl BalancerUpdateListener for NoopListener {
        fn on_update(&self, _state: ConnectivityState, _picker: Arc<dyn Picker>) {}
    }

    fn factory() -> SubchannelFactory {
        Arc::new(|addresses: Vec<BalancerAddress>| {
            Subchannel::new(addresses, Arc::new(AlwaysReady), Duration::from_secs(1))
        })
    }

    fn addr(port: u16) -> BalancerAddress {
        BalancerAddress::new(format!("127.0.0.1:{port}").parse().unwrap())
    }

    fn with_policy(name: &str) -> ChannelState {
        ChannelState {
            addresses: vec![addr(80)],
            service_config: Some(ServiceConfig::builder().load_balancing_policy(name).build(5).unwrap()),
        }
    }

    #[test]
    fn defaults_to_pick_first() {
        let handler = ChildHandlerLoadBalancer::new(factory(), Arc::new(NoopListener));
        assert_eq!(handler.name(), "pick_first");
    }

    #[tokio::test]
    async fn recognized_policy_switches_the_active_handler() {
        let mut handler = ChildHandlerLoadBalancer::new(factory(), Arc::new(NoopListener));
        handler.update_channel_state(with_policy("round_robin"));
        assert_eq!(handler.name(), "round_robin");
    }

    #[tokio::test]
    async fn unrecognized_policy_keeps_the_active_handler_without_panicking() {
        let mut handler = ChildHandlerLoadBalancer::new(factory(), Arc::new(NoopListener));
        handler.update_channel_state(with_policy("round_robin"));
        handler.update_channel_state(with_policy("weighted_target"));
        assert_eq!(handler.name(), "round_robin");
    }

    #[test]
    fn requested_policy_name_is_unfiltered_by_known_policies() {
        let handler = ChildHandlerLoadBalancer::new(factory(), Arc::new(NoopListener));
        let state = with_policy("weighted_target");
        assert_eq!(handler.requested_policy_name(&state), Some("weighted_target".to_string()));
    }
}
