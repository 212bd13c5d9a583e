use super::{single_shot_result, Resolver, ResolverListener};
use crate::target::Target;
use crate::types::{BalancerAddress, ResolverUpdate};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use tracing::debug;

/// For `http`/`https` targets: produces exactly one address derived from the
/// URI host and port. `refresh()` is a no-op (§4.1).
pub struct StaticResolver {
    target: Target,
    listener: Option<Arc<dyn ResolverListener>>,
}

impl StaticResolver {
    pub fn new(target: Target) -> Self {
        StaticResolver {
            target,
            listener: None,
        }
    }

    fn resolve_once(&self) -> ResolverUpdate {
        let authority = self.target.uri().authority().cloned();
        let host = authority.as_ref().map(|a| a.host()).unwrap_or("localhost");
        let port = authority
            .as_ref()
            .and_then(|a| a.port_u16())
            .unwrap_or_else(|| if self.target.scheme() == "https" { 443 } else { 80 });

        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => ResolverUpdate::Result(single_shot_result(vec![
                    BalancerAddress::new(addr),
                ])),
                None => ResolverUpdate::Result(single_shot_result(Vec::new())),
            },
            Err(err) => {
                debug!("static resolver failed to resolve {}:{}: {}", host, port, err);
                ResolverUpdate::Error(crate::Status::unavailable(format!(
                    "could not resolve {host}:{port}: {err}"
                )))
            }
        }
    }
}

impl Resolver for StaticResolver {
    fn start(&mut self, listener: Arc<dyn ResolverListener>) {
        listener.update(self.resolve_once());
        self.listener = Some(listener);
    }

    fn refresh(&mut self) {
        if let Some(listener) = &self.listener {
            listener.update(self.resolve_once());
        }
    }

    fn dispose(&mut self) {
        self.listener = None;
    }
}
