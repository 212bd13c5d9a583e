use super::{Resolver, ResolverListener};
use crate::backoff::{Backoff, BackoffConfig};
use crate::target::Target;
use crate::types::{BalancerAddress, ResolverResult, ResolverUpdate};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Scheme-driven resolver (e.g. `dns:///host:port`). A background task
/// polls the OS resolver; `refresh()` wakes it early. A `refresh()` that
/// arrives while a resolution is already in flight is coalesced into the
/// outstanding one (§4.1) via the single `Notify` permit.
///
/// The actual name lookup is delegated to `ToSocketAddrs`, since a DNS
/// resolver library is explicitly out of scope (spec §1); this models the
/// polling/backoff/coalescing contract around whatever lookup primitive the
/// platform provides.
pub struct PollingResolver {
    target: Target,
    wake: Arc<Notify>,
    disposed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl PollingResolver {
    pub fn new(target: Target) -> Self {
        PollingResolver {
            target,
            wake: Arc::new(Notify::new()),
            disposed: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    fn host_port(&self) -> (String, u16) {
        let authority = self.target.uri().authority().cloned();
        let host = authority
            .as_ref()
            .map(|a| a.host().to_string())
            .unwrap_or_else(|| "localhost".to_string());
        let port = authority.as_ref().and_then(|a| a.port_u16()).unwrap_or(80);
        (host, port)
    }
}

fn lookup(host: &str, port: u16) -> ResolverUpdate {
    match (host, port).to_socket_addrs() {
        Ok(addrs) => ResolverUpdate::Result(ResolverResult {
            addresses: addrs.map(BalancerAddress::new).collect(),
            service_config: None,
        }),
        Err(err) => {
            debug!("polling resolver lookup for {}:{} failed: {}", host, port, err);
            crate::types::ResolverUpdate::Error(crate::Status::unavailable(format!(
                "could not resolve {host}:{port}: {err}"
            )))
        }
    }
}

impl Resolver for PollingResolver {
    fn start(&mut self, listener: Arc<dyn ResolverListener>) {
        let (host, port) = self.host_port();
        let wake = self.wake.clone();
        let disposed = self.disposed.clone();

        let task = tokio::spawn(async move {
            let mut backoff = Backoff::new(BackoffConfig::default());

            loop {
                if disposed.load(Ordering::Acquire) {
                    return;
                }

                let update = lookup(&host, port);
                let is_error = matches!(update, ResolverUpdate::Error(_));
                listener.update(update);

                if disposed.load(Ordering::Acquire) {
                    return;
                }

                if is_error {
                    let delay = backoff.next_delay();
                    trace!("polling resolver backing off for {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wake.notified() => {}
                    }
                } else {
                    backoff.reset();
                    wake.notified().await;
                }
            }
        });

        self.task = Some(task);
    }

    fn refresh(&mut self) {
        self.wake.notify_one();
    }

    fn dispose(&mut self) {
        self.disposed.store(true, Ordering::Release);
        self.wake.notify_one();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PollingResolver {
    fn drop(&mut self) {
        self.dispose();
    }
}
