//! Name resolution (§4.1): turns a [`crate::target::Target`] into a stream of
//! [`ResolverResult`]s delivered to a listener.

mod polling;
mod static_resolver;

pub use polling::PollingResolver;
pub use static_resolver::StaticResolver;

use crate::target::Target;
use crate::types::{ResolverResult, ResolverUpdate};
use crate::Status;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback supplied to a [`Resolver`] at construction time. `UpdateAddresses`
/// and `UpdateError` must be safe to invoke from any task; the Connection
/// Manager serializes internally (§4.1).
pub trait ResolverListener: Send + Sync + 'static {
    fn update(&self, update: ResolverUpdate);
}

impl<F> ResolverListener for F
where
    F: Fn(ResolverUpdate) + Send + Sync + 'static,
{
    fn update(&self, update: ResolverUpdate) {
        (self)(update)
    }
}

/// A name resolver for one target.
pub trait Resolver: Send {
    /// Begin resolution. May invoke the listener synchronously.
    fn start(&mut self, listener: Arc<dyn ResolverListener>);

    /// Hint that resolution should run again as soon as reasonable.
    fn refresh(&mut self);

    /// Stop future callbacks. Idempotent.
    fn dispose(&mut self);
}

/// Helper for resolvers that resolve once and never refresh, e.g.
/// [`StaticResolver`]. `refresh`/`dispose` are no-ops beyond bookkeeping.
pub(crate) fn single_shot_result(addresses: Vec<crate::types::BalancerAddress>) -> ResolverResult {
    ResolverResult {
        addresses,
        service_config: None,
    }
}

/// Maps a target scheme (`http`, `https`, `dns`, ...) to a resolver factory.
///
/// `http`/`https` are pre-registered to [`StaticResolver`], `dns` to
/// [`PollingResolver`] (§4.1); callers may register additional schemes.
pub struct ResolverRegistry {
    factories: HashMap<String, Arc<dyn Fn(&Target) -> Box<dyn Resolver> + Send + Sync>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        let mut registry = ResolverRegistry {
            factories: HashMap::new(),
        };
        registry.register("http", |target| {
            Box::new(StaticResolver::new(target.clone()))
        });
        registry.register("https", |target| {
            Box::new(StaticResolver::new(target.clone()))
        });
        registry.register("dns", |target| Box::new(PollingResolver::new(target.clone())));
        registry
    }

    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Target) -> Box<dyn Resolver> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Arc::new(factory));
    }

    pub fn build(&self, target: &Target) -> Result<Box<dyn Resolver>, Status> {
        self.factories
            .get(target.scheme())
            .map(|factory| factory(target))
            .ok_or_else(|| {
                Status::internal(format!("no resolver registered for scheme {:?}", target.scheme()))
            })
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        ResolverRegistry::new()
    }
}
