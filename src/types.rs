//! Shared data model (§3): addresses, resolver results, and connectivity state.

use crate::service_config::ServiceConfig;
use crate::Status;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A typed attribute bag attached to a [`BalancerAddress`]. Keys are the
/// `TypeId` of the attribute's Rust type, matching how resolver
/// implementations in the reference ecosystem attach opaque per-address
/// data (locality, weight, ...) without the balancer needing to know every
/// possible attribute type (§3).
#[derive(Clone, Default)]
pub struct Attributes {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Attributes::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("len", &self.values.len())
            .finish()
    }
}

/// A host/port endpoint plus its attribute bag.
///
/// Two addresses compare equal by endpoint only (§3): attributes may change
/// without forcing subchannel re-creation.
#[derive(Clone, Debug)]
pub struct BalancerAddress {
    pub addr: SocketAddr,
    pub attributes: Attributes,
}

impl BalancerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        BalancerAddress {
            addr,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(addr: SocketAddr, attributes: Attributes) -> Self {
        BalancerAddress { addr, attributes }
    }
}

impl PartialEq for BalancerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl Eq for BalancerAddress {}

impl std::hash::Hash for BalancerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

/// A snapshot produced by a [`crate::resolver::Resolver`]: an ordered
/// address set, an optional service config, and an optional error.
///
/// Monotonic versioning is not required; the Connection Manager reconciles
/// successive snapshots (§3).
#[derive(Clone, Debug, Default)]
pub struct ResolverResult {
    pub addresses: Vec<BalancerAddress>,
    pub service_config: Option<ServiceConfig>,
}

/// The channel's derived connectivity state (§3), mirrored per-subchannel too (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// An update delivered from a resolver (or synthesized by a subchannel) to
/// its listener: either a fresh result, or an error meaning resolution
/// itself failed (not a backend-reported failure).
#[derive(Clone, Debug)]
pub enum ResolverUpdate {
    Result(ResolverResult),
    Error(Status),
}
