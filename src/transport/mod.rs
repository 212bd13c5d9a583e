//! Subchannel transport (§4.2): establishes and maintains one transport-level
//! connection to one address, and exposes connectivity transitions.

pub(crate) mod active;
pub(crate) mod connector;
pub(crate) mod executor;
pub(crate) mod io;
pub(crate) mod passive;

use crate::Status;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one [`SubchannelTransport::try_connect`] attempt.
#[derive(Debug)]
pub enum ConnectOutcome {
    Success,
    Timeout,
    Failure(Status),
}

/// A state change the transport publishes asynchronously, outside the
/// request/response path: `Idle` when a connection becomes idle-eligible,
/// `TransientFailure` when an established connection is lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Idle,
    TransientFailure,
}

pub(crate) trait TransportListener: Send + Sync + 'static {
    fn on_event(&self, event: TransportEvent);
}

impl<F> TransportListener for F
where
    F: Fn(TransportEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: TransportEvent) {
        (self)(event)
    }
}

/// Establishes and maintains one transport-level connection to one address.
///
/// Two forms are required (§4.2): an **active** transport
/// ([`active::ActiveTransport`]) that opens a proactive connection and
/// monitors it with periodic probes, and a **passive** transport
/// ([`passive::PassiveTransport`]) that does not own a socket and simply
/// reports Ready on a successful request.
///
/// Implementations must execute connect work without capturing ambient
/// per-call state — this falls out naturally in Rust, since there is no
/// implicit async-local context to leak across an `.await` point; the
/// connect future here is given only the address it targets.
#[async_trait]
pub trait SubchannelTransport: Send + Sync {
    /// Attempt to establish the transport to `addr`, bounded by `timeout`.
    async fn try_connect(&self, addr: SocketAddr, timeout: Duration) -> ConnectOutcome;

    /// Send one framed HTTP/2 request over the established connection. Only
    /// valid after `try_connect` has returned `Success` (active) or, for the
    /// passive form, on the first call (which doubles as the connect probe).
    async fn send(
        &self,
        request: http::Request<crate::body::BoxBody>,
    ) -> Result<http::Response<crate::body::BoxBody>, Status>;

    /// Register a listener for asynchronous state events (Idle / TransientFailure).
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    /// Close the transport, releasing any held socket.
    async fn close(&self);
}
