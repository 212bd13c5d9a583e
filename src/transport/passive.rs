//! The passive transport (§4.2): used when the channel's HTTP driver does not
//! expose connect hooks. It owns no socket of its own and simply reports
//! `Ready` on a successful request, delegating to an inner [`tower_service::Service`].

use super::{ConnectOutcome, SubchannelTransport, TransportListener};
use crate::body::BoxBody;
use crate::Status;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_service::Service;

type Request = http::Request<BoxBody>;
type Response = http::Response<BoxBody>;

/// A passive transport delegating every request, including the implicit
/// connect probe, to an inner tower service that already knows how to reach
/// every address (e.g. a pooling HTTP/2 client shared across subchannels).
pub(crate) struct PassiveTransport<S> {
    inner: Mutex<S>,
    listener: std::sync::Mutex<Option<Arc<dyn TransportListener>>>,
}

impl<S> PassiveTransport<S> {
    pub(crate) fn new(inner: S) -> Self {
        PassiveTransport {
            inner: Mutex::new(inner),
            listener: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl<S> SubchannelTransport for PassiveTransport<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Error: Into<crate::Error> + Send,
    S::Future: Send,
{
    async fn try_connect(&self, _addr: SocketAddr, _timeout: Duration) -> ConnectOutcome {
        // No socket to open eagerly; readiness is only known once a request succeeds.
        ConnectOutcome::Success
    }

    async fn send(&self, request: Request) -> Result<Response, Status> {
        let mut inner = self.inner.lock().await;
        std::future::poll_fn(|cx| inner.poll_ready(cx))
            .await
            .map_err(|err| Status::unavailable(format!("Error connecting to subchannel.: {}", err.into())))?;
        inner
            .call(request)
            .await
            .map_err(|err| Status::from_error(&*err.into()))
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn close(&self) {}
}
