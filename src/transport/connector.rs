use super::io::BoxedIo;
use crate::transport::BoxFuture;
use http::Uri;
use hyper::rt;
use std::fmt;
use std::task::{Context, Poll};
use tower_service::Service;

/// Wraps an inner `Service<Uri>` (e.g. `hyper_util::client::legacy::connect::HttpConnector`)
/// and boxes its I/O type so the transport layer can stay generic over the
/// concrete connector. TLS is out of scope here: it's an external
/// collaborator (§1), not a branch of this type.
pub(crate) struct Connector<C> {
    inner: C,
}

impl<C> Connector<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C> Service<Uri> for Connector<C>
where
    C: Service<Uri>,
    C::Response: rt::Read + rt::Write + Unpin + Send + 'static,
    C::Future: Send + 'static,
    crate::Error: From<C::Error> + Send + 'static,
{
    type Response = BoxedIo;
    type Error = ConnectError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|err| ConnectError(From::from(err)))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connect = self.inner.call(uri);

        Box::pin(async move {
            let io = connect.await.map_err(|err| ConnectError(err.into()))?;
            Ok(BoxedIo::new(io))
        })
    }
}

/// Error connecting to a subchannel's address. Surfaced to the Call Runtime
/// as `Unavailable` with detail "Error connecting to subchannel." (§7).
#[derive(Debug)]
pub(crate) struct ConnectError(crate::Error);

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
