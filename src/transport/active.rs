//! The active transport (§4.2): opens a proactive connection and monitors it
//! with a periodic probe, publishing `TransientFailure`/`Idle` asynchronously.

use super::connector::Connector;
use super::executor::SharedExec;
use super::io::BoxedIo;
use super::{ConnectOutcome, SubchannelTransport, TransportEvent, TransportListener};
use crate::body::BoxBody;
use crate::Status;
use async_trait::async_trait;
use http::Uri;
use hyper::client::conn::http2;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioTimer;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_service::Service;
use tracing::debug;

type SendRequest = http2::SendRequest<BoxBody>;

/// Settings carried from `ChannelOptions` that affect the HTTP/2 handshake
/// and probe cadence (subset of `transport::channel::Endpoint`'s fields).
#[derive(Clone, Debug)]
pub(crate) struct ActiveTransportConfig {
    pub connect_timeout: Duration,
    pub probe_interval: Duration,
    pub init_stream_window_size: Option<u32>,
    pub init_connection_window_size: Option<u32>,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
}

impl Default for ActiveTransportConfig {
    fn default() -> Self {
        ActiveTransportConfig {
            connect_timeout: Duration::from_secs(20),
            probe_interval: Duration::from_secs(30),
            init_stream_window_size: None,
            init_connection_window_size: None,
            keep_alive_interval: None,
            keep_alive_timeout: None,
        }
    }
}

/// Fields shared with the background probe task, which outlives any single
/// `&self` call and so needs its own `Arc` independent of the transport's
/// own storage (it is held behind `Arc<dyn SubchannelTransport>`).
struct ActiveInner {
    config: ActiveTransportConfig,
    send_request: Mutex<Option<SendRequest>>,
    listener: std::sync::Mutex<Option<Arc<dyn TransportListener>>>,
}

pub(crate) struct ActiveTransport {
    inner: Arc<ActiveInner>,
    executor: SharedExec,
}

impl ActiveTransport {
    pub(crate) fn new(config: ActiveTransportConfig, executor: SharedExec) -> Self {
        ActiveTransport {
            inner: Arc::new(ActiveInner {
                config,
                send_request: Mutex::new(None),
                listener: std::sync::Mutex::new(None),
            }),
            executor,
        }
    }

    async fn handshake(&self, addr: SocketAddr) -> Result<SendRequest, Status> {
        let uri: Uri = format!("http://{addr}")
            .parse()
            .map_err(|err| Status::internal(format!("invalid subchannel address: {err}")))?;

        let mut connector = Connector::new(HttpConnector::new());
        let io: BoxedIo = Service::call(&mut connector, uri)
            .await
            .map_err(|err| {
                Status::unavailable(format!("Error connecting to subchannel.: {err}"))
            })?;

        let mut builder = http2::Builder::new(self.executor.clone());
        builder.timer(TokioTimer::new());
        if let Some(v) = self.inner.config.init_stream_window_size {
            builder.initial_stream_window_size(v);
        }
        if let Some(v) = self.inner.config.init_connection_window_size {
            builder.initial_connection_window_size(v);
        }
        if let Some(v) = self.inner.config.keep_alive_interval {
            builder.keep_alive_interval(v);
        }
        if let Some(v) = self.inner.config.keep_alive_timeout {
            builder.keep_alive_timeout(v);
        }

        let (send_request, connection) = builder
            .handshake(io)
            .await
            .map_err(|err| Status::unavailable(format!("Error connecting to subchannel.: {err}")))?;

        let executor = self.executor.clone();
        hyper::rt::Executor::<_>::execute(
            &executor,
            Box::pin(async move {
                if let Err(err) = connection.await {
                    debug!("subchannel connection task ended: {:?}", err);
                }
            }),
        );

        Ok(send_request)
    }

    fn spawn_probe(&self, addr: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.probe_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let mut guard = inner.send_request.lock().await;
                let Some(send_request) = guard.as_mut() else {
                    return;
                };

                let ready = poll_fn(|cx| send_request.poll_ready(cx)).await;
                if ready.is_err() {
                    debug!("subchannel probe to {} failed, publishing TransientFailure", addr);
                    *guard = None;
                    drop(guard);
                    if let Some(listener) = inner.listener.lock().unwrap().clone() {
                        listener.on_event(TransportEvent::TransientFailure);
                    }
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl SubchannelTransport for ActiveTransport {
    async fn try_connect(&self, addr: SocketAddr, timeout: Duration) -> ConnectOutcome {
        let connect_timeout = timeout.min(self.inner.config.connect_timeout);

        match tokio::time::timeout(connect_timeout, self.handshake(addr)).await {
            Ok(Ok(send_request)) => {
                *self.inner.send_request.lock().await = Some(send_request);
                self.spawn_probe(addr);
                ConnectOutcome::Success
            }
            Ok(Err(status)) => ConnectOutcome::Failure(status),
            Err(_) => ConnectOutcome::Timeout,
        }
    }

    async fn send(
        &self,
        request: http::Request<BoxBody>,
    ) -> Result<http::Response<BoxBody>, Status> {
        let mut guard = self.inner.send_request.lock().await;
        let send_request = guard
            .as_mut()
            .ok_or_else(|| Status::unavailable("subchannel is not connected"))?;

        match send_request.send_request(request).await {
            Ok(response) => Ok(response.map(crate::body::boxed_http_body)),
            Err(err) => {
                *guard = None;
                Err(Status::unavailable(format!("transport error: {err}")))
            }
        }
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.inner.listener.lock().unwrap() = Some(listener);
    }

    async fn close(&self) {
        *self.inner.send_request.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_reasonable_timeouts() {
        let config = ActiveTransportConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert!(config.probe_interval > Duration::from_secs(0));
    }
}
