//! Call Runtime (§4.6): drives exactly one attempt of an RPC over a selected
//! subchannel transport. Parameterized by a method descriptor and a codec;
//! the Retry/Hedging Controller wraps these primitives with re-pick-and-reissue.

mod runtime;

pub(crate) use runtime::{client_streaming, server_streaming, streaming, unary};
pub use runtime::ResponseStream;

use crate::codec::compression::CompressionEncoding;
use std::time::Duration;

/// Identifies one RPC method: `/service/method` on the wire.
#[derive(Clone, Copy, Debug)]
pub struct MethodDescriptor {
    service: &'static str,
    method: &'static str,
}

impl MethodDescriptor {
    pub const fn new(service: &'static str, method: &'static str) -> Self {
        MethodDescriptor { service, method }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub(crate) fn path_and_query(&self) -> http::uri::PathAndQuery {
        format!("/{}/{}", self.service, self.method)
            .parse()
            .expect("service and method names form a valid path")
    }
}

/// Per-attempt knobs: deadline, compression, size caps, and whether the
/// attempt should wait for the channel to become Ready before picking
/// (§6 "Configuration"; §4.5 Pick algorithm).
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub compression: Option<CompressionEncoding>,
    pub max_send_message_size: Option<usize>,
    pub max_recv_message_size: Option<usize>,
    pub wait_for_ready: bool,
}
