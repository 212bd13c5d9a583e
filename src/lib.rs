#![recursion_limit = "256"]

//! Client-side connection-management and call-dispatch engine for a
//! gRPC-over-HTTP/2 stack: resolver, subchannel, load balancer, connection
//! manager, call runtime, and retry/hedging controller, fronted by a single
//! [`Channel`] entry point.

pub mod body;
pub mod codec;
#[doc(hidden)]
pub mod error;
pub mod metadata;

mod backoff;
mod balancer;
mod call;
mod channel;
mod connection_manager;
mod extensions;
mod interceptor;
mod invoker;
mod request;
mod resolver;
mod response;
mod retry;
mod service_config;
mod status;
mod subchannel;
mod target;
mod transport;
mod types;

pub use call::{CallOptions, MethodDescriptor, ResponseStream};
pub use channel::{Channel, ChannelBuildError, ChannelOptions, Credentials};
pub use extensions::GrpcMethod;
pub use interceptor::Interceptor;
pub use invoker::{CallUsageError, Invoker};
pub use request::Request;
pub use response::Response;
pub use service_config::{
    HedgingPolicy, MethodConfig, MethodPolicy, RetryPolicy, RetryThrottlingPolicy, ServiceConfig,
    ServiceConfigBuilder, ServiceConfigError,
};
pub use status::{Code, Status};
pub use target::Target;

pub(crate) use error::Error;
