//! HTTP body type used to carry framed gRPC messages.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;

/// A type erased HTTP body used across the call runtime and transport layer.
pub type BoxBody = UnsyncBoxBody<Bytes, crate::Status>;

/// Box an arbitrary [`http_body::Body`] into a [`BoxBody`].
pub fn boxed<B>(body: B) -> BoxBody
where
    B: http_body::Body<Data = Bytes, Error = crate::Status> + Send + 'static,
{
    UnsyncBoxBody::new(body)
}

/// Box a transport body whose error type isn't [`crate::Status`] yet (e.g. a
/// raw `hyper` connection error), classifying errors via [`crate::Status::from_error`].
pub(crate) fn boxed_http_body<B>(body: B) -> BoxBody
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<crate::Error>,
{
    UnsyncBoxBody::new(body.map_err(|err| crate::Status::map_error(err.into())))
}
