//! The gRPC status code and the wire-visible terminal `Status` of a call.
//!
//! `Status` is the one error type that ever crosses the call boundary (§7,
//! "Status-coded failures"). Every other error in this crate — construction
//! errors, programmer errors — is a distinct type precisely so it can never
//! be confused with a wire status (see `crate::error`).

use bytes::Bytes;
use http::header::HeaderValue;
use http::HeaderMap;
use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};
use std::{error::Error as StdError, fmt};
use tracing::{debug, trace, warn};

const GRPC_STATUS_HEADER_CODE: &str = "grpc-status";
const GRPC_STATUS_MESSAGE_HEADER: &str = "grpc-message";
const GRPC_STATUS_DETAILS_HEADER: &str = "grpc-status-details-bin";

/// Characters that must be percent-encoded in a `grpc-message` header value,
/// per the gRPC-over-HTTP2 wire spec (anything outside printable ASCII, plus `%`).
const MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'\r').add(b'\n');

/// A gRPC status describing the terminal result of a call attempt.
///
/// This is the type every `CallAttempt` converges on (spec §3, "CallAttempt
/// ... a response status") and the only error ever surfaced across a
/// committed `Call` (spec §4.7, "Retried errors do not surface; only the
/// terminal, committed status does").
#[derive(Clone)]
pub struct Status {
    code: Code,
    message: String,
    details: Bytes,
}

/// gRPC status codes, matching the canonical gRPC status enum (spec §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Status {
    /// Create a new `Status` with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            details: Bytes::new(),
        }
    }

    /// Attach opaque binary details (`grpc-status-details-bin`).
    pub fn with_details(mut self, details: impl Into<Bytes>) -> Status {
        self.details = details.into();
        self
    }

    pub fn ok(message: impl Into<String>) -> Status {
        Status::new(Code::Ok, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Status {
        Status::new(Code::Unknown, message)
    }

    /// Classify a boxed error into a `Status`, unwrapping a nested `Status`
    /// if one is found anywhere in the source chain (spec §7 propagation
    /// policy: transport-level exceptions are classified into a terminal
    /// status).
    pub fn from_error(err: &(dyn StdError + 'static)) -> Status {
        let mut cause = Some(err);

        while let Some(err) = cause {
            if let Some(status) = err.downcast_ref::<Status>() {
                return status.clone();
            }
            cause = err.source();
        }

        Status::new(Code::Unknown, err.to_string())
    }

    pub(crate) fn map_error<E>(err: E) -> Status
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Status::from_error(&*err.into())
    }

    pub(crate) fn from_header_map(header_map: &HeaderMap) -> Option<Status> {
        header_map.get(GRPC_STATUS_HEADER_CODE).map(|code| {
            let code = Code::from_bytes(code.as_bytes());
            let message = header_map
                .get(GRPC_STATUS_MESSAGE_HEADER)
                .map(|header| {
                    percent_decode(header.as_bytes())
                        .decode_utf8()
                        .map(|cow| cow.into_owned())
                })
                .unwrap_or_else(|| Ok(String::new()));
            let details = header_map
                .get(GRPC_STATUS_DETAILS_HEADER)
                .map(|h| Bytes::copy_from_slice(h.as_bytes()))
                .unwrap_or_else(Bytes::new);
            match message {
                Ok(message) => Status {
                    code,
                    message,
                    details,
                },
                Err(err) => {
                    warn!("error decoding grpc-message header: {}", err);
                    Status {
                        code: Code::Unknown,
                        message: format!("error decoding grpc-message header: {}", err),
                        details,
                    }
                }
            }
        })
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[u8] {
        &self.details
    }

    pub(crate) fn to_header_map(&self) -> Result<HeaderMap, Status> {
        let mut header_map = HeaderMap::with_capacity(3);
        self.add_header(&mut header_map)?;
        Ok(header_map)
    }

    pub(crate) fn add_header(&self, header_map: &mut HeaderMap) -> Result<(), Status> {
        header_map.insert(GRPC_STATUS_HEADER_CODE, self.code.to_header_value());

        if !self.message.is_empty() {
            let needs_encoding = self
                .message
                .bytes()
                .any(|b| MESSAGE_ENCODE_SET.contains(b));
            let value = if needs_encoding {
                percent_encode(self.message.as_bytes(), MESSAGE_ENCODE_SET)
                    .to_string()
                    .into_bytes()
            } else {
                self.message.clone().into_bytes()
            };
            header_map.insert(
                GRPC_STATUS_MESSAGE_HEADER,
                HeaderValue::from_bytes(&value).map_err(invalid_header_value)?,
            );
        }

        if !self.details.is_empty() {
            header_map.insert(
                GRPC_STATUS_DETAILS_HEADER,
                HeaderValue::from_bytes(&self.details).map_err(invalid_header_value)?,
            );
        }

        Ok(())
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Status");
        builder.field("code", &self.code);
        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }
        if !self.details.is_empty() {
            builder.field("details", &self.details);
        }
        builder.finish()
    }
}

fn invalid_header_value<E: fmt::Display>(err: E) -> Status {
    debug!("invalid header value: {}", err);
    Status::internal("couldn't serialize non-text grpc status header")
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grpc-status: {:?}, grpc-message: {:?}", self.code(), self.message())
    }
}

impl StdError for Status {}

/// Map an HTTP status code to a gRPC status when `grpc-status` trailers are
/// absent (spec §4.6, "absent trailers (HTTP error) map to `Internal` or
/// `Unavailable` per a small table keyed on the HTTP status code").
pub(crate) fn status_from_http_status(status_code: http::StatusCode) -> Status {
    let code = match status_code {
        http::StatusCode::BAD_REQUEST => Code::Internal,
        http::StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        http::StatusCode::FORBIDDEN => Code::PermissionDenied,
        http::StatusCode::NOT_FOUND => Code::Unimplemented,
        http::StatusCode::TOO_MANY_REQUESTS
        | http::StatusCode::BAD_GATEWAY
        | http::StatusCode::SERVICE_UNAVAILABLE
        | http::StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    };

    Status::new(
        code,
        format!(
            "grpc-status header missing, mapped from HTTP status code {}",
            status_code.as_u16()
        ),
    )
}

/// Take the terminal `Status` from trailers if present, else infer one from
/// the HTTP status code. Returns `Ok(())` for an OK status.
pub(crate) fn infer_grpc_status(
    trailers: Option<&HeaderMap>,
    status_code: http::StatusCode,
) -> Result<(), Status> {
    if let Some(trailers) = trailers {
        if let Some(status) = Status::from_header_map(trailers) {
            return if status.code() == Code::Ok {
                Ok(())
            } else {
                Err(status)
            };
        }
    }
    trace!("trailers missing grpc-status");
    Err(status_from_http_status(status_code))
}

impl Code {
    pub fn from_i32(i: i32) -> Code {
        Code::from(i)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Code {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .map(Code::from)
            .unwrap_or_else(|| {
                trace!("error parsing grpc-status");
                Code::Unknown
            })
    }

    fn to_header_value(self) -> HeaderValue {
        HeaderValue::from_static(match self {
            Code::Ok => "0",
            Code::Cancelled => "1",
            Code::Unknown => "2",
            Code::InvalidArgument => "3",
            Code::DeadlineExceeded => "4",
            Code::NotFound => "5",
            Code::AlreadyExists => "6",
            Code::PermissionDenied => "7",
            Code::ResourceExhausted => "8",
            Code::FailedPrecondition => "9",
            Code::Aborted => "10",
            Code::OutOfRange => "11",
            Code::Unimplemented => "12",
            Code::Internal => "13",
            Code::Unavailable => "14",
            Code::DataLoss => "15",
            Code::Unauthenticated => "16",
        })
    }
}

impl From<i32> for Code {
    fn from(i: i32) -> Self {
        match i {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Nested(crate::Error);

    impl fmt::Display for Nested {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "nested error: {}", self.0)
        }
    }

    impl StdError for Nested {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&*self.0)
        }
    }

    #[test]
    fn from_error_status() {
        let orig = Status::new(Code::OutOfRange, "weeaboo");
        let found = Status::from_error(&orig);
        assert_eq!(orig.code(), found.code());
        assert_eq!(orig.message(), found.message());
    }

    #[test]
    fn from_error_unknown() {
        let orig: crate::Error = "peek-a-boo".into();
        let found = Status::from_error(&*orig);
        assert_eq!(found.code(), Code::Unknown);
        assert_eq!(found.message(), orig.to_string());
    }

    #[test]
    fn from_error_nested() {
        let orig = Nested(Box::new(Status::new(Code::OutOfRange, "weeaboo")));
        let found = Status::from_error(&orig);
        assert_eq!(found.code(), Code::OutOfRange);
        assert_eq!(found.message(), "weeaboo");
    }

    #[test]
    fn code_from_i32_roundtrip() {
        for i in 0..=16 {
            let code = Code::from(i);
            assert_eq!(i, code as i32);
        }
        assert_eq!(Code::from(-1), Code::Unknown);
        assert_eq!(Code::from(999), Code::Unknown);
    }

    #[test]
    fn header_roundtrip_with_message() {
        let status = Status::new(Code::NotFound, "missing\r\ninjected");
        let headers = status.to_header_map().unwrap();
        let parsed = Status::from_header_map(&headers).unwrap();
        assert_eq!(parsed.code(), Code::NotFound);
        assert_eq!(parsed.message(), "missing\r\ninjected");
    }

    #[test]
    fn infer_status_from_http_code_when_trailers_absent() {
        let status = infer_grpc_status(None, http::StatusCode::SERVICE_UNAVAILABLE).unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
