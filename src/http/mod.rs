//! HTTP/1.1 wire primitives for the gateway.
//!
//! [`Framer`] pulls complete [`Request`]s out of a connection buffer,
//! [`Response`] is the normalized shape handlers return, and [`Headers`] is
//! the case-insensitive map shared by both.

use std::fmt;

pub mod framer;
pub mod headers;
pub mod request;
pub mod response;
pub mod sse;

pub use framer::Framer;
pub use headers::Headers;
pub use request::Request;
pub use response::{Body, BodyStream, Response};
pub use sse::{EventSender, SseEvent};

/// The `Content-Type` marker that switches the emitter into streaming mode.
pub const EVENT_STREAM: &str = "text/event-stream";

/// Status of a [`Response`].
///
/// Only the codes the gateway and typical session handlers produce are
/// listed; anything else can be carried through [`StatusCode::Other`].
///
/// # Examples
///
/// ```
/// use sessiongate::http::StatusCode;
///
/// assert_eq!(StatusCode::Conflict.as_u16(), 409);
/// assert_eq!(StatusCode::Conflict.canonical_reason(), "Conflict");
/// assert_eq!(StatusCode::Other(418).canonical_reason(), "Unknown");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Created,
    Accepted,
    NoContent,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    Conflict,
    PayloadTooLarge,
    UnsupportedMediaType,
    InternalServerError,
    ServiceUnavailable,
    /// Any status not covered by a named variant.
    Other(u16),
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NoContent => 204,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::NotAcceptable => 406,
            Self::Conflict => 409,
            Self::PayloadTooLarge => 413,
            Self::UnsupportedMediaType => 415,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
            Self::Other(code) => code,
        }
    }

    /// Reason phrase written after the code on the status line.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::NotAcceptable => "Not Acceptable",
            Self::Conflict => "Conflict",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::InternalServerError => "Internal Server Error",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::Other(_) => "Unknown",
        }
    }

    /// Returns `true` for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// Request method as it appeared on the start line.
///
/// Methods the gateway cares about are unit variants; anything else is kept
/// verbatim in [`Method::Custom`] so a handler can still see it.
///
/// # Examples
///
/// ```
/// use sessiongate::http::Method;
///
/// let method: Method = "DELETE".parse().unwrap();
/// assert_eq!(method, Method::Delete);
/// assert!(!method.ignores_declared_body());
/// assert!(Method::Head.ignores_declared_body());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Custom(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// `GET` and `HEAD` never wait for a body, even when `Content-Length` is sent.
    pub fn ignores_declared_body(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
