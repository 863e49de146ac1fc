//! Engine error type
//!
//! Every fallible operation in the engine returns [`Error`]. The kind
//! mirrors the HTTP status the transport renders; validation failures
//! additionally carry a field→message map.

use std::collections::BTreeMap;
use thiserror::Error;

/// Error kinds, one per HTTP status the engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    UnsupportedMediaType,
    Teapot,
    InternalServerError,
}

impl ErrorKind {
    /// HTTP status code this kind maps to.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::Conflict => 409,
            ErrorKind::UnsupportedMediaType => 415,
            ErrorKind::Teapot => 418,
            ErrorKind::InternalServerError => 500,
        }
    }

    /// Default message for the kind, used when no message is attached.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not found",
            ErrorKind::MethodNotAllowed => "method not allowed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UnsupportedMediaType => "unsupported media type",
            ErrorKind::Teapot => "I'm a teapot",
            ErrorKind::InternalServerError => "internal server error",
        }
    }
}

/// Engine error: kind, optional message, optional cause, optional
/// per-field validation messages.
#[derive(Debug, Error)]
#[error("{}", render(.kind, .msg, .cause))]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: Option<String>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub fields: Option<BTreeMap<String, String>>,
}

fn render(
    kind: &ErrorKind,
    msg: &Option<String>,
    cause: &Option<Box<dyn std::error::Error + Send + Sync>>,
) -> String {
    let base = match msg {
        Some(m) => m.clone(),
        None => kind.as_str().to_string(),
    };
    match cause {
        Some(c) => format!("{} ({})", base, c),
        None => base,
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, msg: None, cause: None, fields: None }
    }

    pub fn with_msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error { kind, msg: Some(msg.into()), cause: None, fields: None }
    }

    pub fn with_cause(
        kind: ErrorKind,
        msg: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            cause: Some(Box::new(cause)),
            fields: None,
        }
    }

    /// Validation failure carrying a field→message map.
    pub fn fields(fields: BTreeMap<String, String>) -> Self {
        Error {
            kind: ErrorKind::BadRequest,
            msg: None,
            cause: None,
            fields: Some(fields),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_msg(ErrorKind::BadRequest, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::with_msg(ErrorKind::Unauthorized, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::with_msg(ErrorKind::Forbidden, msg)
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(ErrorKind::MethodNotAllowed)
    }

    pub fn conflict() -> Self {
        Self::new(ErrorKind::Conflict)
    }

    /// Unexpected store or IO failure.
    pub fn internal(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error {
            kind: ErrorKind::InternalServerError,
            msg: None,
            cause: Some(Box::new(cause)),
            fields: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Typed error for a transport value whose JSON type does not match the
/// declared field kind. Message format is part of the wire contract.
pub fn type_error(key: &str, want: &str, got: &str) -> Error {
    Error::bad_request(format!("field '{}' want type '{}' but '{}'", key, want, got))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::BadRequest.status(), 400);
        assert_eq!(ErrorKind::Conflict.status(), 409);
        assert_eq!(ErrorKind::Teapot.status(), 418);
        assert_eq!(ErrorKind::InternalServerError.status(), 500);
    }

    #[test]
    fn test_render_with_message() {
        let err = Error::bad_request("field 'f' not set");
        assert_eq!(err.to_string(), "field 'f' not set");

        let err = Error::new(ErrorKind::NotFound);
        assert_eq!(err.to_string(), "not found");
    }

    #[test]
    fn test_type_error_format() {
        let err = type_error("f", "int", "float64");
        assert_eq!(err.to_string(), "field 'f' want type 'int' but 'float64'");
    }
}
