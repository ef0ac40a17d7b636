//! Error taxonomy for the request router.
//!
//! Every kind maps to an HTTP status and a short UTF-8 body; the router
//! never panics on malformed input.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("malformed request")]
    MalformedRequest,
    #[error("no session")]
    ForbiddenNoSession,
    #[error("unauthorized")]
    Unauthorized,
    #[error("too many users")]
    TooManyUsers,
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::MalformedRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::ForbiddenNoSession => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::TooManyUsers => 503,
            ErrorKind::Internal(_) => 500,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::ForbiddenNoSession => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::TooManyUsers => "Service Unavailable",
            ErrorKind::Internal(_) => "Internal Server Error",
        }
    }

    /// Short UTF-8 body written alongside the status, preserved verbatim
    /// for client compatibility.
    pub fn body_text(&self) -> String {
        match self {
            ErrorKind::MalformedRequest => "malformed request".to_string(),
            ErrorKind::Unauthorized => "unauthorized".to_string(),
            ErrorKind::ForbiddenNoSession => "forbidden".to_string(),
            ErrorKind::NotFound => "not found".to_string(),
            ErrorKind::TooManyUsers => "too many users".to_string(),
            ErrorKind::Internal(msg) => msg.clone(),
        }
    }
}
