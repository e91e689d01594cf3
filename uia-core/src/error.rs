use serde_json::json;
use thiserror::Error;

/// Unified error type for the UIA proxy.
///
/// Every variant maps onto the Matrix wire contract: an `errcode` string and
/// an HTTP status. Stage- and request-level errors never terminate the
/// process; they are rendered as `{errcode, error}` JSON bodies.
#[derive(Error, Debug)]
pub enum UiaError {
    #[error("Body is not JSON")]
    NotJson,

    #[error("{0}")]
    BadJson(String),

    #[error("{0}")]
    Unrecognized(String),

    #[error("Missing access token")]
    MissingToken,

    #[error("Unknown access token")]
    UnknownToken,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Token inactive")]
    TokenInactive,

    #[error("Backend unreachable")]
    BackendUnreachable,

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Unknown(String),
}

impl UiaError {
    /// Matrix errcode for the wire body.
    pub fn errcode(&self) -> &'static str {
        match self {
            UiaError::NotJson => "M_NOT_JSON",
            UiaError::BadJson(_) => "M_BAD_JSON",
            UiaError::Unrecognized(_) => "M_UNRECOGNIZED",
            UiaError::MissingToken => "M_MISSING_TOKEN",
            UiaError::UnknownToken => "M_UNKNOWN_TOKEN",
            UiaError::Unauthorized(_) => "M_UNAUTHORIZED",
            UiaError::Forbidden(_) => "M_FORBIDDEN",
            UiaError::TokenInactive => "F_TOKEN_INACTIVE",
            _ => "M_UNKNOWN",
        }
    }

    /// Map to HTTP status code.
    pub fn status(&self) -> u16 {
        match self {
            UiaError::NotJson | UiaError::BadJson(_) | UiaError::Unrecognized(_) => 400,
            UiaError::MissingToken | UiaError::UnknownToken => 403,
            UiaError::Unauthorized(_) | UiaError::Forbidden(_) | UiaError::TokenInactive => 401,
            UiaError::BackendUnreachable
            | UiaError::Store(_)
            | UiaError::Io(_)
            | UiaError::Serde(_) => 500,
            UiaError::Unknown(_) => 400,
        }
    }

    /// Wire message. Internal detail is collapsed for 500-class errors so
    /// store/IO messages never leak to clients.
    pub fn message(&self) -> String {
        match self {
            UiaError::BackendUnreachable
            | UiaError::Store(_)
            | UiaError::Io(_)
            | UiaError::Serde(_) => "Backend unreachable".to_string(),
            other => other.to_string(),
        }
    }

    /// JSON error body, `{errcode, error}`.
    pub fn to_body(&self) -> serde_json::Value {
        json!({ "errcode": self.errcode(), "error": self.message() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errcodes() {
        assert_eq!(UiaError::NotJson.errcode(), "M_NOT_JSON");
        assert_eq!(UiaError::BadJson("x".into()).errcode(), "M_BAD_JSON");
        assert_eq!(UiaError::Unrecognized("x".into()).errcode(), "M_UNRECOGNIZED");
        assert_eq!(UiaError::MissingToken.errcode(), "M_MISSING_TOKEN");
        assert_eq!(UiaError::UnknownToken.errcode(), "M_UNKNOWN_TOKEN");
        assert_eq!(UiaError::Unauthorized("x".into()).errcode(), "M_UNAUTHORIZED");
        assert_eq!(UiaError::Forbidden("x".into()).errcode(), "M_FORBIDDEN");
        assert_eq!(UiaError::TokenInactive.errcode(), "F_TOKEN_INACTIVE");
        assert_eq!(UiaError::BackendUnreachable.errcode(), "M_UNKNOWN");
        assert_eq!(UiaError::Unknown("x".into()).errcode(), "M_UNKNOWN");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(UiaError::NotJson.status(), 400);
        assert_eq!(UiaError::BadJson("x".into()).status(), 400);
        assert_eq!(UiaError::Unrecognized("x".into()).status(), 400);
        assert_eq!(UiaError::MissingToken.status(), 403);
        assert_eq!(UiaError::UnknownToken.status(), 403);
        assert_eq!(UiaError::Unauthorized("x".into()).status(), 401);
        assert_eq!(UiaError::Forbidden("x".into()).status(), 401);
        assert_eq!(UiaError::TokenInactive.status(), 401);
        assert_eq!(UiaError::BackendUnreachable.status(), 500);
        assert_eq!(UiaError::Store("x".into()).status(), 500);
    }

    #[test]
    fn test_body_is_valid_wire_json() {
        let body = UiaError::Forbidden("User not found or invalid password".into()).to_body();
        assert_eq!(body["errcode"], "M_FORBIDDEN");
        assert_eq!(body["error"], "User not found or invalid password");
    }

    #[test]
    fn test_internal_detail_does_not_leak() {
        let body = UiaError::Store("sled: corrupted segment at /var/db".into()).to_body();
        assert_eq!(body["errcode"], "M_UNKNOWN");
        assert_eq!(body["error"], "Backend unreachable");
    }

    #[test]
    fn test_backend_unreachable_wire_shape() {
        let err = UiaError::BackendUnreachable;
        assert_eq!(err.status(), 500);
        assert_eq!(err.to_body()["error"], "Backend unreachable");
    }
}
