use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// RegistryErrorCode: the OCI distribution error taxonomy. Codes travel to
/// the client verbatim inside the standard error body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    TooManyRequests,
    Unknown,
}

impl RegistryErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            RegistryErrorCode::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            RegistryErrorCode::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            RegistryErrorCode::DigestInvalid => "DIGEST_INVALID",
            RegistryErrorCode::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            RegistryErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            RegistryErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            RegistryErrorCode::NameInvalid => "NAME_INVALID",
            RegistryErrorCode::NameUnknown => "NAME_UNKNOWN",
            RegistryErrorCode::SizeInvalid => "SIZE_INVALID",
            RegistryErrorCode::Unauthorized => "UNAUTHORIZED",
            RegistryErrorCode::Denied => "DENIED",
            RegistryErrorCode::Unsupported => "UNSUPPORTED",
            RegistryErrorCode::TooManyRequests => "TOOMANYREQUESTS",
            RegistryErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn default_status(&self) -> StatusCode {
        match self {
            RegistryErrorCode::BlobUnknown
            | RegistryErrorCode::BlobUploadUnknown
            | RegistryErrorCode::ManifestUnknown
            | RegistryErrorCode::NameUnknown => StatusCode::NOT_FOUND,
            RegistryErrorCode::DigestInvalid
            | RegistryErrorCode::BlobUploadInvalid
            | RegistryErrorCode::ManifestBlobUnknown
            | RegistryErrorCode::ManifestInvalid
            | RegistryErrorCode::NameInvalid
            | RegistryErrorCode::SizeInvalid => StatusCode::BAD_REQUEST,
            RegistryErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryErrorCode::Denied => StatusCode::FORBIDDEN,
            RegistryErrorCode::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            RegistryErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            RegistryErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            RegistryErrorCode::BlobUnknown => "blob unknown to registry",
            RegistryErrorCode::BlobUploadInvalid => "blob upload invalid",
            RegistryErrorCode::BlobUploadUnknown => "blob upload unknown to registry",
            RegistryErrorCode::DigestInvalid => "provided digest did not match uploaded content",
            RegistryErrorCode::ManifestBlobUnknown => "manifest references a blob unknown to registry",
            RegistryErrorCode::ManifestInvalid => "manifest invalid",
            RegistryErrorCode::ManifestUnknown => "manifest unknown",
            RegistryErrorCode::NameInvalid => "invalid repository name",
            RegistryErrorCode::NameUnknown => "repository name not known to registry",
            RegistryErrorCode::SizeInvalid => "provided length did not match content length",
            RegistryErrorCode::Unauthorized => "authentication required",
            RegistryErrorCode::Denied => "requested access to the resource is denied",
            RegistryErrorCode::Unsupported => "the operation is unsupported",
            RegistryErrorCode::TooManyRequests => "too many requests",
            RegistryErrorCode::Unknown => "unknown error",
        }
    }
}

/// RegistryError: an error that crosses the HTTP boundary in the standard
/// `{"errors":[{code, message, detail}]}` shape, with a matching status.
#[derive(Clone, Debug)]
pub struct RegistryError {
    pub code: RegistryErrorCode,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    pub status: StatusCode,
    /// Extra response headers (Www-Authenticate, Retry-After).
    pub headers: Vec<(&'static str, String)>,
}

impl RegistryError {
    pub fn new(code: RegistryErrorCode) -> Self {
        RegistryError {
            code,
            message: code.default_message().to_string(),
            detail: None,
            status: code.default_status(),
            headers: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Wraps an unexpected failure. The cause is logged with full context and
    /// the client sees only the opaque UNKNOWN error.
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        error!("internal error while serving request: {err}");
        RegistryError::new(RegistryErrorCode::Unknown)
    }

    pub fn unauthorized_with_challenge(challenge: String) -> Self {
        RegistryError::new(RegistryErrorCode::Unauthorized).with_header("Www-Authenticate", challenge)
    }

    pub fn too_many_requests(retry_after_seconds: u64) -> Self {
        RegistryError::new(RegistryErrorCode::TooManyRequests)
            .with_header("Retry-After", retry_after_seconds.to_string())
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for RegistryError {}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        RegistryError::internal(format!("database error: {err}"))
    }
}

#[derive(Serialize)]
struct ErrorBodyEntry<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let body = json!({
            "errors": [ErrorBodyEntry {
                code: self.code.as_str(),
                message: &self.message,
                detail: self.detail.as_ref(),
            }],
        });
        let mut response = (self.status, Json(body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        for (name, value) in &self.headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                response.headers_mut().insert(*name, value);
            }
        }
        response
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Maps an error code from an upstream registry's response body back into
/// the taxonomy. Unknown codes collapse to UNKNOWN.
pub fn code_from_str(raw: &str) -> RegistryErrorCode {
    use RegistryErrorCode::*;
    match raw {
        "BLOB_UNKNOWN" => BlobUnknown,
        "BLOB_UPLOAD_INVALID" => BlobUploadInvalid,
        "BLOB_UPLOAD_UNKNOWN" => BlobUploadUnknown,
        "DIGEST_INVALID" => DigestInvalid,
        "MANIFEST_BLOB_UNKNOWN" => ManifestBlobUnknown,
        "MANIFEST_INVALID" => ManifestInvalid,
        "MANIFEST_UNKNOWN" => ManifestUnknown,
        "NAME_INVALID" => NameInvalid,
        "NAME_UNKNOWN" => NameUnknown,
        "SIZE_INVALID" => SizeInvalid,
        "UNAUTHORIZED" => Unauthorized,
        "DENIED" => Denied,
        "UNSUPPORTED" => Unsupported,
        "TOOMANYREQUESTS" => TooManyRequests,
        _ => Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        assert_eq!(
            RegistryErrorCode::ManifestBlobUnknown.default_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RegistryErrorCode::BlobUnknown.default_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RegistryErrorCode::TooManyRequests.default_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn internal_errors_do_not_leak_cause() {
        let err = RegistryError::internal("connection refused to 10.0.0.1:5432");
        assert_eq!(err.code, RegistryErrorCode::Unknown);
        assert_eq!(err.message, "unknown error");
    }
}
