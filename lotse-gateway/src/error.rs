use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lotse_common::Error;

/// Wraps the shared `Error` enum so every handler's failure path goes
/// through the one `http_status()` mapping instead of hand-building a
/// `(StatusCode, String)` tuple per call site. A thin newtype rather than
/// `impl IntoResponse for Error` directly, since neither the trait nor the
/// type lives in this crate.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}
