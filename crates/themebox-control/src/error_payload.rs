use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use themebox_agent::{LifecycleError, support::truncate_utf8};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retriable: bool,
}

/// JSON error response: `{code, message, hint?, retriable?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub payload: ErrorPayload,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: ErrorPayload {
                code: code.to_string(),
                message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
                hint: None,
                retriable: false,
            },
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.payload.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "invalid_id" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "owner_mismatch" => StatusCode::CONFLICT,
        "pool_exhausted" | "port_contended" => StatusCode::SERVICE_UNAVAILABLE,
        "startup_failed" | "theme_sync_failed" => StatusCode::BAD_GATEWAY,
        "theme_sync_timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let code = err.code();
        let mut out = ApiError::new(status_for(code), code, err.to_string());
        if let Some(hint) = err.hint() {
            out = out.with_hint(hint);
        }
        out.payload.retriable = err.is_retriable();
        out
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let err = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", long);
        assert!(err.payload.message.len() <= MAX_MESSAGE_BYTES);
        assert!(err.payload.message.ends_with("(truncated)"));
    }

    #[test]
    fn lifecycle_errors_map_to_http_statuses() {
        let err: ApiError = LifecycleError::NotFound("sb-1".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.payload.code, "not_found");
        assert!(!err.payload.retriable);

        let err: ApiError = LifecycleError::Alloc(themebox_agent::AllocError::PoolExhausted {
            size: 300,
        })
        .into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.payload.retriable);
        assert!(err.payload.hint.is_some());

        let json = serde_json::to_value(&err.payload).unwrap();
        assert_eq!(json["code"], "pool_exhausted");
    }
}
