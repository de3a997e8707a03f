use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use progd_supervisor::SupervisorError;
use serde::Serialize;

use crate::request_meta::RequestMeta;

/// JSON error body: `{ code, message, request_id }`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub request_id: String,
}

pub fn status_for(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_conflict() => StatusCode::CONFLICT,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn new(
        meta: &RequestMeta,
        status: StatusCode,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            request_id: meta.request_id.clone(),
        }
    }

    pub fn bad_request(meta: &RequestMeta, code: &str, message: impl Into<String>) -> Self {
        Self::new(meta, StatusCode::BAD_REQUEST, code, message)
    }

    pub fn from_supervisor(meta: &RequestMeta, err: SupervisorError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(request_id = %meta.request_id, code = err.code(), %err, "request failed");
        }
        Self::new(meta, status, err.code(), err.to_string())
    }

    pub fn from_json_rejection(meta: &RequestMeta, rejection: JsonRejection) -> Self {
        Self::bad_request(meta, "invalid_body", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_kinds_to_statuses() {
        assert_eq!(
            status_for(&SupervisorError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&SupervisorError::DuplicateName("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&SupervisorError::AlreadyRunning(3)), StatusCode::CONFLICT);
        assert_eq!(status_for(&SupervisorError::NotRunning), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&SupervisorError::InvalidCommand("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&SupervisorError::StopTimeout(9)), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            status_for(&SupervisorError::StartFailed("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn body_carries_request_id() {
        let meta = RequestMeta {
            request_id: "req-1".to_string(),
        };
        let err = ApiError::from_supervisor(&meta, SupervisorError::NotFound("abc".into()));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["code"], "not_found");
        assert_eq!(v["request_id"], "req-1");
        assert!(v["message"].as_str().unwrap().contains("not found"));
        assert!(v.get("status").is_none());
    }
}
