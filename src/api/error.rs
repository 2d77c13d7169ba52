use crate::membership::AdmissionError;
use crate::queue::SubmitError;
use axum::{
    extract::{multipart::MultipartRejection, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                error!(error = %format!("{:#}", e), "request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::ChatroomNotFound | AdmissionError::UserNotFound => {
                ApiError::NotFound(err.to_string())
            }
            AdmissionError::Full => ApiError::Forbidden(err.to_string()),
            AdmissionError::AlreadyMember => ApiError::Conflict(err.to_string()),
            AdmissionError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Validation(e) => ApiError::BadRequest(e.to_string()),
            SubmitError::ChatroomNotFound | SubmitError::AuthorNotFound => {
                ApiError::NotFound(err.to_string())
            }
            SubmitError::QueueClosed => ApiError::Internal(anyhow::anyhow!(err.to_string())),
            SubmitError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => ApiError::Unprocessable(e.body_text()),
            other => ApiError::BadRequest(other.body_text()),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ValidationError;

    #[test]
    fn admission_errors_map_to_distinct_codes() {
        assert_eq!(ApiError::from(AdmissionError::ChatroomNotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(AdmissionError::Full).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::from(AdmissionError::AlreadyMember).status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_failures_are_bad_requests() {
        let err = ApiError::from(SubmitError::Validation(ValidationError::Empty));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Message or attachment is required");
    }

    #[test]
    fn internal_errors_hide_details() {
        let response = ApiError::from(anyhow::anyhow!("disk on fire")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
