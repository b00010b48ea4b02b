use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::repo::RepoError;
use crate::uploads::UploadError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("{0}")] BadRequest(String),
    #[error("authorization required")] Unauthorized,
    #[error("forbidden")] Forbidden,
    #[error("missing upload configuration: {}", .0.join(", "))] MissingConfig(Vec<String>),
    #[error("internal error")] Internal,
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Conflict => ApiError::Conflict,
            RepoError::Invalid(msg) => ApiError::BadRequest(msg),
            RepoError::Database(err) => {
                log::error!("database error: {err}");
                ApiError::Internal
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::MissingSettings(names) => ApiError::MissingConfig(names),
            UploadError::Unauthorized => ApiError::Unauthorized,
            UploadError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            UploadError::Signing(msg) => {
                log::error!("presigning failed: {msg}");
                ApiError::Internal
            }
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::MissingConfig(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HttpResponse::build(status).json(ApiErrorBody { error: self.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn missing_config_lists_names() {
        let err = ApiError::MissingConfig(vec!["S3_UPLOAD_KEY".into(), "S3_UPLOAD_BUCKET".into()]);
        assert_eq!(err.to_string(), "missing upload configuration: S3_UPLOAD_KEY, S3_UPLOAD_BUCKET");
        assert_eq!(err.error_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn repo_errors_map_to_statuses() {
        assert_eq!(ApiError::from(RepoError::NotFound).error_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(RepoError::Invalid("bad".into())).error_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
