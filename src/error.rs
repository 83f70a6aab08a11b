use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    BadRequest { message: String, code: &'static str },

    #[error("{0}")]
    Moderation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("The model `{0}` does not exist or you do not have access to it.")]
    ModelNotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Daily quota exceeded: {bucket}")]
    QuotaExceeded { bucket: String },

    #[error("{0}")]
    Upstream(String),

    #[error("No available tokens. Please try again later.")]
    NoCredential,

    #[error("Internal server error")]
    Internal(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
    code: &'static str,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            code: "invalid_request",
        }
    }

    /// 带自定义 code 的参数错误（例如 empty_prompt / invalid_response_format）。
    pub fn bad_request_code(message: impl Into<String>, code: &'static str) -> Self {
        Self::BadRequest {
            message: message.into(),
            code,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest { .. } | AppError::Moderation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NoCredential => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_)
            | AppError::Internal(_)
            | AppError::Db(_)
            | AppError::Io(_)
            | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest { code, .. } => code,
            AppError::Moderation(_) => "content_moderated",
            AppError::Unauthorized(_) => "invalid_api_key",
            AppError::ModelNotFound(_) => "model_not_found",
            AppError::PayloadTooLarge(_) => "file_too_large",
            AppError::QuotaExceeded { .. } => "daily_quota_exceeded",
            AppError::Upstream(_) => "upstream_error",
            AppError::NoCredential => "no_available_token",
            AppError::Internal(_) | AppError::Db(_) | AppError::Io(_) | AppError::Anyhow(_) => {
                "internal_error"
            }
        }
    }

    /// 面向客户端的消息：内部错误统一为通用文案，不泄露细节。
    pub fn client_message(&self) -> String {
        match self {
            AppError::Internal(_) | AppError::Db(_) | AppError::Io(_) | AppError::Anyhow(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// 审计日志使用的完整错误描述（含内部细节）。
    pub fn log_message(&self) -> String {
        match self {
            AppError::Internal(msg) => msg.clone(),
            AppError::Anyhow(e) => format!("{e:#}"),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR && !matches!(self, AppError::Upstream(_)) {
            tracing::error!("内部错误: {}", self.log_message());
        }

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.client_message(),
                r#type: "invalid_request_error",
                code: self.code(),
            },
        };

        (status, Json(body)).into_response()
    }
}
