use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 网关错误分类。HTTP 状态与 error.type 的对应关系见 `into_response`：
/// 客户端输入问题（400/401）在调用上游之前拦截；上游问题按
/// 域错误（503）/ 空响应（502）/ 结构不完整（500）区分。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("Perplexity 请求失败: {0}")]
    Upstream(String),

    #[error("Perplexity 返回为空: {0}")]
    UpstreamEmpty(String),

    #[error("Perplexity 响应结构异常: {0}")]
    UpstreamProtocol(String),

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
    r#type: String,
    code: u16,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn upstream_empty(message: impl Into<String>) -> Self {
        Self::UpstreamEmpty(message.into())
    }

    pub fn upstream_protocol(message: impl Into<String>) -> Self {
        Self::UpstreamProtocol(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamEmpty(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamProtocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "invalid_request_error",
            AppError::Unauthorized(_) => "authentication_error",
            AppError::Upstream(_) => "perplexity_api_error",
            AppError::UpstreamEmpty(_) | AppError::UpstreamProtocol(_) => "api_error",
            AppError::Io(_) | AppError::Anyhow(_) => "internal_server_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // 统一在这里留痕，内部细节不回传给调用方（5xx 只返回信封）。
        if status.is_server_error() {
            tracing::error!("{self:#}");
        } else {
            tracing::warn!("{self}");
        }

        let message = match &self {
            // 未捕获的内部错误：对外只暴露固定文案。
            AppError::Io(_) | AppError::Anyhow(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: ErrorBodyInner {
                message,
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(AppError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::unauthorized("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::upstream("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppError::upstream_empty("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            AppError::upstream_protocol("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn envelope_wire_shape() {
        let body = ErrorBody {
            error: ErrorBodyInner {
                message: "m".to_string(),
                r#type: "api_error".to_string(),
                code: 502,
            },
        };
        let json = sonic_rs::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":{"message":"m","type":"api_error","code":502}}"#);
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = AppError::Anyhow(anyhow::anyhow!("secret backtrace"));
        assert_eq!(err.error_type(), "internal_server_error");
        // IntoResponse 的文案固定为 Internal Server Error，细节仅进日志。
    }
}
