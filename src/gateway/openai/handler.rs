use super::convert;
use super::extract;
use super::types::ChatRequest;
use crate::error::AppError;
use crate::gateway::GatewayState;
use crate::logging;
use crate::perplexity::ApiError;
use crate::perplexity::types::FileData;
use axum::Json;
use axum::extract::{FromRequest, Multipart, OriginalUri, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;

/// 请求体上限：内联 base64 图片可能远超 axum 默认的 2MB。
pub const BODY_LIMIT: usize = 32 * 1024 * 1024;

pub async fn handle_list_models(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.path(), &headers, &[]);
    }

    let out = convert::to_models_response(&state.registry);

    if log_level.client_enabled()
        && let Ok(bytes) = sonic_rs::to_vec(&out)
    {
        logging::client_response(StatusCode::OK.as_u16(), start.elapsed(), &bytes);
    }
    (StatusCode::OK, Json(out)).into_response()
}

pub async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let start = Instant::now();
    let log_level = state.cfg.log_level();

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let is_multipart = content_type.contains("multipart/form-data");

    let (req, uploaded) = if is_multipart {
        if log_level.client_enabled() {
            // multipart 正文含文件二进制，只记录请求行与头。
            logging::client_request(method.as_str(), uri.path(), &headers, &[]);
        }
        match read_multipart(request).await {
            Ok(v) => v,
            Err(e) => return fail(log_level, start, e),
        }
    } else {
        let body = match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
            Ok(b) => b,
            Err(e) => {
                return fail(
                    log_level,
                    start,
                    AppError::bad_request(format!("读取请求体失败: {e}")),
                );
            }
        };
        if log_level.client_enabled() {
            logging::client_request(method.as_str(), uri.path(), &headers, body.as_ref());
        }
        match sonic_rs::from_slice::<ChatRequest>(body.as_ref()) {
            Ok(v) => (v, Vec::new()),
            Err(e) => {
                // 排障需要：把原始请求体片段带进 400 详情。
                let snippet: String = String::from_utf8_lossy(body.as_ref())
                    .chars()
                    .take(500)
                    .collect();
                return fail(
                    log_level,
                    start,
                    AppError::bad_request(format!(
                        "请求 JSON 解析失败: {e}。原始请求体: {snippet}"
                    )),
                );
            }
        }
    };

    let Some(messages) = req.messages.as_deref() else {
        return fail(
            log_level,
            start,
            AppError::bad_request("请求缺少 messages 字段"),
        );
    };

    let prompt = extract::extract_prompt(messages, is_multipart, uploaded);

    let model_id = req
        .model
        .clone()
        .unwrap_or_else(|| state.registry.default_id().unwrap_or_default().to_string());
    let params = state.registry.resolve(&model_id);

    tracing::debug!(
        "提交搜索: mode={}, model={:?}, 附件 {} 个, 提示词 {} 字符",
        params.mode.api_name(),
        params.model,
        prompt.files.len(),
        prompt.text.chars().count()
    );

    // 每请求一次上游调用，失败即刻返回，不做重试。
    let search_resp = match state
        .perplexity
        .search(
            &prompt.text,
            &params,
            &prompt.files,
            &state.cfg.language,
            state.cfg.incognito,
        )
        .await
    {
        Ok(v) => v,
        Err(e) => return fail(log_level, start, map_api_error(e)),
    };

    let out = match convert::to_chat_completion(&search_resp, &model_id) {
        Ok(v) => v,
        Err(e) => return fail(log_level, start, e),
    };

    if log_level.client_enabled()
        && let Ok(bytes) = sonic_rs::to_vec(&out)
    {
        logging::client_response(StatusCode::OK.as_u16(), start.elapsed(), &bytes);
    }
    (StatusCode::OK, Json(out)).into_response()
}

/// multipart 分支：`json_payload` 字段承载 JSON 请求体，其余字段按文件收集。
async fn read_multipart(
    request: Request,
) -> Result<(ChatRequest, Vec<(String, FileData)>), AppError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| AppError::bad_request(format!("multipart 解析失败: {e}")))?;

    let mut chat_req: Option<ChatRequest> = None;
    let mut files: Vec<(String, FileData)> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                return Err(AppError::bad_request(format!("multipart 读取失败: {e}")));
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        if name == "json_payload" {
            let raw = field
                .text()
                .await
                .map_err(|e| AppError::bad_request(format!("读取 json_payload 失败: {e}")))?;
            let parsed: ChatRequest = sonic_rs::from_str(&raw)
                .map_err(|_| AppError::bad_request("json_payload 字段不是合法 JSON"))?;
            chat_req = Some(parsed);
            continue;
        }

        let Some(filename) = field
            .file_name()
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty())
        else {
            tracing::warn!("收到空文件字段 `{name}`，已跳过");
            continue;
        };
        let mime = field.content_type().map(|s| s.to_string());

        match field.bytes().await {
            Ok(bytes) => {
                if extract::is_text_file(&filename, mime.as_deref()) {
                    // 文本文件按 UTF-8 读取，坏字节做替换而不是整体失败。
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    files.push((filename, FileData::Text(text)));
                } else {
                    files.push((filename, FileData::Binary(bytes.to_vec())));
                }
            }
            Err(e) => {
                tracing::warn!("读取文件 {filename} 失败: {e}，已跳过");
                continue;
            }
        }
    }

    let Some(chat_req) = chat_req else {
        return Err(AppError::bad_request("multipart 请求缺少 json_payload 字段"));
    };
    Ok((chat_req, files))
}

/// 上游错误到网关错误分类：域错误/网络错误 503，JSON 解码失败 502。
fn map_api_error(err: ApiError) -> AppError {
    match err {
        ApiError::Json(e) => AppError::upstream_empty(format!("上游返回无法解析的 JSON: {e}")),
        other => AppError::upstream(other.to_string()),
    }
}

fn fail(log_level: logging::LogLevel, start: Instant, err: AppError) -> Response {
    if log_level.client_enabled() {
        logging::client_response(
            err.status().as_u16(),
            start.elapsed(),
            err.to_string().as_bytes(),
        );
    }
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_model_field_is_optional() {
        let req: ChatRequest =
            sonic_rs::from_str(r#"{"messages":[{"role":"user","content":"Hello"}]}"#).unwrap();
        assert!(req.model.is_none());
        assert_eq!(req.messages.as_deref().map(|m| m.len()), Some(1));

        // messages 字段整体缺失与空数组是两种形态：前者 400，后者合法。
        let req: ChatRequest = sonic_rs::from_str(r#"{"model":"m"}"#).unwrap();
        assert!(req.messages.is_none());

        let req: ChatRequest = sonic_rs::from_str(r#"{"messages":[]}"#).unwrap();
        assert!(req.messages.as_deref().is_some_and(|m| m.is_empty()));
    }

    #[test]
    fn api_error_mapping() {
        let e = map_api_error(ApiError::Http {
            status: 403,
            message: "denied".to_string(),
        });
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json_err = sonic_rs::from_str::<sonic_rs::Value>("not json").unwrap_err();
        let e = map_api_error(ApiError::Json(json_err));
        assert_eq!(e.status(), StatusCode::BAD_GATEWAY);
    }
}
