use crate::config::Config;
use crate::logging;
use crate::perplexity::types::{
    AskParams, AskPayload, FileData, SearchResponse, model_preference, search_mode,
};
use crate::registry::ModelParams;
use crate::util::id;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use sonic_rs::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::StreamExt;

const ASK_URL: &str = "https://www.perplexity.ai/rest/sse/perplexity_ask";
const CREATE_UPLOAD_URL: &str = "https://www.perplexity.ai/rest/uploads/create_upload_url";

// 伪装浏览器 UA：该接口不接受非浏览器客户端。
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const PARAMS_VERSION: &str = "2.18";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Perplexity API 错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Perplexity 会话客户端。
///
/// 每次 `search` 是一次完整调用：可选的附件上传，然后一条 SSE 请求读到
/// 结束。不重试；超时由构造时的 `TIMEOUT` 配置约束。
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    cookie_header: Option<HeaderValue>,
    log_level: logging::LogLevel,
}

impl Client {
    pub fn new(cfg: &Config, cookies: Option<Vec<(String, String)>>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        let cookie_header = match cookies {
            Some(pairs) if !pairs.is_empty() => {
                let joined = pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(HeaderValue::from_str(&joined).map_err(|e| {
                    anyhow::anyhow!("Cookie 含有无法放入请求头的字符: {e}")
                })?)
            }
            _ => None,
        };

        Ok(Self {
            http: builder.build()?,
            cookie_header,
            log_level: cfg.log_level(),
        })
    }

    /// 执行一次搜索。prompt 与附件由调用方准备好；mode/model 来自注册表解析。
    pub async fn search(
        &self,
        prompt: &str,
        params: &ModelParams,
        files: &[(String, FileData)],
        language: &str,
        incognito: bool,
    ) -> Result<SearchResponse, ApiError> {
        let mut attachments = Vec::with_capacity(files.len());
        for (filename, data) in files {
            let url = self.upload_attachment(filename, data).await?;
            attachments.push(url);
        }

        let payload = AskPayload {
            query_str: prompt.to_string(),
            params: AskParams {
                attachments,
                frontend_context_uuid: id::frontend_uuid(),
                frontend_uuid: id::frontend_uuid(),
                is_incognito: incognito,
                language: language.to_string(),
                last_backend_uuid: None,
                mode: search_mode(params.mode).to_string(),
                model_preference: model_preference(params.mode, params.model.as_deref())
                    .to_string(),
                source: "default".to_string(),
                sources: Vec::new(),
                version: PARAMS_VERSION.to_string(),
            },
        };

        let body = sonic_rs::to_vec(&payload)?;
        let headers = self.ask_headers();
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", ASK_URL, &headers, &body);
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(ASK_URL)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await?;
            if self.log_level.backend_enabled() {
                logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
            }
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        let last_payload = self.read_sse_final_message(resp).await?;

        let Some(payload) = last_payload else {
            if self.log_level.backend_enabled() {
                logging::backend_response(status.as_u16(), start.elapsed(), &[]);
            }
            return Ok(SearchResponse::default());
        };

        if self.log_level.backend_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), &payload);
        }
        Ok(sonic_rs::from_slice::<SearchResponse>(&payload)?)
    }

    /// 逐行消费 SSE 流，保留最后一条 message 事件的 data 负载。
    /// 非流式语义：整条流读完才返回，不向调用方转发中间态。
    async fn read_sse_final_message(
        &self,
        resp: reqwest::Response,
    ) -> Result<Option<Vec<u8>>, ApiError> {
        let raw_log = self.log_level.raw_enabled();

        let mut last_payload: Option<Vec<u8>> = None;
        let mut current_event: Option<String> = None;

        let mut buf: Vec<u8> = Vec::with_capacity(4 * 1024);
        let mut processed: usize = 0;

        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            buf.extend_from_slice(chunk.as_ref());

            while let Some(nl_rel) = buf[processed..].iter().position(|&b| b == b'\n') {
                let nl = processed + nl_rel;
                let mut line = &buf[processed..nl];
                processed = nl + 1;

                if raw_log {
                    logging::backend_stream_line_raw(line);
                }
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }

                if line.is_empty() {
                    // 空行是事件分隔符。
                    current_event = None;
                    continue;
                }

                if let Some(rest) = line.strip_prefix(b"event: ") {
                    current_event = Some(String::from_utf8_lossy(rest).trim().to_string());
                    continue;
                }

                if let Some(data) = line.strip_prefix(b"data: ") {
                    // 只认 message 事件（或无事件名的裸 data 行）。
                    let take = match current_event.as_deref() {
                        None | Some("message") => true,
                        _ => false,
                    };
                    if take {
                        last_payload = Some(data.to_vec());
                    }
                }
            }

            buf.drain(..processed);
            processed = 0;
        }

        Ok(last_payload)
    }

    async fn upload_attachment(
        &self,
        filename: &str,
        data: &FileData,
    ) -> Result<String, ApiError> {
        let content_type = match data {
            FileData::Text(_) => "text/plain".to_string(),
            FileData::Binary(_) => mime_guess::from_path(filename)
                .first_or_octet_stream()
                .to_string(),
        };

        let create_req = CreateUploadRequest {
            filename,
            content_type: &content_type,
            source: "default",
            file_size: data.len(),
            force_image: false,
        };

        let body = sonic_rs::to_vec(&create_req)?;
        let headers = self.base_headers();
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", CREATE_UPLOAD_URL, &headers, &body);
        }

        let resp = self
            .http
            .post(CREATE_UPLOAD_URL)
            .headers(headers)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        let target: CreateUploadResponse = sonic_rs::from_slice(&bytes)?;

        let mut form = reqwest::multipart::Form::new();
        for (k, v) in &target.fields {
            form = form.text(k.clone(), v.clone());
        }
        let part = reqwest::multipart::Part::bytes(data.as_bytes().to_vec())
            .file_name(filename.to_string())
            .mime_str(&content_type)?;
        form = form.part("file", part);

        let up = self
            .http
            .post(&target.s3_bucket_url)
            .multipart(form)
            .send()
            .await?;
        if !up.status().is_success() {
            return Err(ApiError::Http {
                status: up.status().as_u16(),
                message: format!("附件上传失败: {filename}"),
            });
        }

        Ok(target.s3_object_url)
    }

    fn base_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        if let Some(cookie) = &self.cookie_header {
            h.insert(COOKIE, cookie.clone());
        }
        h
    }

    fn ask_headers(&self) -> HeaderMap {
        let mut h = self.base_headers();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        h
    }
}

#[derive(Debug, Serialize)]
struct CreateUploadRequest<'a> {
    filename: &'a str,
    content_type: &'a str,
    source: &'a str,
    file_size: usize,
    force_image: bool,
}

#[derive(Debug, Deserialize)]
struct CreateUploadResponse {
    s3_bucket_url: String,
    s3_object_url: String,
    #[serde(default)]
    fields: HashMap<String, String>,
}

fn extract_error_details(status: u16, body: &[u8]) -> ApiError {
    // 错误体没有稳定契约：尽力取 message / error.message / error（字符串），
    // 都取不到就带上正文片段。
    if let Ok(v) = sonic_rs::from_slice::<sonic_rs::Value>(body) {
        let direct = v.as_object().and_then(|o| o.get(&"message")).and_then(|m| m.as_str());
        let nested = v
            .as_object()
            .and_then(|o| o.get(&"error"))
            .and_then(|e| {
                e.as_str()
                    .or_else(|| e.as_object().and_then(|o| o.get(&"message")).and_then(|m| m.as_str()))
            });
        if let Some(msg) = direct.or(nested) {
            return ApiError::Http {
                status,
                message: msg.to_string(),
            };
        }
    }

    let snippet: String = String::from_utf8_lossy(body).chars().take(200).collect();
    ApiError::Http {
        status,
        message: snippet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_details_prefers_structured_message() {
        let e = extract_error_details(403, br#"{"error":{"message":"forbidden"}}"#);
        assert_eq!(e.status(), Some(403));
        assert!(e.to_string().contains("forbidden"));

        let e = extract_error_details(429, br#"{"message":"rate limited"}"#);
        assert!(e.to_string().contains("rate limited"));

        let e = extract_error_details(500, b"<html>oops</html>");
        assert!(e.to_string().contains("<html>oops</html>"));
    }
}
