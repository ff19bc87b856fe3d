use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::Duration;

/// 日志等级（对齐原服务 DEBUG 开关，并区分客户端/后端两侧）：
/// - off：不输出详细请求响应
/// - low：输出客户端请求/响应（格式化/脱敏）
/// - medium：输出客户端 + 后端请求/响应（格式化/脱敏）
/// - high：在 medium 基础上原样输出后端 SSE 行（不折叠/不转换）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    /// 是否原样输出后端 SSE 行（high）。
    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers, HeaderRedact::Client),
        format_body_bytes(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers, HeaderRedact::Backend),
        format_body_bytes(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_stream_line_raw(line: &[u8]) {
    // 不做任何 JSON 解析/格式化；尽量原样输出（仅在非 UTF-8 时降级为 lossy）。
    tracing::info!("{}", String::from_utf8_lossy(line));
}

enum HeaderRedact {
    Client,
    Backend,
}

fn format_headers(headers: &HeaderMap, kind: HeaderRedact) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();

        // 两侧都脱敏凭证头；后端侧的 Cookie 即 Perplexity 会话，绝不能进日志。
        let redacted = match kind {
            HeaderRedact::Client => {
                key_lc == "authorization"
                    || key_lc == "proxy-authorization"
                    || key_lc == "x-api-key"
                    || key_lc == "cookie"
            }
            HeaderRedact::Backend => {
                key_lc == "authorization" || key_lc == "proxy-authorization" || key_lc == "cookie"
            }
        };

        let v = if redacted {
            sonic_rs::Value::from("***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // HeaderMap 可能存在同名多值，统一用数组输出，避免信息丢失。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out = String::with_capacity(MAX_CHARS + 64);
    for (i, ch) in s.chars().enumerate() {
        if i >= MAX_CHARS {
            break;
        }
        out.push(ch);
    }
    out.push_str("...[TRUNCATED]");
    out
}

fn sanitize_json_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    // 递归走 Value，避免先反序列化到强类型结构体导致字段丢失。
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            out.insert(key, sanitize_json_for_log(child));
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let mut out = Vec::with_capacity(arr.len());
        for item in arr {
            out.push(sanitize_json_for_log(item));
        }
        return sonic_rs::Value::from(out);
    }

    if let Some(s) = v.as_str() {
        return sonic_rs::Value::from(truncate_base64_maybe(s).as_ref());
    }

    v.to_owned()
}

/// 截断内联 base64（主要是 image_url 里的 data URL），保留首尾片段便于对照。
fn truncate_base64_maybe(s: &str) -> Cow<'_, str> {
    const KEEP: usize = 20;

    if s.len() <= 100 {
        return Cow::Borrowed(s);
    }

    let Some(idx) = s.find(";base64,") else {
        return Cow::Borrowed(s);
    };

    let prefix_end = idx + ";base64,".len();
    let prefix = &s[..prefix_end];
    let rest = &s[prefix_end..];

    if rest.len() <= KEEP * 2 {
        return Cow::Borrowed(s);
    }

    let omitted = rest.len() - KEEP * 2;
    let mut out = String::with_capacity(prefix.len() + KEEP * 2 + 64);
    out.push_str(prefix);
    out.push_str(&rest[..KEEP]);
    out.push_str(&format!("...[TRUNCATED: {omitted} chars]..."));
    out.push_str(&rest[rest.len() - KEEP..]);
    Cow::Owned(out)
}
