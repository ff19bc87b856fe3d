use super::types::Message;
use crate::perplexity::types::FileData;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sonic_rs::prelude::*;

/// 完全空请求时发给上游的兜底提示词。
pub const DEFAULT_PROMPT: &str = "Hello.";
/// 只有附件没有文本时的兜底提示词。
pub const DEFAULT_FILES_PROMPT: &str = "Describe the attached file(s).";

/// 按扩展名识别为文本的上传文件；其余看 MIME 是否 text/*。
const TEXT_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".py", ".json", ".csv", ".html", ".css", ".js", ".xml", ".log", ".srt",
];

#[derive(Debug, Default)]
pub struct ExtractedPrompt {
    pub text: String,
    pub files: Vec<(String, FileData)>,
}

/// 把 messages 压平成单条提示词，并收集附件。
///
/// - 文本部分按出现顺序以换行连接后 trim；
/// - 仅非 multipart 请求才解内联 `data:image/...;base64` 图片
///   （multipart 请求的文件走表单字段，内联图不再处理）；
/// - 坏的 data URL 记日志跳过，不中断请求。
pub fn extract_prompt(
    messages: &[Message],
    is_multipart: bool,
    uploaded: Vec<(String, FileData)>,
) -> ExtractedPrompt {
    let mut text_parts: Vec<String> = Vec::new();
    let mut files = uploaded;
    let mut image_count = 0usize;

    for msg in messages {
        if let Some(s) = msg.content.as_str() {
            text_parts.push(s.to_string());
            continue;
        }

        let Some(parts) = msg.content.as_array() else {
            continue;
        };

        for part in parts {
            let Some(obj) = part.as_object() else {
                continue;
            };
            match obj.get(&"type").and_then(|v| v.as_str()) {
                Some("text") => {
                    let t = obj.get(&"text").and_then(|v| v.as_str()).unwrap_or("");
                    text_parts.push(t.to_string());
                }
                Some("image_url") if !is_multipart => {
                    let url = obj
                        .get(&"image_url")
                        .and_then(|v| v.as_object())
                        .and_then(|o| o.get(&"url"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    if !url.starts_with("data:image") {
                        continue;
                    }
                    match decode_image_data_url(url) {
                        Some((ext, bytes)) => {
                            image_count += 1;
                            let filename = format!("image_{image_count}.{ext}");
                            tracing::debug!("已解码内联图片: {filename}（{} 字节）", bytes.len());
                            files.push((filename, FileData::Binary(bytes)));
                        }
                        None => {
                            tracing::warn!("base64 图片 data URL 解码失败，已跳过");
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let mut text = text_parts.join("\n").trim().to_string();
    if text.is_empty() {
        text = if files.is_empty() {
            DEFAULT_PROMPT.to_string()
        } else {
            DEFAULT_FILES_PROMPT.to_string()
        };
    }

    ExtractedPrompt { text, files }
}

/// `data:image/<subtype>;base64,<payload>` → (扩展名, 原始字节)。
/// MIME 不是 image/* 时扩展名回退为 png。
fn decode_image_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    let (header, encoded) = url.split_once(',')?;

    let mime = header
        .strip_prefix("data:")?
        .split(';')
        .next()
        .unwrap_or_default();
    let ext = mime
        .strip_prefix("image/")
        .filter(|s| !s.is_empty())
        .unwrap_or("png");

    let bytes = BASE64.decode(encoded.trim().as_bytes()).ok()?;
    Some((ext.to_string(), bytes))
}

/// 上传文件是否按文本处理（扩展名命中，或 MIME 以 text/ 开头）。
pub fn is_text_file(filename: &str, mime: Option<&str>) -> bool {
    let lower = filename.to_lowercase();
    if TEXT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return true;
    }
    mime.map(|m| m.starts_with("text/")).unwrap_or(false)
}
