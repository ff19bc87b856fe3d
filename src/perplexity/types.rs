use crate::registry::Mode;
use serde::Serialize;
use sonic_rs::prelude::*;

/// 终态步骤的 step_type 标记。
pub const STEP_TYPE_FINAL: &str = "FINAL";

/// `rest/sse/perplexity_ask` 的请求体。
#[derive(Debug, Clone, Serialize)]
pub struct AskPayload {
    pub query_str: String,
    pub params: AskParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskParams {
    pub attachments: Vec<String>,
    pub frontend_context_uuid: String,
    pub frontend_uuid: String,
    pub is_incognito: bool,
    pub language: String,
    pub last_backend_uuid: Option<String>,
    pub mode: String,
    pub model_preference: String,
    pub source: String,
    pub sources: Vec<String>,
    pub version: String,
}

/// 模式到检索档位的映射：auto 走 concise，其余都是 copilot。
pub fn search_mode(mode: Mode) -> &'static str {
    match mode {
        Mode::Auto => "concise",
        _ => "copilot",
    }
}

/// (模式, 底层模型) 到 Perplexity model_preference 的映射。
/// 未识别的模型名回退到该模式的默认档（与注册表的宽松解析一致）。
pub fn model_preference(mode: Mode, model: Option<&str>) -> &'static str {
    match mode {
        Mode::Auto => "turbo",
        Mode::DeepResearch => "pplx_alpha",
        Mode::Pro => match model {
            Some("sonar") => "experimental",
            Some("gpt-4.5") => "gpt45",
            Some("gpt-4o") => "gpt4o",
            Some("claude 3.7 sonnet") => "claude2",
            Some("gemini 2.0 flash") => "gemini2flash",
            Some("grok-2") => "grok",
            _ => "pplx_pro",
        },
        Mode::Reasoning => match model {
            Some("r1") => "r1",
            Some("o3-mini") => "o3mini",
            Some("claude 3.7 sonnet") => "claude37sonnetthinking",
            _ => "pplx_reasoning",
        },
    }
}

/// 随请求上传的文件内容：文本按 UTF-8 传递，其余按原始字节。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
    Text(String),
    Binary(Vec<u8>),
}

impl FileData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileData::Text(s) => s.as_bytes(),
            FileData::Binary(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// 搜索结果：状态 + 标识 + 有序步骤列表。
///
/// `text` 字段保持原始 Value：上游有时返回步骤数组，有时返回再编码一层的
/// JSON 字符串，由 `steps()` 统一解开。
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SearchResponse {
    #[serde(default, alias = "backend_uuid")]
    pub uuid: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub text: Option<sonic_rs::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchStep {
    pub step_type: String,
    /// content 对象是否存在且非空。answer 缺席但 content 在场是合法形态，
    /// 终态步骤此时对外回 "no response."。
    pub has_content: bool,
    pub answer: Option<String>,
}

impl SearchResponse {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    /// 解出步骤列表。`text` 缺失视为空列表；存在但无法解析返回 None。
    pub fn steps(&self) -> Option<Vec<SearchStep>> {
        let Some(v) = &self.text else {
            return Some(Vec::new());
        };

        let decoded: sonic_rs::Value;
        let arr_v = if let Some(s) = v.as_str() {
            decoded = sonic_rs::from_str(s).ok()?;
            &decoded
        } else {
            v
        };

        let arr = arr_v.as_array()?;
        Some(arr.iter().map(step_from_value).collect())
    }
}

fn step_from_value(v: &sonic_rs::Value) -> SearchStep {
    let Some(obj) = v.as_object() else {
        return SearchStep::default();
    };

    let step_type = obj
        .get(&"step_type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let content = obj.get(&"content").and_then(|c| c.as_object());
    let has_content = content.map(|c| c.iter().next().is_some()).unwrap_or(false);
    let answer = content
        .and_then(|c| c.get(&"answer"))
        .and_then(|a| a.as_str())
        .map(|s| s.to_string());

    SearchStep {
        step_type,
        has_content,
        answer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_preference_mapping() {
        assert_eq!(model_preference(Mode::Auto, None), "turbo");
        assert_eq!(model_preference(Mode::Pro, None), "pplx_pro");
        assert_eq!(model_preference(Mode::Pro, Some("sonar")), "experimental");
        assert_eq!(
            model_preference(Mode::Reasoning, Some("claude 3.7 sonnet")),
            "claude37sonnetthinking"
        );
        assert_eq!(model_preference(Mode::DeepResearch, None), "pplx_alpha");
        // 未识别的模型名回退到模式默认档。
        assert_eq!(model_preference(Mode::Pro, Some("unknown")), "pplx_pro");
    }

    #[test]
    fn steps_decodes_array_form() {
        let resp: SearchResponse = sonic_rs::from_str(
            r#"{"status":"completed","backend_uuid":"u1",
                "text":[{"step_type":"SEARCH"},{"step_type":"FINAL","content":{"answer":"{\"answer\":\"hi\"}"}}]}"#,
        )
        .unwrap();

        assert_eq!(resp.uuid, "u1");
        assert!(resp.is_completed());

        let steps = resp.steps().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_type, "SEARCH");
        assert_eq!(steps[0].answer, None);
        assert_eq!(steps[1].step_type, STEP_TYPE_FINAL);
        assert!(steps[1].has_content);
        assert!(!steps[0].has_content);
        assert_eq!(steps[1].answer.as_deref(), Some("{\"answer\":\"hi\"}"));
    }

    #[test]
    fn steps_decodes_string_encoded_form() {
        let resp: SearchResponse = sonic_rs::from_str(
            r#"{"status":"pending","text":"[{\"step_type\":\"FINAL\",\"content\":{\"answer\":\"x\"}}]"}"#,
        )
        .unwrap();

        let steps = resp.steps().unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].answer.as_deref(), Some("x"));
        assert!(!resp.is_completed());
    }

    #[test]
    fn steps_missing_text_is_empty() {
        let resp: SearchResponse = sonic_rs::from_str(r#"{"status":"completed"}"#).unwrap();
        assert_eq!(resp.steps(), Some(Vec::new()));
    }

    #[test]
    fn steps_undecodable_text_is_none() {
        let resp: SearchResponse =
            sonic_rs::from_str(r#"{"status":"completed","text":"not json"}"#).unwrap();
        assert_eq!(resp.steps(), None);

        let resp: SearchResponse =
            sonic_rs::from_str(r#"{"status":"completed","text":42}"#).unwrap();
        assert_eq!(resp.steps(), None);
    }
}
