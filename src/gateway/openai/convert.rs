use super::types::{AssistantMessage, ChatCompletion, Choice, ModelItem, ModelsResponse, Usage};
use crate::error::AppError;
use crate::perplexity::types::{STEP_TYPE_FINAL, SearchResponse};
use crate::registry::ModelRegistry;
use crate::util::id;
use chrono::Utc;
use sonic_rs::prelude::*;

pub fn to_models_response(registry: &ModelRegistry) -> ModelsResponse {
    let created = Utc::now().timestamp();
    ModelsResponse {
        object: "list".to_string(),
        data: registry
            .ids()
            .iter()
            .map(|model_id| ModelItem {
                id: model_id.clone(),
                object: "model".to_string(),
                created,
                owned_by: "openai".to_string(),
            })
            .collect(),
    }
}

/// 把上游搜索结果整形为 OpenAI chat.completion。
///
/// 取数优先级：末尾 FINAL 步骤的回答 > 各步骤回答的拼接（模型 ID 加
/// "-fallback" 后缀）> 报错。回答串优先按 JSON 解出其中的 answer 字段。
pub fn to_chat_completion(
    resp: &SearchResponse,
    model_id: &str,
) -> Result<ChatCompletion, AppError> {
    if resp.text.is_none() {
        return Err(AppError::upstream_empty("上游响应缺少 text 字段"));
    }
    let Some(steps) = resp.steps() else {
        return Err(AppError::upstream_empty("上游 text 字段不是合法 JSON"));
    };
    if steps.is_empty() {
        return Err(AppError::upstream_empty("上游返回的步骤列表为空"));
    }

    let created = Utc::now().timestamp();
    let finish_reason = if resp.is_completed() { "stop" } else { "length" };

    if let Some(last) = steps.last()
        && last.step_type == STEP_TYPE_FINAL
        && last.has_content
    {
        let content = match &last.answer {
            Some(raw) => plain_answer(raw),
            None => "no response.".to_string(),
        };
        let completion_id = if resp.uuid.is_empty() {
            id::completion_id(created)
        } else {
            resp.uuid.clone()
        };
        return Ok(completion(
            completion_id,
            model_id.to_string(),
            created,
            content,
            finish_reason,
        ));
    }

    // 终态步骤缺失/无内容：拼接所有带回答的步骤作为降级结果。
    let joined = steps
        .iter()
        .filter_map(|s| s.answer.as_deref())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if !joined.is_empty() {
        let completion_id = if resp.uuid.is_empty() {
            id::fallback_completion_id(created)
        } else {
            resp.uuid.clone()
        };
        return Ok(completion(
            completion_id,
            format!("{model_id}-fallback"),
            created,
            plain_answer(&joined),
            finish_reason,
        ));
    }

    Err(AppError::upstream_protocol(
        "终态步骤缺失且各步骤均无可用回答",
    ))
}

/// 回答串可能再包一层 JSON（`{"answer": "..."}`）；能解出 answer 就用它，
/// 否则原样返回。
fn plain_answer(raw: &str) -> String {
    if let Ok(v) = sonic_rs::from_str::<sonic_rs::Value>(raw)
        && let Some(obj) = v.as_object()
        && let Some(answer) = obj.get(&"answer")
    {
        if let Some(s) = answer.as_str() {
            return s.to_string();
        }
        return answer.to_string();
    }
    raw.to_string()
}

fn completion(
    id: String,
    model: String,
    created: i64,
    content: String,
    finish_reason: &str,
) -> ChatCompletion {
    ChatCompletion {
        id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: Usage::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn resp(json: &str) -> SearchResponse {
        sonic_rs::from_str(json).unwrap()
    }

    #[test]
    fn final_step_with_wrapped_answer() {
        let r = resp(
            r#"{"backend_uuid":"u1","status":"completed",
                "text":[{"step_type":"SEARCH","content":{"web_results":[]}},
                        {"step_type":"FINAL","content":{"answer":"{\"answer\":\"四十二\"}"}}]}"#,
        );
        let out = to_chat_completion(&r, "perplexity-chat/auto").unwrap();

        assert_eq!(out.id, "u1");
        assert_eq!(out.model, "perplexity-chat/auto");
        assert_eq!(out.object, "chat.completion");
        assert_eq!(out.choices.len(), 1);
        assert_eq!(out.choices[0].message.content, "四十二");
        assert_eq!(out.choices[0].message.role, "assistant");
        assert_eq!(out.choices[0].finish_reason, "stop");
        assert_eq!(out.usage.total_tokens, 0);
    }

    #[test]
    fn final_step_with_plain_answer() {
        let r = resp(
            r#"{"status":"completed",
                "text":[{"step_type":"FINAL","content":{"answer":"纯文本回答"}}]}"#,
        );
        let out = to_chat_completion(&r, "m").unwrap();
        assert_eq!(out.choices[0].message.content, "纯文本回答");
        // uuid 缺失时用 pplx-<unix> 兜底。
        assert!(out.id.starts_with("pplx-"));
    }

    #[test]
    fn final_step_without_answer_payload() {
        let r = resp(
            r#"{"status":"completed",
                "text":[{"step_type":"FINAL","content":{"search_results":[]}}]}"#,
        );
        let out = to_chat_completion(&r, "m").unwrap();
        assert_eq!(out.choices[0].message.content, "no response.");
    }

    #[test]
    fn fallback_concatenates_step_answers() {
        let r = resp(
            r#"{"backend_uuid":"u2","status":"pending",
                "text":[{"step_type":"SEARCH","content":{"answer":"部分一"}},
                        {"step_type":"RANK","content":{"answer":"部分二"}}]}"#,
        );
        let out = to_chat_completion(&r, "perplexity-chat/pro-sonar").unwrap();

        assert_eq!(out.model, "perplexity-chat/pro-sonar-fallback");
        assert_eq!(out.choices[0].message.content, "部分一 部分二");
        // 状态不是 completed 时 finish_reason 记为 length。
        assert_eq!(out.choices[0].finish_reason, "length");
    }

    #[test]
    fn no_usable_answer_is_protocol_error() {
        let r = resp(r#"{"status":"completed","text":[{"step_type":"SEARCH"}]}"#);
        let err = to_chat_completion(&r, "m").unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_or_bad_text_is_empty_response_error() {
        let err = to_chat_completion(&resp(r#"{"status":"completed"}"#), "m").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err =
            to_chat_completion(&resp(r#"{"status":"completed","text":"oops"}"#), "m").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err =
            to_chat_completion(&resp(r#"{"status":"completed","text":[]}"#), "m").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn models_response_lists_every_registered_id() {
        let registry = ModelRegistry::build("pfx");
        let out = to_models_response(&registry);

        assert_eq!(out.object, "list");
        assert_eq!(out.data.len(), registry.ids().len());
        for (item, id) in out.data.iter().zip(registry.ids()) {
            assert_eq!(&item.id, id);
            assert_eq!(item.object, "model");
            assert_eq!(item.owned_by, "openai");
        }
    }
}
