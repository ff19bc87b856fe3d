use anyhow::{Context, anyhow};
use sonic_rs::prelude::*;
use std::path::Path;

/// 从 JSON 文件加载 Perplexity 会话 Cookie（`{"name":"value", ...}`）。
///
/// 文件缺失或无法解析都不阻塞启动：记录警告后以“无存储凭证”运行。
pub fn load_cookies(path: &str) -> Option<Vec<(String, String)>> {
    let path = Path::new(path);

    let data = match std::fs::read(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Cookie 文件不存在: {}，以无凭证模式启动", path.display());
            return None;
        }
        Err(e) => {
            tracing::warn!("读取 Cookie 文件失败: {e}，以无凭证模式启动");
            return None;
        }
    };

    match parse_cookies(&data) {
        Ok(cookies) if cookies.is_empty() => {
            tracing::warn!("Cookie 文件为空: {}", path.display());
            None
        }
        Ok(cookies) => {
            tracing::info!("已加载 {} 条 Cookie", cookies.len());
            Some(cookies)
        }
        Err(e) => {
            tracing::warn!("解析 Cookie 文件失败: {e:#}，以无凭证模式启动");
            None
        }
    }
}

fn parse_cookies(data: &[u8]) -> anyhow::Result<Vec<(String, String)>> {
    // 旧版格式是 Python 字典字面量（`cookies = {...}`），已被结构化 JSON 取代。
    if data.trim_ascii_start().starts_with(b"cookies") {
        return Err(anyhow!(
            "检测到旧版 `cookies = {{...}}` 格式，请改用 JSON 对象（{{\"name\":\"value\"}}）"
        ));
    }

    let value: sonic_rs::Value =
        sonic_rs::from_slice(data).context("Cookie 文件不是合法 JSON")?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("Cookie 文件顶层必须是 JSON 对象"))?;

    let mut out = Vec::new();
    for (name, v) in obj.iter() {
        let Some(s) = v.as_str() else {
            tracing::warn!("Cookie `{name}` 的值不是字符串，已跳过");
            continue;
        };
        out.push((name.to_string(), s.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_object() {
        let data = br#"{"__cf_bm": "abc", "pplx.session-id": "xyz"}"#;
        let cookies = parse_cookies(data).unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0], ("__cf_bm".to_string(), "abc".to_string()));
    }

    #[test]
    fn rejects_legacy_python_literal() {
        let data = b"cookies = {'a': 'b'}";
        assert!(parse_cookies(data).is_err());
    }

    #[test]
    fn rejects_non_object_toplevel() {
        assert!(parse_cookies(b"[1, 2]").is_err());
        assert!(parse_cookies(b"not json at all").is_err());
    }

    #[test]
    fn skips_non_string_values() {
        let data = br#"{"a": "b", "n": 42}"#;
        let cookies = parse_cookies(data).unwrap();
        assert_eq!(cookies, vec![("a".to_string(), "b".to_string())]);
    }
}
