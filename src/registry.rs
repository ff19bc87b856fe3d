use std::collections::HashMap;

/// Perplexity 的搜索策略模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Pro,
    Reasoning,
    Auto,
    DeepResearch,
}

impl Mode {
    /// 传给 Perplexity 的模式名（deep research 原样带空格）。
    pub fn api_name(self) -> &'static str {
        match self {
            Mode::Pro => "pro",
            Mode::Reasoning => "reasoning",
            Mode::Auto => "auto",
            Mode::DeepResearch => "deep research",
        }
    }

    /// 模型 ID 中的片段：空格替换为连字符。
    fn id_segment(self) -> &'static str {
        match self {
            Mode::Pro => "pro",
            Mode::Reasoning => "reasoning",
            Mode::Auto => "auto",
            Mode::DeepResearch => "deep-research",
        }
    }

    /// 空哨兵模型时 ID 是否省略 "-default" 后缀。
    fn bare_when_default(self) -> bool {
        matches!(self, Mode::Auto | Mode::DeepResearch)
    }
}

/// 静态模式表：每个模式下可选的底层模型，空串表示“无指定模型”。
const MODE_TABLE: &[(Mode, &[&str])] = &[
    (
        Mode::Pro,
        &[
            "",
            "sonar",
            "gpt-4.5",
            "gpt-4o",
            "claude 3.7 sonnet",
            "gemini 2.0 flash",
            "grok-2",
        ],
    ),
    (Mode::Reasoning, &["", "r1", "o3-mini", "claude 3.7 sonnet"]),
    (Mode::Auto, &[""]),
    (Mode::DeepResearch, &[""]),
];

/// 一个模型 ID 解析出的 Perplexity 调用参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelParams {
    pub mode: Mode,
    /// None 表示不向 Perplexity 传具体底层模型。
    pub model: Option<String>,
}

/// 启动时构建一次的只读模型注册表；经 Arc 共享给请求处理器，无运行期写路径。
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    ids: Vec<String>,
    map: HashMap<String, ModelParams>,
    default_id: Option<String>,
}

impl ModelRegistry {
    pub fn build(prefix: &str) -> Self {
        Self::build_from(MODE_TABLE, prefix)
    }

    fn build_from(table: &[(Mode, &[&str])], prefix: &str) -> Self {
        let prefix = prefix.trim().trim_end_matches('/');

        let mut ids: Vec<String> = Vec::new();
        let mut map: HashMap<String, ModelParams> = HashMap::new();

        for (mode, models) in table {
            for name in *models {
                let (id, model) = if name.is_empty() {
                    let id = if mode.bare_when_default() {
                        format!("{prefix}/{}", mode.id_segment())
                    } else {
                        format!("{prefix}/{}-default", mode.id_segment())
                    };
                    (id, None)
                } else {
                    let sanitized = name.replace(' ', "-");
                    (
                        format!("{prefix}/{}-{sanitized}", mode.id_segment()),
                        Some(name.to_string()),
                    )
                };

                // 按构造不会为空，仍跳过空 ID 保证表键有效。
                if id.is_empty() {
                    continue;
                }

                if map
                    .insert(id.clone(), ModelParams { mode: *mode, model })
                    .is_none()
                {
                    ids.push(id);
                }
            }
        }

        let default_id = select_default(prefix, &ids);
        if default_id.is_none() {
            tracing::warn!("模型表为空，未能选出默认模型 ID");
        }

        Self {
            ids,
            map,
            default_id,
        }
    }

    /// 注册顺序的全部模型 ID。
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn default_id(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 解析模型 ID。未注册的 ID 回退到默认映射而不是报错：
    /// 这是有意保留的策略（容忍客户端笔误），由测试钉死。
    pub fn resolve(&self, id: &str) -> ModelParams {
        if let Some(p) = self.map.get(id) {
            return p.clone();
        }
        self.default_params()
    }

    fn default_params(&self) -> ModelParams {
        self.default_id
            .as_deref()
            .and_then(|id| self.map.get(id).cloned())
            .unwrap_or(ModelParams {
                mode: Mode::Auto,
                model: None,
            })
    }
}

/// 默认选择：{prefix}/auto 优先，其次第一个 {prefix}/pro-，再次第一个注册项。
fn select_default(prefix: &str, ids: &[String]) -> Option<String> {
    let auto_id = format!("{prefix}/auto");
    if ids.iter().any(|id| *id == auto_id) {
        return Some(auto_id);
    }

    let pro_prefix = format!("{prefix}/pro-");
    if let Some(id) = ids.iter().find(|id| id.starts_with(&pro_prefix)) {
        return Some(id.clone());
    }

    ids.first().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "perplexity-chat";

    #[test]
    fn build_generates_expected_ids() {
        let reg = ModelRegistry::build(PREFIX);

        assert!(reg.ids().contains(&format!("{PREFIX}/auto")));
        assert!(reg.ids().contains(&format!("{PREFIX}/deep-research")));
        assert!(reg.ids().contains(&format!("{PREFIX}/pro-default")));
        assert!(reg.ids().contains(&format!("{PREFIX}/reasoning-default")));
        assert!(reg.ids().contains(&format!("{PREFIX}/pro-claude-3.7-sonnet")));
        assert!(reg.ids().contains(&format!("{PREFIX}/reasoning-o3-mini")));
    }

    #[test]
    fn ids_are_unique_and_resolve_to_their_params() {
        let reg = ModelRegistry::build(PREFIX);

        let mut seen = std::collections::HashSet::new();
        for id in reg.ids() {
            assert!(seen.insert(id.clone()), "重复的模型 ID: {id}");
            // 注册过的 ID 必须命中自身映射，而不是回退到默认。
            assert!(reg.map.contains_key(id));
        }

        let p = reg.resolve(&format!("{PREFIX}/pro-sonar"));
        assert_eq!(p.mode, Mode::Pro);
        assert_eq!(p.model.as_deref(), Some("sonar"));

        let p = reg.resolve(&format!("{PREFIX}/pro-claude-3.7-sonnet"));
        assert_eq!(p.model.as_deref(), Some("claude 3.7 sonnet"));

        let p = reg.resolve(&format!("{PREFIX}/deep-research"));
        assert_eq!(p.mode, Mode::DeepResearch);
        assert_eq!(p.model, None);
    }

    #[test]
    fn default_prefers_auto() {
        let reg = ModelRegistry::build(PREFIX);
        assert_eq!(reg.default_id(), Some(format!("{PREFIX}/auto").as_str()));
    }

    #[test]
    fn default_falls_back_to_first_pro_without_auto() {
        let table: &[(Mode, &[&str])] = &[(Mode::Pro, &["", "sonar"]), (Mode::Reasoning, &["r1"])];
        let reg = ModelRegistry::build_from(table, PREFIX);
        assert_eq!(
            reg.default_id(),
            Some(format!("{PREFIX}/pro-default").as_str())
        );
    }

    #[test]
    fn unknown_id_resolves_to_default_mapping() {
        let reg = ModelRegistry::build(PREFIX);
        let default = reg.resolve(reg.default_id().unwrap());
        assert_eq!(reg.resolve("no-such/model"), default);
        assert_eq!(reg.resolve(""), default);
    }

    #[test]
    fn empty_table_degrades_to_auto_fallback() {
        let reg = ModelRegistry::build_from(&[], PREFIX);
        assert!(reg.is_empty());
        assert_eq!(reg.default_id(), None);

        let p = reg.resolve("anything");
        assert_eq!(p.mode, Mode::Auto);
        assert_eq!(p.model, None);
    }

    #[test]
    fn prefix_trailing_slash_is_normalized() {
        let reg = ModelRegistry::build("pplx/");
        assert!(reg.ids().contains(&"pplx/auto".to_string()));
    }
}
