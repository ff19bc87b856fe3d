use uuid::Uuid;

/// 上游未返回 uuid 时的兜底补全 ID（对齐原服务的 `pplx-<unix>` 形式）。
pub fn completion_id(created: i64) -> String {
    format!("pplx-{created}")
}

pub fn fallback_completion_id(created: i64) -> String {
    format!("pplx-fallback-{created}")
}

/// Perplexity 请求里的前端标识：每次调用新生成即可。
pub fn frontend_uuid() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_ids_carry_timestamp() {
        assert_eq!(completion_id(1700000000), "pplx-1700000000");
        assert_eq!(
            fallback_completion_id(1700000000),
            "pplx-fallback-1700000000"
        );
    }
}
