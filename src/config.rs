use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5010;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_PREFIX: &str = "perplexity-chat";
const DEFAULT_LANGUAGE: &str = "en-US";
const DEFAULT_COOKIES_FILE: &str = "cookies.json";

/// 占位密钥：保留原服务的默认值，启动时若仍是它会打印警告。
pub const PLACEHOLDER_API_KEY: &str = "your-secret-api-key";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub model_prefix: String,
    pub language: String,
    pub incognito: bool,

    pub api_key: String,
    pub cookies_file: String,

    pub timeout_ms: u64,
    pub proxy: String,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "MODEL_PREFIX")]
    model_prefix: Option<String>,
    #[serde(alias = "LANGUAGE")]
    language: Option<String>,
    #[serde(alias = "INCOGNITO")]
    incognito: Option<bool>,

    #[serde(alias = "PPLX_OPENAI_KEY")]
    pplx_openai_key: Option<String>,
    #[serde(alias = "COOKIES_FILE")]
    cookies_file: Option<String>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            model_prefix: raw
                .model_prefix
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            language: raw.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            incognito: raw.incognito.unwrap_or(false),
            api_key: raw
                .pplx_openai_key
                .unwrap_or_else(|| PLACEHOLDER_API_KEY.to_string()),
            cookies_file: raw
                .cookies_file
                .unwrap_or_else(|| DEFAULT_COOKIES_FILE.to_string()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        };

        cfg.apply_cli_overrides(std::env::args().skip(1));
        cfg
    }

    /// 命令行覆盖：对齐原服务的启动参数面（env 先行，flag 覆盖）。
    fn apply_cli_overrides(&mut self, args: impl Iterator<Item = String>) {
        let mut args = args;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--port" => {
                    if let Some(v) = args.next()
                        && let Ok(n) = v.trim().parse::<u16>()
                    {
                        self.port = n;
                    }
                }
                "--prefix" => {
                    if let Some(v) = args.next() {
                        self.model_prefix = v;
                    }
                }
                "--language" => {
                    if let Some(v) = args.next() {
                        self.language = v;
                    }
                }
                "--incognito" => {
                    self.incognito = true;
                }
                "--api-key" => {
                    if let Some(v) = args.next() {
                        self.api_key = v;
                    }
                }
                "--cookies-file" => {
                    if let Some(v) = args.next() {
                        self.cookies_file = v;
                    }
                }
                "-debug" | "--debug" => {
                    if let Some(v) = args.next() {
                        self.debug = v;
                    }
                }
                _ => {}
            }
        }
    }

    pub fn api_key_is_placeholder(&self) -> bool {
        self.api_key == PLACEHOLDER_API_KEY
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            model_prefix: DEFAULT_PREFIX.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            incognito: false,
            api_key: PLACEHOLDER_API_KEY.to_string(),
            cookies_file: DEFAULT_COOKIES_FILE.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            proxy: String::new(),
            debug: "off".to_string(),
        }
    }

    #[test]
    fn cli_overrides_take_effect() {
        let mut cfg = base();
        let args = [
            "--port",
            "8080",
            "--prefix",
            "pplx",
            "--incognito",
            "--api-key",
            "secret",
            "--cookies-file",
            "/tmp/c.json",
            "-debug",
            "medium",
        ];
        cfg.apply_cli_overrides(args.iter().map(|s| s.to_string()));

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.model_prefix, "pplx");
        assert!(cfg.incognito);
        assert_eq!(cfg.api_key, "secret");
        assert_eq!(cfg.cookies_file, "/tmp/c.json");
        assert_eq!(cfg.debug, "medium");
        assert!(!cfg.api_key_is_placeholder());
    }

    #[test]
    fn cli_ignores_malformed_port() {
        let mut cfg = base();
        cfg.apply_cli_overrides(["--port", "abc"].iter().map(|s| s.to_string()));
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn dotenv_line_parsing() {
        assert_eq!(
            parse_dotenv_line("PORT=5010"),
            Some(("PORT".to_string(), "5010".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("export LANGUAGE=\"zh-CN\""),
            Some(("LANGUAGE".to_string(), "zh-CN".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("PROXY=http://127.0.0.1:7890 # 本地代理"),
            Some(("PROXY".to_string(), "http://127.0.0.1:7890".to_string()))
        );
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("=value"), None);
    }
}
