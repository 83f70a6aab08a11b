use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_BASE_URL: &str = "https://grok.com";
const DEFAULT_ASSETS_URL: &str = "https://assets.grok.com";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

/// 默认按东八区切分配额日（与 Python 版 CACHE_RESET_TZ_OFFSET_MINUTES 默认值一致）。
const DEFAULT_TZ_OFFSET_MINUTES: i32 = 480;
const MIN_TZ_OFFSET_MINUTES: i32 = -720;
const MAX_TZ_OFFSET_MINUTES: i32 = 840;

pub const IMAGE_METHOD_LEGACY: &str = "legacy";
pub const IMAGE_METHOD_EXPERIMENTAL: &str = "imagine_ws_experimental";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub timeout_ms: u64,
    pub proxy: String,
    pub user_agent: String,

    /// 全局管理员 Key：不受每日额度限制。
    pub api_key: String,

    pub base_url: String,
    pub assets_url: String,
    /// 对外访问地址，用于拼接 url 模式下的图片链接；为空时返回相对路径。
    pub app_url: String,
    pub cf_clearance: String,

    pub retry_status_codes: Vec<u16>,
    pub retry_max_attempts: usize,

    pub upload_concurrency: usize,
    pub image_concurrency: usize,
    pub image_generation_method: String,
    pub image_format: String,

    pub tz_offset_minutes: i32,

    pub cooldown: CooldownConfig,
    pub token_selection: String,

    pub asset_ttl_secs: u64,

    pub debug: String,
    pub log_format: String,

    pub data_dir: String,
    pub tokens_file: String,
    pub api_keys_file: String,
}

/// 凭证冷却策略的可配置阈值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownConfig {
    /// 401 类失败的冷却时长；None 表示无限期（需人工恢复）。
    pub auth: Option<Duration>,
    pub rate_limit_base: Duration,
    pub rate_limit_max: Duration,
    pub server_error: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            auth: None,
            rate_limit_base: Duration::from_secs(60),
            rate_limit_max: Duration::from_secs(3600),
            server_error: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "USER_AGENT")]
    user_agent: Option<String>,

    #[serde(alias = "API_KEY")]
    api_key: Option<String>,

    #[serde(alias = "BASE_URL")]
    base_url: Option<String>,
    #[serde(alias = "ASSETS_URL")]
    assets_url: Option<String>,
    #[serde(alias = "APP_URL")]
    app_url: Option<String>,
    #[serde(alias = "CF_CLEARANCE")]
    cf_clearance: Option<String>,

    #[serde(alias = "RETRY_STATUS_CODES")]
    retry_status_codes: Option<String>,
    #[serde(alias = "RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<usize>,

    #[serde(alias = "UPLOAD_CONCURRENCY")]
    upload_concurrency: Option<usize>,
    #[serde(alias = "IMAGE_CONCURRENCY")]
    image_concurrency: Option<usize>,
    #[serde(alias = "IMAGE_GENERATION_METHOD")]
    image_generation_method: Option<String>,
    #[serde(alias = "IMAGE_FORMAT")]
    image_format: Option<String>,

    #[serde(alias = "QUOTA_TZ_OFFSET_MINUTES")]
    quota_tz_offset_minutes: Option<String>,
    #[serde(alias = "CACHE_RESET_TZ_OFFSET_MINUTES")]
    cache_reset_tz_offset_minutes: Option<String>,

    #[serde(alias = "COOLDOWN_AUTH_SECS")]
    cooldown_auth_secs: Option<u64>,
    #[serde(alias = "COOLDOWN_RATE_LIMIT_BASE_SECS")]
    cooldown_rate_limit_base_secs: Option<u64>,
    #[serde(alias = "COOLDOWN_RATE_LIMIT_MAX_SECS")]
    cooldown_rate_limit_max_secs: Option<u64>,
    #[serde(alias = "COOLDOWN_ERROR_SECS")]
    cooldown_error_secs: Option<u64>,
    #[serde(alias = "TOKEN_SELECTION")]
    token_selection: Option<String>,

    #[serde(alias = "ASSET_TTL_SECS")]
    asset_ttl_secs: Option<u64>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "LOG_FORMAT")]
    log_format: Option<String>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "TOKENS_FILE")]
    tokens_file: Option<String>,
    #[serde(alias = "API_KEYS_FILE")]
    api_keys_file: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        let data_dir = non_empty(raw.data_dir).unwrap_or_else(|| "./data".to_string());
        let tokens_file = non_empty(raw.tokens_file).unwrap_or_else(|| {
            PathBuf::from(&data_dir)
                .join("tokens.json")
                .to_string_lossy()
                .into_owned()
        });
        let api_keys_file = non_empty(raw.api_keys_file).unwrap_or_else(|| {
            PathBuf::from(&data_dir)
                .join("api_keys.json")
                .to_string_lossy()
                .into_owned()
        });

        let defaults = CooldownConfig::default();
        let cooldown = CooldownConfig {
            auth: match raw.cooldown_auth_secs {
                None | Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
            },
            rate_limit_base: raw
                .cooldown_rate_limit_base_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_base),
            rate_limit_max: raw
                .cooldown_rate_limit_max_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_max),
            server_error: raw
                .cooldown_error_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.server_error),
        };

        let tz_raw = raw
            .quota_tz_offset_minutes
            .or(raw.cache_reset_tz_offset_minutes);

        Self {
            host: non_empty(raw.host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            user_agent: non_empty(raw.user_agent).unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            api_key: raw.api_key.unwrap_or_default().trim().to_string(),
            base_url: trim_url(raw.base_url, DEFAULT_BASE_URL),
            assets_url: trim_url(raw.assets_url, DEFAULT_ASSETS_URL),
            app_url: raw
                .app_url
                .unwrap_or_default()
                .trim()
                .trim_end_matches('/')
                .to_string(),
            cf_clearance: raw.cf_clearance.unwrap_or_default().trim().to_string(),
            retry_status_codes: parse_status_codes(raw.retry_status_codes.as_deref())
                .unwrap_or_else(|| vec![401, 429, 403]),
            retry_max_attempts: raw.retry_max_attempts.unwrap_or(3).max(1),
            upload_concurrency: raw.upload_concurrency.unwrap_or(5).max(1),
            image_concurrency: raw.image_concurrency.unwrap_or(1).clamp(1, 3),
            image_generation_method: resolve_image_generation_method(
                raw.image_generation_method.as_deref(),
            )
            .to_string(),
            image_format: non_empty(raw.image_format)
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "url".to_string()),
            tz_offset_minutes: parse_tz_offset(tz_raw.as_deref()),
            cooldown,
            token_selection: non_empty(raw.token_selection)
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "fewest_failures".to_string()),
            asset_ttl_secs: raw.asset_ttl_secs.unwrap_or(3600).max(1),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            log_format: raw.log_format.unwrap_or_default(),
            data_dir,
            tokens_file,
            api_keys_file,
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn prefers_experimental_images(&self) -> bool {
        self.image_generation_method == IMAGE_METHOD_EXPERIMENTAL
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("grok2api.db")
    }

    /// 测试与嵌入场景使用的基础配置（不读取环境变量）。
    pub fn for_data_dir(data_dir: impl Into<String>) -> Self {
        Self::from_raw(RawEnv {
            data_dir: Some(data_dir.into()),
            ..RawEnv::default()
        })
    }
}

/// 识别图片生成方式；未知值一律回落到 legacy。
pub fn resolve_image_generation_method(raw: Option<&str>) -> &'static str {
    let v = raw.unwrap_or("").trim().to_lowercase();
    match v.as_str() {
        "imagine_ws_experimental" | "imagine_ws" | "experimental" | "new" | "new_method" => {
            IMAGE_METHOD_EXPERIMENTAL
        }
        _ => IMAGE_METHOD_LEGACY,
    }
}

fn parse_tz_offset(value: Option<&str>) -> i32 {
    let n = value
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(DEFAULT_TZ_OFFSET_MINUTES);
    n.clamp(MIN_TZ_OFFSET_MINUTES, MAX_TZ_OFFSET_MINUTES)
}

fn non_empty(v: Option<String>) -> Option<String> {
    let v = v?;
    let t = v.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn trim_url(v: Option<String>, default: &str) -> String {
    non_empty(v)
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn parse_status_codes(value: Option<&str>) -> Option<Vec<u16>> {
    let value = value?;
    let mut out = Vec::new();
    for part in value.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        if let Ok(n) = p.parse::<u16>() {
            out.push(n);
        }
    }
    if out.is_empty() { None } else { Some(out) }
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
        // 已存在的进程环境变量优先，.env 只做补充。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段（尚未创建 tokio 工作线程）加载 .env，符合使用前提。
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

        // 发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
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

    #[test]
    fn image_method_aliases() {
        for raw in ["imagine_ws_experimental", "imagine_ws", "experimental", "new", "NEW_METHOD"] {
            assert_eq!(resolve_image_generation_method(Some(raw)), IMAGE_METHOD_EXPERIMENTAL);
        }
        for raw in [Some("legacy"), Some("unknown"), Some(""), None] {
            assert_eq!(resolve_image_generation_method(raw), IMAGE_METHOD_LEGACY);
        }
    }

    #[test]
    fn tz_offset_is_clamped() {
        assert_eq!(parse_tz_offset(None), 480);
        assert_eq!(parse_tz_offset(Some("abc")), 480);
        assert_eq!(parse_tz_offset(Some("-60")), -60);
        assert_eq!(parse_tz_offset(Some("9999")), 840);
        assert_eq!(parse_tz_offset(Some("-9999")), -720);
    }

    #[test]
    fn defaults_without_env() {
        let cfg = Config::for_data_dir("/tmp/x");
        assert_eq!(cfg.retry_status_codes, vec![401, 429, 403]);
        assert_eq!(cfg.retry_max_attempts, 3);
        assert_eq!(cfg.upload_concurrency, 5);
        assert_eq!(cfg.cooldown.auth, None);
        assert_eq!(cfg.base_url, "https://grok.com");
        assert!(cfg.tokens_file.ends_with("tokens.json"));
        assert!(!cfg.prefers_experimental_images());
    }

    #[test]
    fn dotenv_line_parsing() {
        assert_eq!(
            parse_dotenv_line("export API_KEY=\"sk-1 # x\""),
            Some(("API_KEY".to_string(), "sk-1 # x".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("PORT=8000 # comment"),
            Some(("PORT".to_string(), "8000".to_string()))
        );
        assert_eq!(parse_dotenv_line("# nope"), None);
        assert_eq!(parse_dotenv_line("=x"), None);
    }
}
