use serde::Deserialize;

/// 调用方 API Key；四个每日上限中 -1 表示不限量。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub key: String,
    pub name: String,
    pub is_active: bool,
    pub chat_limit: i64,
    pub heavy_limit: i64,
    pub image_limit: i64,
    pub video_limit: i64,
    pub created_at: i64,
}

impl ApiKey {
    pub fn unlimited(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            is_active: true,
            chat_limit: -1,
            heavy_limit: -1,
            image_limit: -1,
            video_limit: -1,
            created_at: 0,
        }
    }
}

/// 小于 -1 的上限一律视为不限量。
pub fn normalize_limit(v: i64) -> i64 {
    v.max(-1)
}

/// 已通过鉴权的调用方。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// 全局管理员 Key，不受额度限制
    Admin,
    /// 未配置任何 Key 时的匿名访问
    Anonymous,
    Key(ApiKey),
}

impl Caller {
    pub fn key_name(&self) -> &str {
        match self {
            Caller::Admin => "default-admin",
            Caller::Anonymous => "anonymous",
            Caller::Key(k) if k.name.is_empty() => "unnamed",
            Caller::Key(k) => &k.name,
        }
    }
}

/// API_KEYS_FILE 中的一行；字段缺省时按不限量处理。
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_limit", alias = "chat_per_day")]
    pub chat_limit: i64,
    #[serde(default = "default_limit", alias = "heavy_per_day")]
    pub heavy_limit: i64,
    #[serde(default = "default_limit", alias = "image_per_day")]
    pub image_limit: i64,
    #[serde(default = "default_limit", alias = "video_per_day")]
    pub video_limit: i64,
    #[serde(default)]
    pub created_at: i64,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> i64 {
    -1
}

impl From<ApiKeyRecord> for ApiKey {
    fn from(r: ApiKeyRecord) -> Self {
        Self {
            key: r.key.trim().to_string(),
            name: r.name.trim().to_string(),
            is_active: r.is_active,
            chat_limit: normalize_limit(r.chat_limit),
            heavy_limit: normalize_limit(r.heavy_limit),
            image_limit: normalize_limit(r.image_limit),
            video_limit: normalize_limit(r.video_limit),
            created_at: r.created_at,
        }
    }
}
