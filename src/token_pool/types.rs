use serde::Serialize;

/// 凭证所属池；super 池的账号可以使用 heavy 等高级模型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Basic,
    Super,
}

impl PoolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Basic => "basic",
            PoolKind::Super => "super",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "basic" | "ssonormal" | "normal" => Some(PoolKind::Basic),
            "super" | "ssosuper" => Some(PoolKind::Super),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub pool: PoolKind,
    pub failed_count: i64,
    pub last_fail_reason: String,
    pub last_fail_at: i64,
    /// 毫秒时间戳；`i64::MAX` 表示无限期冷却
    pub cooldown_until: i64,
    pub last_used_at: i64,
}

impl TokenRecord {
    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until > now_ms
    }
}

/// 去掉 `sso=` 前缀与 cookie 残留，只保留令牌本体。
pub fn normalize_token(raw: &str) -> String {
    let t = raw.trim();
    let t = t.strip_prefix("sso=").unwrap_or(t);
    let t = t.split(';').next().unwrap_or(t);
    t.trim().to_string()
}
