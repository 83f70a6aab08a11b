use crate::config::CooldownConfig;
use std::time::Duration;

/// 按状态码划分的失败类别，决定冷却时长的量级。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 401：凭证大概率已被上游吊销
    Auth,
    /// 429：限流
    RateLimited,
    /// 5xx / 403 / 网络错误（status = 0）
    Server,
    /// 其它 4xx：请求本身的问题，不怪凭证
    Client,
}

impl FailureClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => FailureClass::Auth,
            429 => FailureClass::RateLimited,
            0 | 403 | 500..=599 => FailureClass::Server,
            _ => FailureClass::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    cfg: CooldownConfig,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::new(CooldownConfig::default())
    }
}

impl CooldownPolicy {
    pub fn new(cfg: CooldownConfig) -> Self {
        Self { cfg }
    }

    /// 计算冷却截止时间（毫秒）；None 表示该类失败不冷却。
    ///
    /// `failed_count` 为本次失败计入之后的连续失败次数。
    pub fn cooldown_until(&self, status: u16, failed_count: i64, now_ms: i64) -> Option<i64> {
        match FailureClass::from_status(status) {
            FailureClass::Auth => match self.cfg.auth {
                None => Some(i64::MAX),
                Some(d) => Some(add_ms(now_ms, d)),
            },
            FailureClass::RateLimited => Some(add_ms(now_ms, self.rate_limit_backoff(failed_count))),
            FailureClass::Server => Some(add_ms(now_ms, self.cfg.server_error)),
            FailureClass::Client => None,
        }
    }

    /// base * 2^(n-1)，封顶 max。
    fn rate_limit_backoff(&self, failed_count: i64) -> Duration {
        let exp = failed_count.clamp(1, 32) - 1;
        let factor = 1u32.checked_shl(exp as u32).unwrap_or(u32::MAX);
        self.cfg
            .rate_limit_base
            .checked_mul(factor)
            .unwrap_or(self.cfg.rate_limit_max)
            .min(self.cfg.rate_limit_max)
    }
}

fn add_ms(now_ms: i64, d: Duration) -> i64 {
    let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(ms)
}
