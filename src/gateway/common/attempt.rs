//! 一次入站请求内的多凭证尝试：选凭证 → 执行 → 失败记账/冷却 → 按状态码决定是否换凭证重试。
//!
//! 尝试严格串行，上一次的冷却会影响下一次的选取。

use crate::config::Config;
use crate::error::AppError;
use crate::logging::{AuditGuard, token_suffix};
use crate::token_pool::{TokenPool, TokenRecord};
use crate::upstream::UpstreamError;
use crate::util::model::ModelInfo;
use std::collections::HashSet;
use std::future::Future;

/// 成功的一次尝试：返回值与所用凭证。
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub token: String,
}

/// 终止后的上游错误映射：审核拦截单独成类，其它统一为 upstream_error。
pub fn upstream_app_error(err: &UpstreamError) -> AppError {
    if err.is_moderation() {
        return AppError::Moderation(format!("Content moderated: {}", err.message()));
    }
    let status = err.status();
    AppError::upstream(format!("Upstream request failed ({status}): {}", err.message()))
}

pub async fn run_attempts<T, F, Fut>(
    cfg: &Config,
    tokens: &TokenPool,
    model: &ModelInfo,
    audit: &mut AuditGuard,
    mut op: F,
) -> Result<Attempted<T>, AppError>
where
    F: FnMut(TokenRecord) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let max_attempts = cfg.retry_max_attempts.max(1);
    let mut tried: HashSet<String> = HashSet::new();
    let mut last_err: Option<UpstreamError> = None;

    for attempt in 1..=max_attempts {
        let Some(token) = tokens.select_best(model.pools(), &tried).await? else {
            // 第一次就拿不到凭证：池子对该模型整体不可用
            return Err(match last_err {
                Some(e) => upstream_app_error(&e),
                None => AppError::NoCredential,
            });
        };
        tried.insert(token.token.clone());
        audit.set_token(&token.token);

        let err = match op(token.clone()).await {
            Ok(value) => {
                if let Err(e) = tokens.record_success(&token.token).await {
                    tracing::warn!("记录凭证成功状态失败: {e:#}");
                }
                return Ok(Attempted {
                    value,
                    token: token.token,
                });
            }
            Err(e) => e,
        };

        let status = err.status();
        tracing::warn!(
            attempt,
            status,
            token = %token_suffix(&token.token),
            "上游请求失败: {}",
            err.message()
        );
        record_upstream_failure(tokens, &token.token, &err).await;

        if err.is_moderation() {
            return Err(upstream_app_error(&err));
        }
        if !cfg.retry_status_codes.contains(&status) {
            return Err(upstream_app_error(&err));
        }
        last_err = Some(err);
    }

    Err(match last_err {
        Some(e) => upstream_app_error(&e),
        None => AppError::NoCredential,
    })
}

/// 失败计数与冷却；写库失败只告警，不影响请求结果。
pub async fn record_upstream_failure(tokens: &TokenPool, token: &str, err: &UpstreamError) {
    let status = err.status();
    if let Err(e) = tokens.record_failure(token, status, &err.message()).await {
        tracing::warn!("记录凭证失败次数出错: {e:#}");
    }
    if let Err(e) = tokens.apply_cooldown(token, status).await {
        tracing::warn!("写入凭证冷却出错: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now_ms, temp_db};
    use crate::token_pool::{CooldownPolicy, PoolKind};
    use crate::util::model;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn pool_with(tokens: &[&str]) -> (tempfile::TempDir, TokenPool) {
        let (dir, db) = temp_db().await;
        let pool = TokenPool::new(db, CooldownPolicy::default());
        pool.add(
            PoolKind::Basic,
            tokens.iter().map(|t| t.to_string()).collect(),
        )
        .await
        .unwrap();
        (dir, pool)
    }

    fn cfg() -> Config {
        Config::for_data_dir(std::env::temp_dir().to_string_lossy())
    }

    #[tokio::test]
    async fn retries_on_retryable_status_with_another_token() {
        let (_dir, pool) = pool_with(&["token-aaaaaaaa", "token-bbbbbbbb"]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let m = model::get("grok-3").unwrap();
        let mut audit = AuditGuard::new("127.0.0.1", "grok-3", "test");

        let res = run_attempts(&cfg(), &pool, m, &mut audit, |tok| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(UpstreamError::http(429, b"slow down"))
                } else {
                    Ok(tok.token)
                }
            }
        })
        .await
        .unwrap();
        audit.success(200);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(res.value, res.token);

        let mut failed = 0;
        for t in ["token-aaaaaaaa", "token-bbbbbbbb"] {
            let rec = pool.get(t).await.unwrap().unwrap();
            failed += rec.failed_count;
            if rec.failed_count == 1 {
                assert!(rec.in_cooldown(now_ms()));
                assert_ne!(t, res.token);
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn non_retryable_status_stops_immediately() {
        let (_dir, pool) = pool_with(&["t1-xxxxxxxxx", "t2-xxxxxxxxx"]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let m = model::get("grok-3").unwrap();
        let mut audit = AuditGuard::new("ip", "grok-3", "test");

        let err = run_attempts(&cfg(), &pool, m, &mut audit, |_tok| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::http(500, b"boom"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), "upstream_error");
        assert_eq!(err.status().as_u16(), 500);
    }

    #[tokio::test]
    async fn moderation_is_its_own_category() {
        let (_dir, pool) = pool_with(&["t1-xxxxxxxxx"]).await;
        let m = model::get("grok-3").unwrap();
        let mut audit = AuditGuard::new("ip", "grok-3", "test");

        let err = run_attempts(&cfg(), &pool, m, &mut audit, |_tok| async {
            Err::<(), _>(UpstreamError::http(403, b"request blocked by moderation"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "content_moderated");
        assert_eq!(err.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn empty_pool_is_no_credential() {
        let (_dir, pool) = pool_with(&[]).await;
        let m = model::get("grok-3").unwrap();
        let mut audit = AuditGuard::new("ip", "grok-3", "test");

        let err = run_attempts(&cfg(), &pool, m, &mut audit, |_tok| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn heavy_model_only_uses_super_pool() {
        let (_dir, pool) = pool_with(&["basic-xxxxxxxx"]).await;
        let m = model::get("grok-4-heavy").unwrap();
        let mut audit = AuditGuard::new("ip", "grok-4-heavy", "test");

        let err = run_attempts(&cfg(), &pool, m, &mut audit, |_tok| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoCredential));
    }
}
