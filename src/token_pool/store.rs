use super::cooldown::CooldownPolicy;
use super::selector::{FewestFailuresThenLru, SelectionPolicy};
use super::types::{PoolKind, TokenRecord, normalize_token};
use crate::db::{Db, now_ms};
use anyhow::Context;
use rusqlite::OptionalExtension;
use sonic_rs::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

const MAX_FAIL_REASON_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct TokenPool {
    db: Db,
    policy: Arc<dyn SelectionPolicy>,
    cooldown: CooldownPolicy,
}

impl TokenPool {
    pub fn new(db: Db, cooldown: CooldownPolicy) -> Self {
        Self {
            db,
            policy: Arc::new(FewestFailuresThenLru),
            cooldown,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// 按池的先后顺序挑选一个不在冷却中、且本请求尚未用过的凭证。
    ///
    /// 并发调用可能拿到同一个凭证：这里只做负载均衡，不做互斥。
    pub async fn select_best(
        &self,
        pools: &[PoolKind],
        exclude: &HashSet<String>,
    ) -> anyhow::Result<Option<TokenRecord>> {
        let now = now_ms();
        for &pool in pools {
            let candidates: Vec<TokenRecord> = self
                .eligible(pool, now)
                .await?
                .into_iter()
                .filter(|t| !exclude.contains(&t.token))
                .collect();

            let Some(idx) = self.policy.pick(&candidates) else {
                continue;
            };
            let Some(mut chosen) = candidates.into_iter().nth(idx) else {
                continue;
            };

            chosen.last_used_at = now;
            let token = chosen.token.clone();
            self.db
                .call(move |conn| {
                    conn.execute(
                        "UPDATE tokens SET last_used_at = ?1 WHERE token = ?2",
                        rusqlite::params![now, token],
                    )
                })
                .await?;
            return Ok(Some(chosen));
        }
        Ok(None)
    }

    async fn eligible(&self, pool: PoolKind, now: i64) -> anyhow::Result<Vec<TokenRecord>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT token, failed_count, last_fail_reason, last_fail_at, cooldown_until, last_used_at
                     FROM tokens WHERE pool = ?1 AND cooldown_until <= ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![pool.as_str(), now], |r| {
                    Ok(TokenRecord {
                        token: r.get(0)?,
                        pool,
                        failed_count: r.get(1)?,
                        last_fail_reason: r.get(2)?,
                        last_fail_at: r.get(3)?,
                        cooldown_until: r.get(4)?,
                        last_used_at: r.get(5)?,
                    })
                })?;
                rows.collect()
            })
            .await
    }

    /// 失败计数 +1 并记录截断后的原因；返回计入后的失败次数。
    pub async fn record_failure(&self, token: &str, status: u16, message: &str) -> anyhow::Result<i64> {
        let token = token.to_string();
        let reason = truncate_reason(status, message);
        let now = now_ms();
        let count: Option<i64> = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "UPDATE tokens SET failed_count = failed_count + 1, last_fail_reason = ?1, last_fail_at = ?2
                     WHERE token = ?3 RETURNING failed_count",
                    rusqlite::params![reason, now, token],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// 按状态码类别设置冷却；已有更长的冷却时不缩短。
    pub async fn apply_cooldown(&self, token: &str, status: u16) -> anyhow::Result<()> {
        let token = token.to_string();
        let policy = self.cooldown;
        let now = now_ms();
        self.db
            .call(move |conn| {
                let failed: Option<i64> = conn
                    .query_row(
                        "SELECT failed_count FROM tokens WHERE token = ?1",
                        [&token],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(failed) = failed else {
                    return Ok(());
                };
                let Some(until) = policy.cooldown_until(status, failed, now) else {
                    return Ok(());
                };
                conn.execute(
                    "UPDATE tokens SET cooldown_until = MAX(cooldown_until, ?1) WHERE token = ?2",
                    rusqlite::params![until, token],
                )?;
                Ok(())
            })
            .await
    }

    /// 成功一次即清空失败计数与冷却。
    pub async fn record_success(&self, token: &str) -> anyhow::Result<()> {
        let token = token.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE tokens SET failed_count = 0, cooldown_until = 0, last_fail_reason = ''
                     WHERE token = ?1 AND (failed_count != 0 OR cooldown_until != 0)",
                    [token],
                )?;
                Ok(())
            })
            .await
    }

    /// 新增凭证；已存在时保留原有失败/冷却状态。返回实际新增数量。
    pub async fn add(&self, pool: PoolKind, tokens: Vec<String>) -> anyhow::Result<usize> {
        let now = now_ms();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut added = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO tokens (token, pool, created_at) VALUES (?1, ?2, ?3)",
                    )?;
                    for raw in &tokens {
                        let token = normalize_token(raw);
                        if token.is_empty() {
                            continue;
                        }
                        added += stmt.execute(rusqlite::params![token, pool.as_str(), now])?;
                    }
                }
                tx.commit()?;
                Ok(added)
            })
            .await
    }

    pub async fn get(&self, token: &str) -> anyhow::Result<Option<TokenRecord>> {
        let token = token.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT token, pool, failed_count, last_fail_reason, last_fail_at, cooldown_until, last_used_at
                     FROM tokens WHERE token = ?1",
                    [token],
                    |r| {
                        let pool: String = r.get(1)?;
                        Ok(TokenRecord {
                            token: r.get(0)?,
                            pool: PoolKind::parse(&pool).unwrap_or(PoolKind::Basic),
                            failed_count: r.get(2)?,
                            last_fail_reason: r.get(3)?,
                            last_fail_at: r.get(4)?,
                            cooldown_until: r.get(5)?,
                            last_used_at: r.get(6)?,
                        })
                    },
                )
                .optional()
            })
            .await
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        self.db
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM tokens", [], |r| r.get(0)))
            .await
    }

    /// 从 TOKENS_FILE 导入凭证。
    ///
    /// 支持 `{"basic":[..],"super":[..]}`（也接受 ssoNormal/ssoSuper 键）或扁平数组；
    /// 元素可以是字符串或带 `token` 字段的对象。
    pub async fn import_file(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("读取 {} 失败", path.display())),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(0);
        }
        let root: sonic_rs::Value = sonic_rs::from_slice(&bytes)
            .with_context(|| format!("解析 {} 失败", path.display()))?;

        let mut total = 0;
        if let Some(obj) = root.as_object() {
            for (name, list) in obj.iter() {
                let Some(pool) = PoolKind::parse(name) else {
                    tracing::warn!("未知的凭证池 {name}，已忽略");
                    continue;
                };
                total += self.add(pool, token_strings(list)).await?;
            }
        } else {
            total += self.add(PoolKind::Basic, token_strings(&root)).await?;
        }
        Ok(total)
    }
}

fn token_strings(v: &sonic_rs::Value) -> Vec<String> {
    let Some(arr) = v.as_array() else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|item| {
            item.as_str()
                .or_else(|| item.get("token").and_then(|t| t.as_str()))
                .map(str::to_string)
        })
        .collect()
}

fn truncate_reason(status: u16, message: &str) -> String {
    let msg: String = message.chars().take(MAX_FAIL_REASON_CHARS).collect();
    format!("{status}: {msg}")
}
