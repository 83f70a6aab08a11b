use super::kind::Bucket;
use crate::db::Db;
use rusqlite::TransactionBehavior;
use rusqlite::types::Value;

/// 单个桶的一次条件自增。`limit < 0` 表示不限量。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketUpdate {
    pub bucket: Bucket,
    pub increment: i64,
    pub limit: i64,
}

impl BucketUpdate {
    pub fn new(bucket: Bucket, increment: i64, limit: i64) -> Self {
        Self {
            bucket,
            increment,
            limit,
        }
    }

    fn unlimited(&self) -> bool {
        self.limit < 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyUsage {
    pub chat_used: i64,
    pub heavy_used: i64,
    pub image_used: i64,
    pub video_used: i64,
    pub updated_at: i64,
}

impl DailyUsage {
    pub fn get(&self, bucket: Bucket) -> i64 {
        match bucket {
            Bucket::Chat => self.chat_used,
            Bucket::Heavy => self.heavy_used,
            Bucket::Image => self.image_used,
            Bucket::Video => self.video_used,
        }
    }
}

/// 按时区偏移切分的自然日，格式 `YYYY-MM-DD`。
pub fn local_day(now_ms: i64, tz_offset_minutes: i32) -> String {
    let shifted = now_ms.saturating_add(i64::from(tz_offset_minutes) * 60_000);
    chrono::DateTime::from_timestamp_millis(shifted)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

#[derive(Debug, Clone)]
pub struct Ledger {
    db: Db,
}

impl Ledger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn try_consume(
        &self,
        key: &str,
        day: &str,
        bucket: Bucket,
        increment: i64,
        limit: i64,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        self.try_consume_multi(key, day, &[BucketUpdate::new(bucket, increment, limit)], now_ms)
            .await
    }

    /// 多个桶作为一个整体自增：全部不超限才生效，否则一个都不动。
    ///
    /// 行创建（幂等）与条件自增在同一个写事务内完成；条件自增是一条
    /// UPDATE，WHERE 子句合取所有受限桶的上限判断，是否放行由影响行数决定。
    pub async fn try_consume_multi(
        &self,
        key: &str,
        day: &str,
        updates: &[BucketUpdate],
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let updates = merge_updates(updates);
        if updates.is_empty() {
            return Ok(true);
        }

        let (sql, params) = build_conditional_update(key, day, &updates, now_ms);
        let key = key.to_string();
        let day = day.to_string();

        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO daily_usage (key, day, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, day) DO NOTHING",
                    rusqlite::params![key, day, now_ms],
                )?;
                let changed = tx.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
                tx.commit()?;
                Ok(changed == 1)
            })
            .await
    }

    pub async fn usage(&self, key: &str, day: &str) -> anyhow::Result<DailyUsage> {
        let key = key.to_string();
        let day = day.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chat_used, heavy_used, image_used, video_used, updated_at
                     FROM daily_usage WHERE key = ?1 AND day = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![key, day])?;
                let Some(row) = rows.next()? else {
                    return Ok(DailyUsage::default());
                };
                Ok(DailyUsage {
                    chat_used: row.get(0)?,
                    heavy_used: row.get(1)?,
                    image_used: row.get(2)?,
                    video_used: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })
            .await
    }
}

/// 去掉非正增量，并合并同一个桶的多次出现（增量相加，上限取最严格的一个）。
fn merge_updates(updates: &[BucketUpdate]) -> Vec<BucketUpdate> {
    let mut out: Vec<BucketUpdate> = Vec::with_capacity(updates.len());
    for u in updates.iter().filter(|u| u.increment > 0) {
        match out.iter_mut().find(|m| m.bucket == u.bucket) {
            Some(m) => {
                m.increment += u.increment;
                m.limit = match (m.unlimited(), u.unlimited()) {
                    (true, true) => Bucket::UNLIMITED,
                    (true, false) => u.limit,
                    (false, true) => m.limit,
                    (false, false) => m.limit.min(u.limit),
                };
            }
            None => out.push(*u),
        }
    }
    out
}

fn build_conditional_update(
    key: &str,
    day: &str,
    updates: &[BucketUpdate],
    now_ms: i64,
) -> (String, Vec<Value>) {
    let mut sets: Vec<String> = Vec::with_capacity(updates.len() + 1);
    let mut conds: Vec<String> = vec!["key = ?".to_string(), "day = ?".to_string()];
    let mut set_params: Vec<Value> = Vec::new();
    let mut cond_params: Vec<Value> = vec![Value::Text(key.to_string()), Value::Text(day.to_string())];

    for u in updates {
        let col = u.bucket.used_column();
        sets.push(format!("{col} = {col} + ?"));
        set_params.push(Value::Integer(u.increment));
        if !u.unlimited() {
            conds.push(format!("{col} + ? <= ?"));
            cond_params.push(Value::Integer(u.increment));
            cond_params.push(Value::Integer(u.limit));
        }
    }
    sets.push("updated_at = ?".to_string());
    set_params.push(Value::Integer(now_ms));

    let sql = format!(
        "UPDATE daily_usage SET {} WHERE {}",
        sets.join(", "),
        conds.join(" AND ")
    );
    set_params.extend(cond_params);
    (sql, set_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_db;
    use chrono::TimeZone;

    const DAY: &str = "2025-01-01";

    #[test]
    fn local_day_flips_at_local_midnight() {
        // UTC+8：UTC 15:59:59.999 仍是当天，16:00 进入次日。
        let before = chrono::Utc
            .with_ymd_and_hms(2024, 1, 1, 15, 59, 59)
            .unwrap()
            .timestamp_millis()
            + 999;
        let after = before + 1;
        assert_eq!(local_day(before, 480), "2024-01-01");
        assert_eq!(local_day(after, 480), "2024-01-02");

        // 同一本地日内，相隔 23 小时也不变。
        let morning = chrono::Utc
            .with_ymd_and_hms(2024, 3, 9, 16, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(
            local_day(morning, 480),
            local_day(morning + 23 * 3_600_000, 480)
        );

        // 负偏移
        let t = chrono::Utc
            .with_ymd_and_hms(2024, 1, 2, 3, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(local_day(t, -300), "2024-01-01");
    }

    #[tokio::test]
    async fn sequential_admits_until_limit() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db);

        assert!(ledger.try_consume("k", DAY, Bucket::Chat, 2, 5, 1).await.unwrap());
        assert!(ledger.try_consume("k", DAY, Bucket::Chat, 2, 5, 2).await.unwrap());
        // 2+2+2 > 5：拒绝且计数不变
        assert!(!ledger.try_consume("k", DAY, Bucket::Chat, 2, 5, 3).await.unwrap());
        assert_eq!(ledger.usage("k", DAY).await.unwrap().chat_used, 4);
        assert!(ledger.try_consume("k", DAY, Bucket::Chat, 1, 5, 4).await.unwrap());
        assert!(!ledger.try_consume("k", DAY, Bucket::Chat, 1, 5, 5).await.unwrap());
        assert_eq!(ledger.usage("k", DAY).await.unwrap().chat_used, 5);

        // 新的一天重新计数
        assert!(ledger.try_consume("k", "2025-01-02", Bucket::Chat, 1, 5, 6).await.unwrap());
    }

    #[tokio::test]
    async fn unlimited_always_admits() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db);
        for i in 0..20 {
            assert!(
                ledger
                    .try_consume("k", DAY, Bucket::Image, 7, Bucket::UNLIMITED, i)
                    .await
                    .unwrap()
            );
        }
        assert_eq!(ledger.usage("k", DAY).await.unwrap().image_used, 140);
    }

    #[tokio::test]
    async fn zero_limit_rejects() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db);
        assert!(!ledger.try_consume("k", DAY, Bucket::Video, 1, 0, 1).await.unwrap());
        assert_eq!(ledger.usage("k", DAY).await.unwrap(), DailyUsage {
            updated_at: 1,
            ..DailyUsage::default()
        });
    }

    #[tokio::test]
    async fn zero_increment_is_noop() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db.clone());
        assert!(ledger.try_consume("k", DAY, Bucket::Chat, 0, 0, 1).await.unwrap());
        let rows: i64 = db
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM daily_usage", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn multi_bucket_is_all_or_nothing() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db);
        let heavy_chat = |limit_h, limit_c| {
            [
                BucketUpdate::new(Bucket::Heavy, 1, limit_h),
                BucketUpdate::new(Bucket::Chat, 1, limit_c),
            ]
        };

        // heavy 上限为 0：整体拒绝，chat 不变
        assert!(!ledger.try_consume_multi("k", DAY, &heavy_chat(0, 5), 1).await.unwrap());
        let u = ledger.usage("k", DAY).await.unwrap();
        assert_eq!((u.heavy_used, u.chat_used), (0, 0));

        // 两边都有余量：各加 1
        assert!(ledger.try_consume_multi("k", DAY, &heavy_chat(3, 1), 2).await.unwrap());
        let u = ledger.usage("k", DAY).await.unwrap();
        assert_eq!((u.heavy_used, u.chat_used), (1, 1));

        // chat 已满：heavy 也不能动
        assert!(!ledger.try_consume_multi("k", DAY, &heavy_chat(3, 1), 3).await.unwrap());
        let u = ledger.usage("k", DAY).await.unwrap();
        assert_eq!((u.heavy_used, u.chat_used), (1, 1));
    }

    #[tokio::test]
    async fn duplicate_buckets_are_merged() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db);
        let updates = [
            BucketUpdate::new(Bucket::Chat, 1, 10),
            BucketUpdate::new(Bucket::Chat, 1, 1),
        ];
        // 合并后增量 2，上限取 1：拒绝
        assert!(!ledger.try_consume_multi("k", DAY, &updates, 1).await.unwrap());
        assert_eq!(ledger.usage("k", DAY).await.unwrap().chat_used, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_never_overshoot() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db);
        const N: usize = 24;
        const LIMIT: i64 = 7;

        let mut handles = Vec::with_capacity(N);
        for i in 0..N {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .try_consume("k", DAY, Bucket::Chat, 1, LIMIT, i as i64)
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, LIMIT);
        assert_eq!(ledger.usage("k", DAY).await.unwrap().chat_used, LIMIT);
    }

    #[test]
    fn unlimited_buckets_have_no_predicate() {
        let (sql, params) = build_conditional_update(
            "k",
            DAY,
            &[
                BucketUpdate::new(Bucket::Heavy, 1, Bucket::UNLIMITED),
                BucketUpdate::new(Bucket::Chat, 1, 3),
            ],
            9,
        );
        assert!(!sql.contains("heavy_used + ? <="));
        assert!(sql.contains("chat_used + ? <= ?"));
        // heavy, chat, updated_at, key, day, chat inc, chat limit
        assert_eq!(params.len(), 7);
    }
}
