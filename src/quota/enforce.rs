use super::kind::QuotaKind;
use super::ledger::{BucketUpdate, Ledger, local_day};
use crate::api_keys::{ApiKeyStore, Caller};
use crate::db::now_ms;
use crate::error::AppError;
use crate::util::model::ModelInfo;

/// 在任何上游调用之前扣减一次每日额度；超额返回 429 并报告桶名。
///
/// 管理员与匿名调用方不计费；Key 已被删除或停用时放行（鉴权层已拦截）。
pub async fn enforce_daily_quota(
    ledger: &Ledger,
    keys: &ApiKeyStore,
    tz_offset_minutes: i32,
    caller: &Caller,
    model: &ModelInfo,
    image_count: Option<i64>,
) -> Result<(), AppError> {
    let Caller::Key(cached) = caller else {
        return Ok(());
    };

    // 以库中最新的上限为准，鉴权之后管理员可能已修改
    let Some(row) = keys.get(&cached.key).await? else {
        return Ok(());
    };
    if !row.is_active {
        return Ok(());
    }

    let kind = QuotaKind::classify(model, image_count);
    let updates: Vec<BucketUpdate> = kind
        .buckets()
        .into_iter()
        .map(|(bucket, inc)| BucketUpdate::new(bucket, inc, bucket.limit_of(&row)))
        .collect();

    let now = now_ms();
    let day = local_day(now, tz_offset_minutes);
    if ledger.try_consume_multi(&row.key, &day, &updates, now).await? {
        return Ok(());
    }

    tracing::info!(key_name = %row.name, bucket = %kind.label(), day = %day, "每日额度已用尽");
    Err(AppError::QuotaExceeded {
        bucket: kind.label(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_keys::ApiKey;
    use crate::db::temp_db;
    use crate::util::model;

    async fn setup(key: ApiKey) -> (tempfile::TempDir, Ledger, ApiKeyStore, Caller) {
        let (dir, db) = temp_db().await;
        let keys = ApiKeyStore::new(db.clone());
        keys.upsert(key.clone()).await.unwrap();
        (dir, Ledger::new(db), keys, Caller::Key(key))
    }

    #[tokio::test]
    async fn second_chat_request_exceeds_chat_limit() {
        let mut key = ApiKey::unlimited("sk-1", "one");
        key.chat_limit = 1;
        let (_dir, ledger, keys, caller) = setup(key).await;
        let m = model::get("grok-4").unwrap();

        enforce_daily_quota(&ledger, &keys, 480, &caller, m, None)
            .await
            .unwrap();
        let err = enforce_daily_quota(&ledger, &keys, 480, &caller, m, None)
            .await
            .unwrap_err();
        match err {
            AppError::QuotaExceeded { bucket } => assert_eq!(bucket, "chat"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn heavy_rejected_without_touching_chat() {
        let mut key = ApiKey::unlimited("sk-h", "heavy");
        key.chat_limit = 5;
        key.heavy_limit = 0;
        let (_dir, ledger, keys, caller) = setup(key).await;
        let m = model::get("grok-4-heavy").unwrap();

        let err = enforce_daily_quota(&ledger, &keys, 480, &caller, m, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded { ref bucket } if bucket == "heavy/chat"));

        let day = local_day(now_ms(), 480);
        let usage = ledger.usage("sk-h", &day).await.unwrap();
        assert_eq!(usage.chat_used, 0);
        assert_eq!(usage.heavy_used, 0);
    }

    #[tokio::test]
    async fn image_charges_requested_count() {
        let mut key = ApiKey::unlimited("sk-i", "img");
        key.image_limit = 4;
        let (_dir, ledger, keys, caller) = setup(key).await;
        let m = model::get("grok-imagine-1.0").unwrap();

        enforce_daily_quota(&ledger, &keys, 0, &caller, m, Some(3))
            .await
            .unwrap();
        // 剩余 1 张，再要 2 张（聊天接口默认）被拒绝
        assert!(
            enforce_daily_quota(&ledger, &keys, 0, &caller, m, None)
                .await
                .is_err()
        );
        enforce_daily_quota(&ledger, &keys, 0, &caller, m, Some(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn admin_and_unknown_keys_bypass() {
        let (_dir, db) = temp_db().await;
        let ledger = Ledger::new(db.clone());
        let keys = ApiKeyStore::new(db);
        let m = model::get("grok-4").unwrap();

        enforce_daily_quota(&ledger, &keys, 480, &Caller::Admin, m, None)
            .await
            .unwrap();
        enforce_daily_quota(&ledger, &keys, 480, &Caller::Anonymous, m, None)
            .await
            .unwrap();
        let ghost = Caller::Key(ApiKey::unlimited("sk-deleted", "ghost"));
        enforce_daily_quota(&ledger, &keys, 480, &ghost, m, None)
            .await
            .unwrap();
    }
}
