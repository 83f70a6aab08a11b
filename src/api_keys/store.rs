use super::types::{ApiKey, ApiKeyRecord, normalize_limit};
use crate::db::{Db, now_ms};
use anyhow::Context;
use rusqlite::OptionalExtension;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ApiKeyStore {
    db: Db,
}

impl ApiKeyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<ApiKey>> {
        let key = key.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT key, name, is_active, chat_limit, heavy_limit, image_limit, video_limit, created_at
                     FROM api_keys WHERE key = ?1",
                    [key],
                    |r| {
                        Ok(ApiKey {
                            key: r.get(0)?,
                            name: r.get(1)?,
                            is_active: r.get(2)?,
                            chat_limit: r.get(3)?,
                            heavy_limit: r.get(4)?,
                            image_limit: r.get(5)?,
                            video_limit: r.get(6)?,
                            created_at: r.get(7)?,
                        })
                    },
                )
                .optional()
            })
            .await
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        self.db
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM api_keys", [], |r| r.get(0)))
            .await
    }

    /// 新增或覆盖一个 Key（按 key 主键）。
    pub async fn upsert(&self, key: ApiKey) -> anyhow::Result<()> {
        let created_at = if key.created_at > 0 {
            key.created_at
        } else {
            now_ms() / 1000
        };
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO api_keys (key, name, is_active, chat_limit, heavy_limit, image_limit, video_limit, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(key) DO UPDATE SET
                        name = excluded.name,
                        is_active = excluded.is_active,
                        chat_limit = excluded.chat_limit,
                        heavy_limit = excluded.heavy_limit,
                        image_limit = excluded.image_limit,
                        video_limit = excluded.video_limit",
                    rusqlite::params![
                        key.key,
                        key.name,
                        key.is_active,
                        normalize_limit(key.chat_limit),
                        normalize_limit(key.heavy_limit),
                        normalize_limit(key.image_limit),
                        normalize_limit(key.video_limit),
                        created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// 启动时从 JSON 文件导入 Key 列表；文件不存在时跳过。
    pub async fn import_file(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("读取 {} 失败", path.display()));
            }
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(0);
        }

        let records: Vec<ApiKeyRecord> = sonic_rs::from_slice(&bytes)
            .with_context(|| format!("解析 {} 失败", path.display()))?;

        let mut imported = 0;
        for record in records {
            let key = ApiKey::from(record);
            if key.key.is_empty() {
                continue;
            }
            self.upsert(key).await?;
            imported += 1;
        }
        Ok(imported)
    }
}
