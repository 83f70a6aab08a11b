//! SQLite 持久层：配额账本、凭证池与 API Key 共用同一个库文件。
//!
//! 每次操作打开一个短连接并在 `spawn_blocking` 中执行；并发安全依赖 SQLite
//! 自身的写锁与单条条件语句的原子性，而不是进程内锁。

use anyhow::Context;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS api_keys (
    key          TEXT PRIMARY KEY,
    name         TEXT NOT NULL DEFAULT '',
    is_active    INTEGER NOT NULL DEFAULT 1,
    chat_limit   INTEGER NOT NULL DEFAULT -1,
    heavy_limit  INTEGER NOT NULL DEFAULT -1,
    image_limit  INTEGER NOT NULL DEFAULT -1,
    video_limit  INTEGER NOT NULL DEFAULT -1,
    created_at   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS daily_usage (
    key          TEXT NOT NULL,
    day          TEXT NOT NULL,
    chat_used    INTEGER NOT NULL DEFAULT 0,
    heavy_used   INTEGER NOT NULL DEFAULT 0,
    image_used   INTEGER NOT NULL DEFAULT 0,
    video_used   INTEGER NOT NULL DEFAULT 0,
    updated_at   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (key, day)
);

CREATE TABLE IF NOT EXISTS tokens (
    token            TEXT PRIMARY KEY,
    pool             TEXT NOT NULL DEFAULT 'basic',
    failed_count     INTEGER NOT NULL DEFAULT 0,
    last_fail_reason TEXT NOT NULL DEFAULT '',
    last_fail_at     INTEGER NOT NULL DEFAULT 0,
    cooldown_until   INTEGER NOT NULL DEFAULT 0,
    last_used_at     INTEGER NOT NULL DEFAULT 0,
    created_at       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tokens_pool ON tokens (pool, cooldown_until);
";

#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// 打开（必要时创建）数据库文件并初始化表结构。
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建数据目录失败: {}", parent.display()))?;
        }

        let db = Self { path };
        db.call(|conn| {
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .context("初始化数据库表结构失败")?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// 在阻塞线程池中执行一次数据库操作。
    pub async fn call<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.connect()?;
            f(&mut conn)
        })
        .await
        .context("数据库任务异常退出")?
        .with_context(|| format!("数据库操作失败: {}", self.path.display()))
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) async fn temp_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("test.db")).await.unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_schema() {
        let (_dir, db) = temp_db().await;
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect()
            })
            .await
            .unwrap();
        assert_eq!(tables, vec!["api_keys", "daily_usage", "tokens"]);
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let (dir, _db) = temp_db().await;
        Db::open(dir.path().join("test.db")).await.unwrap();
    }
}
