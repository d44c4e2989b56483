//! SQLite 数据库工具：创建连接池并执行 sqlx 迁移
//!
//! 迁移文件位于 crate 根目录的 `migrations/`，由 `sqlx::migrate!()` 管理。

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

/// 创建 SQLite 连接池并执行所有未执行的迁移
///
/// `db_url` 形如 `sqlite://portal.db?mode=rwc`。
pub async fn create_sqlite_pool_with_migration(db_url: &str) -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context(format!("连接SQLite数据库失败: {}", db_url))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("执行数据库迁移失败")?;

    info!("[LocalDB] 📋 数据库已就绪: {}", db_url);
    Ok(pool)
}
