//! Tests against a live MySQL server over TLS
//!
//! Ignored by default. Run with `MYSQL_HOST`, `MYSQL_PORT`, `MYSQL_USER`,
//! `MYSQL_PASSWORD`, `MYSQL_DB_NAME` and `MYSQL_SSL_CA` set:
//!
//! ```text
//! cargo test --test integration_mysql -- --ignored --test-threads=1
//! ```

use onfocus_api::db::{ConnectionPool, TransactionRunner};
use onfocus_api::{AppConfig, DbError};
use serde_json::json;
use tempfile::TempDir;

const TABLE: &str = "onfocus_tx_probe";

fn mysql_pool() -> ConnectionPool {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::load_from_dir(dir.path()).expect("MYSQL_* variables must be set");
    ConnectionPool::connect(&config.database, config.pool).unwrap()
}

async fn reset_table(pool: &ConnectionPool) {
    pool.query(
        &format!("CREATE TABLE IF NOT EXISTS {TABLE} (id INT PRIMARY KEY, label VARCHAR(64) NOT NULL)"),
        &[],
    )
    .await
    .unwrap();
    pool.query(&format!("DELETE FROM {TABLE}"), &[]).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_select_one_over_tls() {
    let pool = mysql_pool();

    let rows = pool.query("SELECT 1 AS one", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("one"), Some(&json!(1)));

    pool.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_rollback_and_commit_on_mysql() {
    let pool = mysql_pool();
    reset_table(&pool).await;
    let runner = TransactionRunner::new(pool.clone());

    let failed = runner
        .with_transaction(|conn| {
            Box::pin(async move {
                conn.query(
                    &format!("INSERT INTO {TABLE} (id, label) VALUES (?, ?)"),
                    &[json!(1), json!("rolled back")],
                )
                .await?;
                // Duplicate key
                conn.query(
                    &format!("INSERT INTO {TABLE} (id, label) VALUES (?, ?)"),
                    &[json!(1), json!("duplicate")],
                )
                .await?;
                Ok::<_, DbError>(())
            })
        })
        .await;
    assert!(matches!(failed, Err(DbError::Query { .. })));

    let count = pool
        .query(&format!("SELECT COUNT(*) AS n FROM {TABLE}"), &[])
        .await
        .unwrap();
    assert_eq!(count[0].get("n"), Some(&json!(0)));

    runner
        .with_transaction(|conn| {
            Box::pin(async move {
                conn.query(
                    &format!("INSERT INTO {TABLE} (id, label) VALUES (?, ?)"),
                    &[json!(2), json!("kept")],
                )
                .await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap();

    let rows = pool
        .query(&format!("SELECT label FROM {TABLE} WHERE id = ?"), &[json!(2)])
        .await
        .unwrap();
    assert_eq!(rows[0].get("label"), Some(&json!("kept")));

    pool.close().await.unwrap();
}
