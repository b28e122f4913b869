//! Shared test helpers for integration tests.

#![allow(dead_code)]

use subband_dispatch::db::Database;
use tokio::sync::OnceCell;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// One-time schema initialization.
static SCHEMA_INIT: OnceCell<()> = OnceCell::const_new();

/// Ensure the test database schema is set up (runs migrations once per test binary).
pub async fn ensure_schema() {
    SCHEMA_INIT
        .get_or_init(|| async {
            let db = Database::connect(&test_db_url())
                .await
                .expect("Failed to connect to test database");
            db.migrate().await.expect("migrations failed");
        })
        .await;
}

/// Connect to the test database with an empty schema.
pub async fn setup_test_db() -> Database {
    setup_test_db_with_pool(5).await
}

pub async fn setup_test_db_with_pool(max_connections: u32) -> Database {
    ensure_schema().await;
    let db = Database::connect_with_pool_size(&test_db_url(), max_connections)
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

/// Truncate all tables to ensure test isolation.
pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql("TRUNCATE TABLE subbands, groups, tasks CASCADE")
        .execute(pool)
        .await
        .unwrap();
}

/// Push a claim's heartbeat (and claim time) into the past.
pub async fn age_claim(pool: &sqlx::PgPool, task_id: uuid::Uuid, seconds: i64) {
    sqlx::query(
        "UPDATE tasks
         SET last_heartbeat = NOW() - make_interval(secs => $2),
             claimed_at = NOW() - make_interval(secs => $2)
         WHERE task_id = $1",
    )
    .bind(task_id)
    .bind(seconds as f64)
    .execute(pool)
    .await
    .unwrap();
}

/// Push a terminal row's `completed_at` into the past.
pub async fn age_completion(pool: &sqlx::PgPool, table: &str, key: &str, id: &str, days: i32) {
    sqlx::query(&format!(
        "UPDATE {} SET completed_at = NOW() - make_interval(days => $2) WHERE {}::text = $1",
        table, key
    ))
    .bind(id)
    .bind(days)
    .execute(pool)
    .await
    .unwrap();
}
