use anyhow::Result;
use chrono::Utc;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
///
/// This is the single source of truth for the database schema.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    // Create schema_migrations table first (tracks applied migrations)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Initial schema").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Add alert state columns to targets").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

/// Get current schema version from database
async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

/// Record that a migration was applied
async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, Utc::now().timestamp(), description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: targets, check_results and subsequent_requests
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS targets (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            name TEXT NOT NULL,
            mode TEXT NOT NULL,
            interval_seconds INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            alerts_enabled INTEGER NOT NULL DEFAULT 0,
            notify_on_recovery INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS check_results (
            id TEXT PRIMARY KEY,
            target_id TEXT NOT NULL,
            target TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            status TEXT NOT NULL,
            status_code INTEGER,
            response_time_ms INTEGER NOT NULL,
            error_message TEXT
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subsequent_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            check_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            url TEXT NOT NULL,
            ip TEXT,
            resource_type TEXT NOT NULL,
            state_type TEXT NOT NULL,
            protocol TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_targets_url ON targets(url)", ()).await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_check_results_target_time ON check_results(target_id, timestamp DESC)",
        (),
    )
    .await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subsequent_requests_target_time ON subsequent_requests(target_id, timestamp DESC)",
        (),
    )
    .await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subsequent_requests_check ON subsequent_requests(check_id)",
        (),
    )
    .await?;

    tracing::info!("Created targets, check_results and subsequent_requests tables");
    Ok(())
}

/// Migration v2: alert state snapshot per target
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE targets ADD COLUMN consecutive_failures INTEGER NOT NULL DEFAULT 0", ())
        .await?;
    conn.execute("ALTER TABLE targets ADD COLUMN last_alert_at INTEGER", ()).await?;
    conn.execute("ALTER TABLE targets ADD COLUMN currently_down INTEGER NOT NULL DEFAULT 0", ())
        .await?;

    tracing::info!("Added alert state columns to targets table");
    Ok(())
}
