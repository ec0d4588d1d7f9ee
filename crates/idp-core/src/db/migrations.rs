//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run `statements` atomically, rolling back on the first failure
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: users, sessions and login attempts with mirror columns
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS users (
            local_id TEXT PRIMARY KEY,
            remote_id TEXT UNIQUE,
            sync_status TEXT NOT NULL DEFAULT 'PENDING',
            updated_at INTEGER NOT NULL,
            source TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password_hash TEXT,
            full_name TEXT,
            phone TEXT,
            role TEXT NOT NULL DEFAULT 'USER',
            is_active INTEGER NOT NULL DEFAULT 1,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            is_locked INTEGER NOT NULL DEFAULT 0,
            locked_at INTEGER,
            last_failed_login INTEGER,
            last_login INTEGER,
            external_uid TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_users_sync_status ON users(sync_status, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_users_locked ON users(is_locked)",
        "CREATE TABLE IF NOT EXISTS user_sessions (
            local_id TEXT PRIMARY KEY,
            remote_id TEXT UNIQUE,
            sync_status TEXT NOT NULL DEFAULT 'PENDING',
            updated_at INTEGER NOT NULL,
            source TEXT NOT NULL,
            user_id TEXT NOT NULL REFERENCES users(local_id) ON DELETE CASCADE,
            session_token TEXT NOT NULL UNIQUE,
            refresh_token TEXT NOT NULL UNIQUE,
            device_info TEXT,
            ip_address TEXT,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            is_valid INTEGER NOT NULL DEFAULT 1
        )",
        "CREATE INDEX IF NOT EXISTS idx_user_sessions_sync_status ON user_sessions(sync_status, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_user_sessions_user ON user_sessions(user_id)",
        "CREATE TABLE IF NOT EXISTS login_attempts (
            local_id TEXT PRIMARY KEY,
            remote_id TEXT UNIQUE,
            sync_status TEXT NOT NULL DEFAULT 'PENDING',
            updated_at INTEGER NOT NULL,
            source TEXT NOT NULL,
            user_id TEXT REFERENCES users(local_id) ON DELETE CASCADE,
            email TEXT NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            success INTEGER NOT NULL,
            failure_reason TEXT,
            attempted_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_login_attempts_sync_status ON login_attempts(sync_status, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_login_attempts_email ON login_attempts(email, attempted_at DESC)",
        // Security settings (local only, never mirrored)
        "CREATE TABLE IF NOT EXISTS security_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: lock expiry fixed at lock time
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "ALTER TABLE users ADD COLUMN locked_until INTEGER",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, CURRENT_VERSION, &statements).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                libsql::params![name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_mirrored_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in ["users", "user_sessions", "login_attempts", "security_settings"] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_v2_adds_locked_until() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.query("SELECT locked_until FROM users", ())
            .await
            .unwrap();
    }
}
