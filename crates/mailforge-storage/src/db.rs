//! Database connection, migrations, and seeding

use chrono::Utc;
use mailforge_common::{Error, Result};
use rand::Rng;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Baseline schema, applied with CREATE TABLE IF NOT EXISTS so existing
/// databases are left untouched. Structural changes beyond this go through
/// the numbered migration list.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS schema_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        applied_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        totp_secret TEXT NOT NULL DEFAULT '',
        totp_enabled INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        token TEXT NOT NULL UNIQUE,
        user_id INTEGER NOT NULL,
        expires_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL DEFAULT '',
        last_used TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        name TEXT NOT NULL DEFAULT '',
        host TEXT NOT NULL DEFAULT '',
        port INTEGER NOT NULL DEFAULT 587,
        username TEXT NOT NULL DEFAULT '',
        password TEXT NOT NULL DEFAULT '',
        implicit_tls INTEGER NOT NULL DEFAULT 0,
        is_default INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS domains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        dkim_selector TEXT NOT NULL DEFAULT 'default',
        dkim_private_key TEXT NOT NULL DEFAULT '',
        dkim_public_key TEXT NOT NULL DEFAULT '',
        mail_subdomain_prefix TEXT NOT NULL DEFAULT '',
        spf_verified INTEGER NOT NULL DEFAULT 0,
        dkim_verified INTEGER NOT NULL DEFAULT 0,
        dmarc_verified INTEGER NOT NULL DEFAULT 0,
        mx_verified INTEGER NOT NULL DEFAULT 0,
        certificate_id INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS templates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        name TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS contact_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        name TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS contacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        email TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        group_id INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active',
        meta_data TEXT NOT NULL DEFAULT '',
        UNIQUE(group_id, email)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS campaigns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        name TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT '',
        channel_id INTEGER NOT NULL DEFAULT 0,
        target_type TEXT NOT NULL DEFAULT 'group',
        target_group_id INTEGER NOT NULL DEFAULT 0,
        target_list TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'draft',
        scheduled_at TEXT,
        total_count INTEGER NOT NULL DEFAULT 0,
        sent_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        fail_count INTEGER NOT NULL DEFAULT 0,
        open_count INTEGER NOT NULL DEFAULT 0,
        click_count INTEGER NOT NULL DEFAULT 0,
        unsubscribe_count INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS email_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        from_addr TEXT NOT NULL DEFAULT '',
        recipient TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT '',
        attachments TEXT NOT NULL DEFAULT '',
        channel_id INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        retries INTEGER NOT NULL DEFAULT 0,
        next_retry TEXT NOT NULL,
        error_msg TEXT NOT NULL DEFAULT '',
        campaign_id INTEGER NOT NULL DEFAULT 0,
        tracking_id TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_email_queue_status ON email_queue(status)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_email_queue_campaign ON email_queue(campaign_id)"#,
    r#"CREATE TABLE IF NOT EXISTS email_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        recipient TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT '',
        error_msg TEXT NOT NULL DEFAULT '',
        channel TEXT NOT NULL DEFAULT '',
        campaign_id INTEGER NOT NULL DEFAULT 0,
        tracking_id TEXT NOT NULL DEFAULT '',
        opened INTEGER NOT NULL DEFAULT 0,
        opened_at TEXT,
        clicked_count INTEGER NOT NULL DEFAULT 0,
        unsubscribed INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_email_logs_tracking ON email_logs(tracking_id)"#,
    r#"CREATE TABLE IF NOT EXISTS inbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        from_addr TEXT NOT NULL DEFAULT '',
        to_addr TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT '',
        raw_data TEXT NOT NULL DEFAULT '',
        is_read INTEGER NOT NULL DEFAULT 0,
        tags TEXT NOT NULL DEFAULT '',
        remote_ip TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS attachment_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        filename TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        file_size INTEGER NOT NULL DEFAULT 0,
        content_type TEXT NOT NULL DEFAULT '',
        source TEXT NOT NULL DEFAULT '',
        related_to TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS forward_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        domain_id INTEGER NOT NULL,
        match_type TEXT NOT NULL DEFAULT 'all',
        match_addr TEXT NOT NULL DEFAULT '',
        forward_to TEXT NOT NULL DEFAULT '',
        enabled INTEGER NOT NULL DEFAULT 1,
        remark TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS forward_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        deleted_at TEXT,
        rule_id INTEGER NOT NULL DEFAULT 0,
        from_addr TEXT NOT NULL DEFAULT '',
        to_addr TEXT NOT NULL DEFAULT '',
        forward_to TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT '',
        error_msg TEXT NOT NULL DEFAULT '',
        remote_ip TEXT NOT NULL DEFAULT ''
    )"#,
];

/// Numbered migrations, applied in order once each. A migration records
/// its version in schema_versions; only versions above the current
/// maximum run.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "initial setup", "SELECT 1"),
    (
        2,
        "clean orphaned forward rules",
        "DELETE FROM forward_rules WHERE domain_id NOT IN (SELECT id FROM domains)",
    ),
];

/// Single-writer SQLite pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the database file, creating it when missing.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| Error::Database(format!("Invalid database path {}: {}", path, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // SQLite is a single-writer engine; a one-connection pool keeps
        // every cross-task invariant inside the storage layer.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        info!(path = %path, "Database connection established");

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn connect_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Bring the schema up to date and seed base data. Fails hard when
    /// the schema cannot be calibrated.
    pub async fn init(&self) -> Result<()> {
        self.migrate().await?;
        self.seed().await?;
        Ok(())
    }

    /// Apply the baseline schema, then any pending numbered migrations.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Schema calibration failed: {}", e)))?;
        }

        let current: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_versions")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        let current = current.0.unwrap_or(0);

        for (version, description, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            info!(version, description, "Applying migration");
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Migration v{} failed: {}", version, e)))?;
            sqlx::query(
                "INSERT INTO schema_versions (version, description, applied_at) VALUES (?, ?, ?)",
            )
            .bind(version)
            .bind(description)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration v{} bookkeeping failed: {}", version, e)))?;
        }

        Ok(())
    }

    /// Seed the admin user and an example template.
    async fn seed(&self) -> Result<()> {
        let admin: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE username = 'admin'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        if admin.0 == 0 {
            let password = generate_initial_password();
            let hash = hash_password(&password)?;
            let now = Utc::now();
            sqlx::query(
                "INSERT INTO users (created_at, updated_at, username, password_hash) VALUES (?, ?, 'admin', ?)",
            )
            .bind(now)
            .bind(now)
            .bind(&hash)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            info!("╔══════════════════════════════════════════════╗");
            info!("║  Default admin password: {:<19} ║", password);
            info!("║  Please change it after first login!         ║");
            info!("╚══════════════════════════════════════════════╝");
        }

        let templates: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM templates")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        if templates.0 == 0 {
            let now = Utc::now();
            sqlx::query(
                "INSERT INTO templates (created_at, updated_at, name, subject, body) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(now)
            .bind(now)
            .bind("Welcome (example)")
            .bind("Welcome to Mailforge")
            .bind("<h1>Hello {{.username}},</h1><p>Thanks for trying Mailforge.</p>")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Random 8-char initial password, ambiguous glyphs excluded.
pub fn generate_initial_password() -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Argon2 password hash
pub fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against its stored hash
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    use argon2::Argon2;

    PasswordHash::new(stored_hash)
        .ok()
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        db.migrate().await.unwrap();

        let versions: Vec<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_versions ORDER BY version")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(versions, vec![(1,), (2,)]);
    }

    #[tokio::test]
    async fn seeds_admin_once() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        db.init().await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter2!").unwrap();
        assert!(verify_password("hunter2!", &hash));
        assert!(!verify_password("hunter3!", &hash));
    }
}
