//! SQLite database management with migrations
//!
//! Holds the state that outlives a corpus generation: questions the engine
//! could not answer and the monthly usage counters.

use crate::error::{DocqaError, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// A gated-out question, kept for content-gap analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnansweredQuestion {
    pub id: i64,
    pub asked_at: DateTime<Utc>,
    pub request_id: String,
    pub user_id: u64,
    pub query: String,
    /// `no_hits` or `below_threshold`
    pub reason: String,
    pub top_score: Option<f32>,
    pub strategy: String,
}

/// Fields supplied when logging an unanswered question
#[derive(Debug, Clone)]
pub struct NewUnanswered<'a> {
    pub request_id: &'a str,
    pub user_id: u64,
    pub query: &'a str,
    pub reason: &'a str,
    pub top_score: Option<f32>,
    pub strategy: &'a str,
}

/// Database manager with migration support
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create a new database connection
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocqaError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path);

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| DocqaError::Config(format!("Failed to create connection pool: {}", e)))?;

        {
            let conn = pool
                .get()
                .map_err(|e| DocqaError::Config(format!("Failed to get connection: {}", e)))?;

            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
        }

        let db = Self { pool };
        db.migrate()?;

        Ok(db)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| DocqaError::Config(format!("Failed to get connection: {}", e)))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    pub fn record_unanswered(&self, entry: &NewUnanswered<'_>) -> Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO unanswered_questions
                (asked_at, request_id, user_id, query, reason, top_score, strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Utc::now().to_rfc3339(),
                entry.request_id,
                entry.user_id as i64,
                entry.query,
                entry.reason,
                entry.top_score.map(f64::from),
                entry.strategy,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent first
    pub fn recent_unanswered(&self, limit: usize) -> Result<Vec<UnansweredQuestion>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, asked_at, request_id, user_id, query, reason, top_score, strategy
             FROM unanswered_questions
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let asked_at: String = row.get(1)?;
            let asked_at = DateTime::parse_from_rfc3339(&asked_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
            let user_id: i64 = row.get(3)?;
            let top_score: Option<f64> = row.get(6)?;
            Ok(UnansweredQuestion {
                id: row.get(0)?,
                asked_at,
                request_id: row.get(2)?,
                user_id: user_id as u64,
                query: row.get(4)?,
                reason: row.get(5)?,
                top_score: top_score.map(|s| s as f32),
                strategy: row.get(7)?,
            })
        })?;

        let mut questions = Vec::new();
        for row in rows {
            questions.push(row?);
        }
        Ok(questions)
    }

    /// Tokens recorded for a month, if any
    pub fn load_usage(&self, month_key: &str) -> Result<Option<u64>> {
        let conn = self.get_conn()?;
        let tokens: Option<i64> = conn
            .query_row(
                "SELECT tokens_used FROM usage_months WHERE month_key = ?1",
                params![month_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tokens.map(|t| t as u64))
    }

    /// Upsert a month's total; a stored total never decreases
    pub fn save_usage(&self, month_key: &str, tokens_used: u64) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO usage_months (month_key, tokens_used, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(month_key) DO UPDATE SET
                tokens_used = MAX(tokens_used, excluded.tokens_used),
                updated_at = excluded.updated_at",
            params![month_key, tokens_used as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE unanswered_questions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        asked_at TEXT NOT NULL,
        request_id TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        query TEXT NOT NULL,
        reason TEXT NOT NULL,
        top_score REAL,
        strategy TEXT NOT NULL
    );

    CREATE INDEX idx_unanswered_asked_at ON unanswered_questions(asked_at);
    CREATE INDEX idx_unanswered_reason ON unanswered_questions(reason);

    CREATE TABLE usage_months (
        month_key TEXT PRIMARY KEY,
        tokens_used INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        (temp_dir, db)
    }

    #[test]
    fn test_migrations() {
        let (_temp, db) = open();
        let conn = db.get_conn().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_reopen_does_not_reapply() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        drop(Database::new(&path).unwrap());
        let db = Database::new(&path).unwrap();

        let conn = db.get_conn().unwrap();
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_unanswered_round_trip() {
        let (_temp, db) = open();
        for (query, score) in [("first", None), ("second", Some(0.05f32))] {
            db.record_unanswered(&NewUnanswered {
                request_id: "req",
                user_id: 42,
                query,
                reason: if score.is_some() { "below_threshold" } else { "no_hits" },
                top_score: score,
                strategy: "v1",
            })
            .unwrap();
        }

        let recent = db.recent_unanswered(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].query, "second");
        assert_eq!(recent[0].reason, "below_threshold");
        assert!((recent[0].top_score.unwrap() - 0.05).abs() < 1e-6);
        assert_eq!(recent[1].top_score, None);
        assert_eq!(recent[1].user_id, 42);

        assert_eq!(db.recent_unanswered(1).unwrap().len(), 1);
    }

    #[test]
    fn test_usage_upsert() {
        let (_temp, db) = open();
        assert_eq!(db.load_usage("2024-05").unwrap(), None);

        db.save_usage("2024-05", 100).unwrap();
        db.save_usage("2024-05", 250).unwrap();

        assert_eq!(db.load_usage("2024-05").unwrap(), Some(250));
        assert_eq!(db.load_usage("2024-06").unwrap(), None);
    }

    #[test]
    fn test_usage_save_out_of_order_keeps_highest() {
        let (_temp, db) = open();

        // a later total landing before an earlier one
        db.save_usage("2024-05", 200).unwrap();
        db.save_usage("2024-05", 100).unwrap();

        assert_eq!(db.load_usage("2024-05").unwrap(), Some(200));
    }
}
