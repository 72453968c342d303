//! SQLite-backed conversation/request store (WAL journaling).
//!
//! Schema is fixed at startup; there are no migrations. The store is safe
//! for many concurrent callers within one process: the seq race on message
//! append and the unique race on request upsert both resolve by retry.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::{Result, SibylError};
use crate::types::{RequestStatus, Role};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT,
        metadata_json TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id),
        role TEXT NOT NULL CHECK (role IN ('system', 'user', 'assistant', 'tool')),
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        seq INTEGER NOT NULL,
        request_id INTEGER REFERENCES requests(id),
        UNIQUE (conversation_id, seq)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id),
        message_id INTEGER NOT NULL REFERENCES messages(id),
        model TEXT NOT NULL,
        params_json TEXT NOT NULL,
        input_hash TEXT NOT NULL,
        provider_response_id TEXT,
        status TEXT NOT NULL CHECK (
            status IN ('queued', 'in_progress', 'completed', 'failed', 'cancelled', 'expired')
        ),
        error_json TEXT,
        tries INTEGER NOT NULL DEFAULT 0,
        started_at TEXT,
        completed_at TEXT,
        output_text TEXT,
        raw_json TEXT,
        usage_json TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (conversation_id, input_hash)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq ON messages(conversation_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_requests_conversation_status ON requests(conversation_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_requests_provider_response ON requests(provider_response_id)",
];

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub title: Option<String>,
    pub metadata_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
    pub request_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RequestRow {
    pub id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    pub model: String,
    pub params_json: String,
    pub input_hash: String,
    pub provider_response_id: Option<String>,
    pub status: RequestStatus,
    pub error_json: Option<String>,
    pub tries: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_text: Option<String>,
    pub raw_json: Option<String>,
    pub usage_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|err| SibylError::Configuration(format!("invalid sqlite options: {err}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Conversations ──────────────────────────────────────────────────

    pub async fn create_conversation(
        &self,
        title: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<ConversationRow> {
        let now = Utc::now().to_rfc3339();
        let metadata_json = metadata.map(Value::to_string);
        let done = sqlx::query(
            "INSERT INTO conversations (title, metadata_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(title)
        .bind(&metadata_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = done.last_insert_rowid();
        self.get_conversation(id)
            .await?
            .ok_or_else(|| SibylError::Internal(format!("conversation {id} vanished after insert")))
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Option<ConversationRow>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Append a message with the next dense `seq`, bumping the
    /// conversation's `updated_at` in the same transaction. Concurrent
    /// appends race on the UNIQUE(conversation_id, seq) constraint; the
    /// loser retries with a fresh seq.
    pub async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        request_id: Option<i64>,
    ) -> Result<MessageRow> {
        const MAX_ATTEMPTS: u32 = 5;

        for _ in 0..MAX_ATTEMPTS {
            let mut tx = self.pool.begin().await?;

            let next_seq: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?",
            )
            .bind(conversation_id)
            .fetch_one(&mut *tx)
            .await?;

            let now = Utc::now().to_rfc3339();
            let inserted = sqlx::query(
                "INSERT INTO messages (conversation_id, role, content, created_at, seq, request_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(role.to_string())
            .bind(content)
            .bind(&now)
            .bind(next_seq)
            .bind(request_id)
            .execute(&mut *tx)
            .await;

            let done = match inserted {
                Ok(done) => done,
                Err(err) if is_unique_violation(&err) => {
                    tx.rollback().await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            let id = done.last_insert_rowid();
            return self
                .get_message(id)
                .await?
                .ok_or_else(|| SibylError::Internal(format!("message {id} vanished after insert")));
        }

        Err(SibylError::Internal(
            "append_message exhausted retries on the seq race".into(),
        ))
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_message_row).transpose()
    }

    pub async fn list_messages(&self, conversation_id: i64) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq ASC")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_message_row).collect()
    }

    // ── Requests ───────────────────────────────────────────────────────

    /// Find-or-insert the request row for `(conversation_id, input_hash)`.
    /// Returns the row and whether this call created it. A concurrent
    /// insert losing the UNIQUE race observes the winner on reselect.
    pub async fn upsert_request(
        &self,
        conversation_id: i64,
        message_id: i64,
        model: &str,
        params_json: &str,
        input_hash: &str,
    ) -> Result<(RequestRow, bool)> {
        if let Some(row) = self.find_request_by_hash(conversation_id, input_hash).await? {
            return Ok((row, false));
        }

        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            "INSERT INTO requests \
             (conversation_id, message_id, model, params_json, input_hash, status, tries, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 'queued', 0, ?, ?)",
        )
        .bind(conversation_id)
        .bind(message_id)
        .bind(model)
        .bind(params_json)
        .bind(input_hash)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) => {
                let id = done.last_insert_rowid();
                let row = self.get_request(id).await?.ok_or_else(|| {
                    SibylError::Internal(format!("request {id} vanished after insert"))
                })?;
                Ok((row, true))
            }
            Err(err) if is_unique_violation(&err) => {
                let row = self
                    .find_request_by_hash(conversation_id, input_hash)
                    .await?
                    .ok_or_else(|| {
                        SibylError::Internal("upsert race lost but winner row not found".into())
                    })?;
                Ok((row, false))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_request(&self, id: i64) -> Result<Option<RequestRow>> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_request_row).transpose()
    }

    pub async fn find_request_by_hash(
        &self,
        conversation_id: i64,
        input_hash: &str,
    ) -> Result<Option<RequestRow>> {
        let row = sqlx::query("SELECT * FROM requests WHERE conversation_id = ? AND input_hash = ?")
            .bind(conversation_id)
            .bind(input_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_request_row).transpose()
    }

    /// Claim ownership of a queued request: move it to `in_progress`, bump
    /// `tries`, and stamp `started_at` once, guarded by a
    /// `status = 'queued'` compare-and-swap. Returns whether this caller won
    /// the claim; losers observe the request instead of driving it.
    pub async fn mark_started(&self, id: i64) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let done = sqlx::query(
            "UPDATE requests SET status = 'in_progress', tries = tries + 1, \
             started_at = COALESCE(started_at, ?), updated_at = ? \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Persist the upstream job id on a claimed request.
    pub async fn save_in_progress(&self, id: i64, provider_response_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE requests SET provider_response_id = ?, updated_at = ? \
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(provider_response_id)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move the status forward on the partial order
    /// `queued < in_progress < terminal`. Backward moves are no-ops.
    /// Returns whether a row changed.
    pub async fn advance_status(&self, id: i64, status: RequestStatus) -> Result<bool> {
        let query = match status {
            RequestStatus::Queued => return Ok(false),
            RequestStatus::InProgress => {
                "UPDATE requests SET status = ?, updated_at = ? WHERE id = ? AND status = 'queued'"
            }
            _ => {
                "UPDATE requests SET status = ?, updated_at = ? \
                 WHERE id = ? AND status IN ('queued', 'in_progress')"
            }
        };
        let done = sqlx::query(query)
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Terminal success: persist the output and stamp `completed_at`.
    /// Returns false if the row was already terminal (a racing poller won).
    pub async fn save_completion(
        &self,
        id: i64,
        output_text: &str,
        raw: Option<&Value>,
        usage: Option<&Value>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let done = sqlx::query(
            "UPDATE requests SET status = 'completed', output_text = ?, raw_json = ?, \
             usage_json = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status IN ('queued', 'in_progress')",
        )
        .bind(output_text)
        .bind(raw.map(Value::to_string))
        .bind(usage.map(Value::to_string))
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Terminal failure (`failed`, `cancelled`, or `expired`): persist the
    /// error. Returns false if the row was already terminal.
    pub async fn save_failure(
        &self,
        id: i64,
        status: RequestStatus,
        error: &Value,
    ) -> Result<bool> {
        if !status.is_terminal() || status == RequestStatus::Completed {
            return Err(SibylError::Internal(format!(
                "save_failure called with non-failure status {status}"
            )));
        }
        let now = Utc::now().to_rfc3339();
        let done = sqlx::query(
            "UPDATE requests SET status = ?, error_json = ?, updated_at = ? \
             WHERE id = ? AND status IN ('queued', 'in_progress')",
        )
        .bind(status.to_string())
        .bind(error.to_string())
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ── Row parsing ────────────────────────────────────────────────────────

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SibylError::Internal(format!("bad timestamp '{raw}': {e}")))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn parse_conversation_row(row: &SqliteRow) -> Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        metadata_json: row.try_get("metadata_json")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn parse_message_row(row: &SqliteRow) -> Result<MessageRow> {
    let role_str: String = row.try_get("role")?;
    let role = Role::from_str(&role_str)
        .map_err(|_| SibylError::Internal(format!("bad message role '{role_str}'")))?;
    Ok(MessageRow {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role,
        content: row.try_get("content")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        seq: row.try_get("seq")?,
        request_id: row.try_get("request_id")?,
    })
}

fn parse_request_row(row: &SqliteRow) -> Result<RequestRow> {
    let status_str: String = row.try_get("status")?;
    let status = RequestStatus::from_str(&status_str)
        .map_err(|_| SibylError::Internal(format!("bad request status '{status_str}'")))?;
    Ok(RequestRow {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        message_id: row.try_get("message_id")?,
        model: row.try_get("model")?,
        params_json: row.try_get("params_json")?,
        input_hash: row.try_get("input_hash")?,
        provider_response_id: row.try_get("provider_response_id")?,
        status,
        error_json: row.try_get("error_json")?,
        tries: row.try_get("tries")?,
        started_at: parse_optional_timestamp(row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp(row.try_get("completed_at")?)?,
        output_text: row.try_get("output_text")?,
        raw_json: row.try_get("raw_json")?,
        usage_json: row.try_get("usage_json")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}
