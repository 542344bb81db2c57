use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::debug;

use shared::{
    domain::{MessageId, UserId},
    protocol::ReadReceipt,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    // Last `created_at_us` handed out. Held across the insert so ids and
    // timestamps are assigned in the same order.
    clock: Arc<Mutex<i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_by: Vec<ReadReceipt>,
}

impl StoredMessage {
    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.iter().any(|r| r.reader_id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConversation {
    pub counterpart_id: UserId,
    pub last_message: StoredMessage,
    /// Messages from the counterpart the user has not marked read.
    pub unread_count: u32,
}

// Stays well under SQLite's limit on bound parameters per statement.
const RECEIPT_LOOKUP_CHUNK: usize = 500;

const MESSAGE_COLUMNS: &str =
    "id, sender_user_id, receiver_user_id, content, created_at_us";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // A shared-cache memory database locks whole tables, so concurrent
        // writers on separate connections would fail instead of waiting.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let last_created_at: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(created_at_us), 0) FROM messages")
                .fetch_one(&pool)
                .await
                .context("failed to read message clock")?;
        debug!(last_created_at, "message clock seeded");

        Ok(Self {
            pool,
            clock: Arc::new(Mutex::new(last_created_at)),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn find_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
        }))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        Ok(self.find_user(user_id).await?.map(|user| user.username))
    }

    pub async fn list_users(&self) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query("SELECT id, username FROM users ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredUser {
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
            })
            .collect())
    }

    /// Persists a message and assigns its id and `created_at`. Timestamps are
    /// strictly increasing, so `created_at` alone orders any conversation.
    pub async fn insert_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<StoredMessage> {
        let mut clock = self.clock.lock().await;
        let created_at_us = Utc::now().timestamp_micros().max(*clock + 1);

        let rec = sqlx::query(
            "INSERT INTO messages (sender_user_id, receiver_user_id, content, created_at_us)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(sender_id.0)
        .bind(receiver_id.0)
        .bind(content)
        .bind(created_at_us)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;
        *clock = created_at_us;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            sender_id,
            receiver_id,
            content: content.to_string(),
            created_at: micros_to_datetime(created_at_us)?,
            read_by: Vec::new(),
        })
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut messages = vec![message_from_row(&row)?];
        self.attach_receipts(&mut messages).await?;
        Ok(messages.pop())
    }

    pub async fn count_messages_between(&self, a: UserId, b: UserId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE (sender_user_id = ? AND receiver_user_id = ?)
                OR (sender_user_id = ? AND receiver_user_id = ?)",
        )
        .bind(a.0)
        .bind(b.0)
        .bind(b.0)
        .bind(a.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Returns `limit` messages of the pair after skipping the `offset` most
    /// recent ones, oldest first.
    pub async fn list_messages_between(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE (sender_user_id = ? AND receiver_user_id = ?)
                OR (sender_user_id = ? AND receiver_user_id = ?)
             ORDER BY created_at_us DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(a.0)
        .bind(b.0)
        .bind(b.0)
        .bind(a.0)
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .rev()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_receipts(&mut messages).await?;
        Ok(messages)
    }

    /// One head per counterpart the user has exchanged messages with, most
    /// recently active first. Heads and unread counts are computed by the
    /// database, so the cost does not grow with the size of the history
    /// handed back.
    pub async fn list_conversations(&self, user_id: UserId) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "WITH heads AS (
                 SELECT CASE WHEN sender_user_id = ? THEN receiver_user_id
                             ELSE sender_user_id END AS counterpart_id,
                        MAX(created_at_us) AS last_at
                 FROM messages
                 WHERE sender_user_id = ? OR receiver_user_id = ?
                 GROUP BY counterpart_id
             )
             SELECT m.id, m.sender_user_id, m.receiver_user_id, m.content, m.created_at_us,
                    h.counterpart_id,
                    (SELECT COUNT(*) FROM messages u
                     WHERE u.sender_user_id = h.counterpart_id
                       AND u.receiver_user_id = ?
                       AND NOT EXISTS (
                           SELECT 1 FROM message_reads r
                           WHERE r.message_id = u.id AND r.reader_user_id = ?
                       )) AS unread_count
             FROM heads h
             JOIN messages m ON m.created_at_us = h.last_at
             ORDER BY m.created_at_us DESC",
        )
        .bind(user_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list conversations")?;

        let mut heads = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_receipts(&mut heads).await?;

        Ok(heads
            .into_iter()
            .zip(&rows)
            .map(|(last_message, row)| StoredConversation {
                counterpart_id: UserId(row.get::<i64, _>(5)),
                unread_count: u32::try_from(row.get::<i64, _>(6)).unwrap_or(u32::MAX),
                last_message,
            })
            .collect())
    }

    /// Records that `reader_id` observed the message and returns the new
    /// receipt, or `None` when that reader was already recorded or the
    /// message no longer exists. The primary key and the existence guard make
    /// the check-and-insert a single atomic statement, so a concurrent delete
    /// cannot trip the foreign key.
    pub async fn insert_read_receipt(
        &self,
        message_id: MessageId,
        reader_id: UserId,
    ) -> Result<Option<ReadReceipt>> {
        let read_at_us = Utc::now().timestamp_micros();
        let result = sqlx::query(
            "INSERT INTO message_reads (message_id, reader_user_id, read_at_us)
             SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM messages WHERE id = ?)
             ON CONFLICT(message_id, reader_user_id) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(reader_id.0)
        .bind(read_at_us)
        .bind(message_id.0)
        .execute(&self.pool)
        .await
        .context("failed to insert read receipt")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(ReadReceipt {
            reader_id,
            read_at: micros_to_datetime(read_at_us)?,
        }))
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM message_reads WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn attach_receipts(&self, messages: &mut [StoredMessage]) -> Result<()> {
        let mut receipts: HashMap<MessageId, Vec<ReadReceipt>> = HashMap::new();
        for chunk in messages.chunks(RECEIPT_LOOKUP_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "SELECT message_id, reader_user_id, read_at_us FROM message_reads WHERE message_id IN (",
            );
            let mut ids = query.separated(", ");
            for message in chunk {
                ids.push_bind(message.message_id.0);
            }
            ids.push_unseparated(") ORDER BY read_at_us ASC, rowid ASC");

            for row in query.build().fetch_all(&self.pool).await? {
                receipts
                    .entry(MessageId(row.get::<i64, _>(0)))
                    .or_default()
                    .push(ReadReceipt {
                        reader_id: UserId(row.get::<i64, _>(1)),
                        read_at: micros_to_datetime(row.get::<i64, _>(2))?,
                    });
            }
        }

        for message in messages.iter_mut() {
            if let Some(read_by) = receipts.remove(&message.message_id) {
                message.read_by = read_by;
            }
        }
        Ok(())
    }
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: MessageId(row.get::<i64, _>(0)),
        sender_id: UserId(row.get::<i64, _>(1)),
        receiver_id: UserId(row.get::<i64, _>(2)),
        content: row.get::<String, _>(3),
        created_at: micros_to_datetime(row.get::<i64, _>(4))?,
        read_by: Vec::new(),
    })
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp out of range: {micros}"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
