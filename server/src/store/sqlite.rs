//! SQLite adapter over the REST backend's database file.
//!
//! The schema is owned and migrated by the REST backend. This adapter only
//! reads memberships and tokens and appends chat messages.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{
    Authenticator, ChannelId, MembershipLookup, MessageId, MessageRecord, MessageStore, ScopeId,
    StoreError, UserId,
};

/// Type alias for the shared database connection.
/// rusqlite is synchronous, so queries run under spawn_blocking.
pub type DbPool = Arc<Mutex<Connection>>;

pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    /// Open an existing database. Fails if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        tracing::info!("Message store opened at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| StoreError::Database("connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

fn sql_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Database(format!("id out of range: {id}")))
}

fn row_id(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Database(format!("negative id in row: {value}")))
}

/// SQLite `CURRENT_TIMESTAMP` text, or RFC 3339 as written by other clients.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn add_message(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        text: &str,
    ) -> Result<MessageId, StoreError> {
        let channel = sql_id(channel_id)?;
        let user = sql_id(user_id)?;
        let text = text.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ChannelMessageTable (userid, channelid, contents) VALUES (?1, ?2, ?3)",
                rusqlite::params![user, channel, text],
            )?;
            row_id(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_message(&self, message_id: MessageId) -> Result<MessageRecord, StoreError> {
        let id = sql_id(message_id)?;

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT M.messageid, M.userid, M.channelid, C.serverid, M.contents, M.timestamp
                     FROM ChannelMessageTable AS M
                     INNER JOIN ChannelTable AS C ON M.channelid = C.channelid
                     WHERE M.messageid = ?1",
                    rusqlite::params![id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

            Ok(MessageRecord {
                message_id: row_id(row.0)?,
                user_id: row_id(row.1)?,
                channel_id: row_id(row.2)?,
                server_id: row_id(row.3)?,
                contents: row.4,
                timestamp: parse_timestamp(&row.5)?,
            })
        })
        .await
    }
}

#[async_trait]
impl MembershipLookup for SqliteStore {
    async fn scopes_of_user(&self, user_id: UserId) -> Result<Vec<ScopeId>, StoreError> {
        let user = sql_id(user_id)?;

        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT serverid FROM UsersServerTable WHERE userid = ?1")?;
            let ids = stmt
                .query_map(rusqlite::params![user], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.into_iter().map(row_id).collect()
        })
        .await
    }
}

#[async_trait]
impl Authenticator for SqliteStore {
    async fn authenticate(&self, token: &str) -> Result<UserId, StoreError> {
        let token = token.to_string();

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT userid, token_expire_time FROM UserLoginTable WHERE token = ?1",
                    rusqlite::params![token],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()?;

            let Some((user, expires)) = row else {
                return Err(StoreError::Unauthorized);
            };
            let expires = expires.ok_or(StoreError::Unauthorized)?;
            if parse_timestamp(&expires)? <= Utc::now() {
                return Err(StoreError::Unauthorized);
            }
            row_id(user)
        })
        .await
    }
}
