use crate::db;
use crate::error::ChatError;
use crate::model::{Role, UserRecord};
use anyhow::Result;
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

const WRITE_ATTEMPTS: u32 = 3;
const BACKOFF_START: Duration = Duration::from_millis(50);

/// Durable home of conversations and messages.
///
/// All mutations go through the single writer connection, which makes every
/// accepted message a point in one total order per conversation and keeps
/// counter updates free of lost writes. Reads go to a small pool so history
/// pagination does not queue behind sends.
pub struct Store {
    writer: Mutex<Connection>,
    readers: Pool<SqliteConnectionManager>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let writer = db::init_db(&path)?;
        let manager = SqliteConnectionManager::file(&path).with_init(|c| {
            c.pragma_update(None, "foreign_keys", "ON")?;
            c.busy_timeout(Duration::from_secs(5))
        });
        let readers = Pool::builder().max_size(4).build(manager)?;
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
        })
    }

    /// Run a mutation with bounded retry. Raw storage failures are retried
    /// with doubling backoff; after the last attempt the caller sees
    /// `storage_unavailable` and is expected to resend.
    pub async fn write<T, F>(&self, op: F) -> Result<T, ChatError>
    where
        F: Fn(&mut Connection) -> Result<T, ChatError>,
    {
        let mut delay = BACKOFF_START;
        for attempt in 1..=WRITE_ATTEMPTS {
            let res = {
                let mut conn = self.writer.lock();
                op(&mut conn)
            };
            match res {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < WRITE_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "store write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(error = %e, "store write retries exhausted");
                    return Err(ChatError::StorageUnavailable);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ChatError::StorageUnavailable)
    }

    /// Run a query on the read pool with the same retry policy.
    pub async fn read<T, F>(&self, op: F) -> Result<T, ChatError>
    where
        F: Fn(&Connection) -> Result<T, ChatError>,
    {
        let mut delay = BACKOFF_START;
        for attempt in 1..=WRITE_ATTEMPTS {
            let res = match self.readers.get() {
                Ok(conn) => op(&conn),
                Err(e) => {
                    tracing::error!(error = %e, "read pool exhausted");
                    Err(ChatError::StorageUnavailable)
                }
            };
            match res {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < WRITE_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "store read failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) if e.is_transient() => return Err(ChatError::StorageUnavailable),
                Err(e) => return Err(e),
            }
        }
        Err(ChatError::StorageUnavailable)
    }
}

/// Insert or refresh the platform-owned identity mirror for a user.
pub fn upsert_user(conn: &Connection, user: &UserRecord) -> Result<(), ChatError> {
    conn.execute(
        "INSERT INTO users (id, username, display_name, role) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
           username = excluded.username,
           display_name = excluded.display_name,
           role = excluded.role",
        params![user.id, user.username, user.display_name, user.role.as_str()],
    )?;
    Ok(())
}

pub fn role_of(conn: &Connection, user_id: &str) -> Result<Option<Role>, ChatError> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?1", [user_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(role.as_deref().and_then(Role::parse))
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserRecord>, ChatError> {
    let user = conn
        .query_row(
            "SELECT id, username, display_name, role FROM users WHERE id = ?1",
            [user_id],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    role: Role::parse(row.get::<_, String>(3)?.as_str()).unwrap(),
                })
            },
        )
        .optional()?;
    Ok(user)
}
