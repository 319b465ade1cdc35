use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(feature = "persistence")]
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tokio::sync::RwLock;
use tokio::{fs, io::AsyncWriteExt};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{LabError, Result};
use crate::message::Message;

/// Persistence contract for conversation threads.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, thread: &str) -> Result<Vec<Message>>;
    async fn append(&self, thread: &str, messages: &[Message]) -> Result<()>;
    async fn clear(&self, thread: &str) -> Result<()>;
    async fn threads(&self) -> Result<Vec<String>>;
}

pub async fn open_store(cfg: &StorageConfig) -> Result<Arc<dyn ConversationStore>> {
    match cfg.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryConversationStore::default())),
        StorageBackend::File => Ok(Arc::new(FileConversationStore::new(&cfg.path))),
        #[cfg(feature = "persistence")]
        StorageBackend::Sqlite => {
            let url = cfg.database_url.as_deref().ok_or_else(|| {
                LabError::Config("storage.database_url is required for the sqlite backend".into())
            })?;
            Ok(Arc::new(SqlConversationStore::connect(url).await?))
        }
        #[cfg(not(feature = "persistence"))]
        StorageBackend::Sqlite => Err(LabError::Config(
            "the sqlite backend needs the `persistence` feature".into(),
        )),
    }
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    threads: RwLock<HashMap<String, Vec<Message>>>,
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, thread: &str) -> Result<Vec<Message>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, thread: &str, messages: &[Message]) -> Result<()> {
        self.threads
            .write()
            .await
            .entry(thread.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn clear(&self, thread: &str) -> Result<()> {
        self.threads.write().await.remove(thread);
        Ok(())
    }

    async fn threads(&self) -> Result<Vec<String>> {
        let mut threads: Vec<String> = self.threads.read().await.keys().cloned().collect();
        threads.sort();
        Ok(threads)
    }
}

/// One JSONL file per thread under a directory.
pub struct FileConversationStore {
    dir: PathBuf,
}

impl FileConversationStore {
    const EXTENSION: &'static str = "jsonl";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, thread: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", urlencoding::encode(thread), Self::EXTENSION))
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn load(&self, thread: &str) -> Result<Vec<Message>> {
        let path = self.path_for(thread);
        let content = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(LabError::Storage(format!(
                    "failed to read transcript `{}`: {err}",
                    path.display()
                )))
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(LabError::from))
            .collect()
    }

    async fn append(&self, thread: &str, messages: &[Message]) -> Result<()> {
        let mut serialized = String::new();
        for message in messages {
            serialized.push_str(&serde_json::to_string(message)?);
            serialized.push('\n');
        }
        fs::create_dir_all(&self.dir).await.map_err(|err| {
            LabError::Storage(format!("failed to create `{}`: {err}", self.dir.display()))
        })?;
        let path = self.path_for(thread);
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| LabError::Storage(format!("failed to open `{}`: {err}", path.display())))?
            .write_all(serialized.as_bytes())
            .await
            .map_err(|err| LabError::Storage(format!("failed to persist messages: {err}")))
    }

    async fn clear(&self, thread: &str) -> Result<()> {
        let path = self.path_for(thread);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LabError::Storage(format!(
                "failed clearing `{}`: {err}",
                path.display()
            ))),
        }
    }

    async fn threads(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(LabError::Storage(format!("failed listing threads: {err}"))),
        };
        let mut threads = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(".jsonl"))
            else {
                continue;
            };
            if let Ok(thread) = urlencoding::decode(stem) {
                threads.push(thread.into_owned());
            }
        }
        threads.sort();
        Ok(threads)
    }
}

#[cfg(feature = "persistence")]
pub struct SqlConversationStore {
    pool: SqlitePool,
}

#[cfg(feature = "persistence")]
impl SqlConversationStore {
    const INIT_STATEMENTS: [&'static str; 2] = [
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id TEXT NOT NULL,
            payload TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS messages_thread ON messages (thread_id, id)",
    ];

    pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(connection_url.as_ref())
            .await
            .map_err(|err| {
                LabError::Storage(format!(
                    "failed connecting to SQL backend `{}`: {err}",
                    connection_url.as_ref()
                ))
            })?;

        for statement in Self::INIT_STATEMENTS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|err| LabError::Storage(format!("failed initializing schema: {err}")))?;
        }

        Ok(Self { pool })
    }
}

#[cfg(feature = "persistence")]
#[async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load(&self, thread: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT payload FROM messages WHERE thread_id = ? ORDER BY id ASC")
            .bind(thread)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| LabError::Storage(format!("failed loading messages: {err}")))?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.try_get("payload").map_err(|err| {
                    LabError::Storage(format!("failed decoding message payload: {err}"))
                })?;
                serde_json::from_str(&payload)
                    .map_err(|err| LabError::Storage(format!("invalid message payload: {err}")))
            })
            .collect()
    }

    async fn append(&self, thread: &str, messages: &[Message]) -> Result<()> {
        let storage_err = |err: sqlx::Error| LabError::Storage(format!("failed writing message: {err}"));
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for message in messages {
            sqlx::query("INSERT INTO messages (thread_id, payload) VALUES (?, ?)")
                .bind(thread)
                .bind(serde_json::to_string(message)?)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }

    async fn clear(&self, thread: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE thread_id = ?")
            .bind(thread)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| LabError::Storage(format!("failed clearing messages: {err}")))
    }

    async fn threads(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT thread_id FROM messages ORDER BY thread_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| LabError::Storage(format!("failed listing threads: {err}")))?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("thread_id")
                    .map_err(|err| LabError::Storage(format!("failed decoding thread id: {err}")))
            })
            .collect()
    }
}
