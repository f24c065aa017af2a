use rusqlite::{Connection, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct DatabaseLogger {
    pub(super) connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    Some(format!("Failed to create directory: {}", e)),
                ));
            }
            tracing::info!("Created database directory: {}", parent.display());
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                base_url TEXT,
                api_key TEXT NOT NULL,
                models TEXT NOT NULL DEFAULT '',
                test_model TEXT,
                model_mapping TEXT,
                channel_group TEXT NOT NULL DEFAULT 'default',
                status INTEGER NOT NULL DEFAULT 1,
                status_reason TEXT,
                response_time_ms INTEGER NOT NULL DEFAULT 0,
                auto_ban INTEGER NOT NULL DEFAULT 1,
                test_time TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS consume_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                channel_id INTEGER NOT NULL,
                model_name TEXT NOT NULL,
                token_name TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                quota INTEGER NOT NULL,
                use_time_ms INTEGER NOT NULL,
                is_stream INTEGER NOT NULL,
                log_group TEXT NOT NULL,
                content TEXT NOT NULL,
                other TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_consume_logs_channel ON consume_logs(channel_id)",
            [],
        )?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }
}
