use async_trait::async_trait;

use super::database::DatabaseLogger;
use super::time::to_iso8601_utc_string;
use super::types::ConsumeLog;
use crate::error::GatewayError;
use crate::server::storage_traits::ConsumeLogStore;

#[async_trait]
impl ConsumeLogStore for DatabaseLogger {
    async fn record_consume_log(&self, log: ConsumeLog) -> Result<i64, GatewayError> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO consume_logs (
                created_at, channel_id, model_name, token_name, prompt_tokens,
                completion_tokens, quota, use_time_ms, is_stream, log_group, content, other
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            (
                to_iso8601_utc_string(&log.created_at),
                log.channel_id,
                &log.model_name,
                &log.token_name,
                log.prompt_tokens,
                log.completion_tokens,
                log.quota,
                log.use_time_ms,
                log.is_stream as i64,
                &log.group,
                &log.content,
                &log.other,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
impl DatabaseLogger {
    /// Newest first.
    pub async fn recent_consume_logs(&self, limit: i64) -> Result<Vec<ConsumeLog>, GatewayError> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, channel_id, model_name, token_name, prompt_tokens,
                    completion_tokens, quota, use_time_ms, is_stream, log_group, content, other
             FROM consume_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            let created_at: String = row.get(1)?;
            Ok(ConsumeLog {
                id: Some(row.get(0)?),
                created_at: super::time::parse_datetime_string(&created_at).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        Box::new(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e.to_string(),
                        )),
                    )
                })?,
                channel_id: row.get(2)?,
                model_name: row.get(3)?,
                token_name: row.get(4)?,
                prompt_tokens: row.get(5)?,
                completion_tokens: row.get(6)?,
                quota: row.get(7)?,
                use_time_ms: row.get(8)?,
                is_stream: row.get::<_, i64>(9)? != 0,
                group: row.get(10)?,
                content: row.get(11)?,
                other: row.get(12)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn log(model: &str, quota: i64) -> ConsumeLog {
        ConsumeLog {
            id: None,
            created_at: Utc::now(),
            channel_id: 7,
            model_name: model.to_string(),
            token_name: "channel test".into(),
            prompt_tokens: 100,
            completion_tokens: 50,
            quota,
            use_time_ms: 420,
            is_stream: false,
            group: "default".into(),
            content: "model test".into(),
            other: "{}".into(),
        }
    }

    #[tokio::test]
    async fn records_and_lists_newest_first() {
        let dir = tempdir().unwrap();
        let db = DatabaseLogger::new(dir.path().join("logs/gw.db").to_str().unwrap())
            .await
            .unwrap();

        let first = db.record_consume_log(log("gemini-2.5-flash", 100)).await.unwrap();
        let second = db.record_consume_log(log("gpt-4o-mini", 3)).await.unwrap();
        assert!(second > first);

        let logs = db.recent_consume_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].model_name, "gpt-4o-mini");
        assert_eq!(logs[1].quota, 100);
        assert_eq!(logs[1].channel_id, 7);

        assert_eq!(db.recent_consume_logs(1).await.unwrap().len(), 1);
    }
}
