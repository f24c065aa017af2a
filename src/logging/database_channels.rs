use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row};

use super::database::DatabaseLogger;
use super::time::{parse_datetime_string, to_iso8601_utc_string};
use crate::channel::{Channel, ChannelStatus, ChannelStore, ChannelType};
use crate::error::GatewayError;

const CHANNEL_COLUMNS: &str = "id, name, channel_type, base_url, api_key, models, test_model, \
     model_mapping, channel_group, status, response_time_ms, auto_ban, test_time";

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let type_raw: String = row.get(2)?;
    let channel_type = ChannelType::from_db_value(&type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown channel type {}", type_raw),
            )),
        )
    })?;
    let test_time: Option<String> = row.get(12)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_type,
        base_url: row.get(3)?,
        key: row.get(4)?,
        models: row.get(5)?,
        test_model: row.get(6)?,
        model_mapping: row.get(7)?,
        group: row.get(8)?,
        status: ChannelStatus::from_db_value(row.get(9)?),
        response_time_ms: row.get(10)?,
        auto_ban: row.get::<_, i64>(11)? != 0,
        test_time: test_time.and_then(|s| parse_datetime_string(&s).ok()),
    })
}

#[async_trait]
impl ChannelStore for DatabaseLogger {
    async fn get_channel(&self, id: i64) -> Result<Option<Channel>, GatewayError> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE id = ?1 LIMIT 1",
            CHANNEL_COLUMNS
        ))?;
        Ok(stmt.query_row([id], channel_from_row).optional()?)
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, GatewayError> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels ORDER BY id",
            CHANNEL_COLUMNS
        ))?;
        let rows = stmt.query_map([], channel_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 配置种子不覆盖运行期状态（status / response_time / test_time）
    async fn upsert_channel(&self, channel: &Channel) -> Result<(), GatewayError> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO channels (id, name, channel_type, base_url, api_key, models, test_model,
                                   model_mapping, channel_group, status, auto_ban)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                                           channel_type = excluded.channel_type,
                                           base_url = excluded.base_url,
                                           api_key = excluded.api_key,
                                           models = excluded.models,
                                           test_model = excluded.test_model,
                                           model_mapping = excluded.model_mapping,
                                           channel_group = excluded.channel_group,
                                           auto_ban = excluded.auto_ban",
            (
                channel.id,
                &channel.name,
                channel.channel_type.as_db_value(),
                &channel.base_url,
                &channel.key,
                &channel.models,
                &channel.test_model,
                &channel.model_mapping,
                &channel.group,
                channel.status.as_db_value(),
                channel.auto_ban as i64,
            ),
        )?;
        Ok(())
    }

    async fn update_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        reason: Option<&str>,
    ) -> Result<bool, GatewayError> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE channels SET status = ?1, status_reason = ?2 WHERE id = ?3",
            (status.as_db_value(), reason, id),
        )?;
        Ok(changed > 0)
    }

    async fn update_response_time(
        &self,
        id: i64,
        response_time_ms: i64,
    ) -> Result<(), GatewayError> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE channels SET response_time_ms = ?1, test_time = ?2 WHERE id = ?3",
            (response_time_ms, to_iso8601_utc_string(&Utc::now()), id),
        )?;
        Ok(())
    }
}
