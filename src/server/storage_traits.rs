use async_trait::async_trait;

use crate::error::GatewayError;
use crate::logging::ConsumeLog;

// 消费日志存储抽象（默认由 SQLite 的 DatabaseLogger 实现）
#[async_trait]
pub trait ConsumeLogStore: Send + Sync {
    async fn record_consume_log(&self, log: ConsumeLog) -> Result<i64, GatewayError>;
}
