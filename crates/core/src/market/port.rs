use crate::common::{DataType, Stock, TimeFrame};
use crate::market::entity::{Candle, StreamEvent};
use crate::market::error::MarketError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::BTreeSet;
use std::pin::Pin;

/// # Summary
/// 实时事件流别名，使用动态分发的异步流。
pub type MessageStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// # Summary
/// 历史行情数据提供者接口（REST 数据源）。
///
/// # Invariants
/// - 返回的 K 线按时间升序排列。
/// - 区间语义为 `[start, end)`。
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// # Summary
    /// 获取特定证券在指定时间范围内的 K 线数据。
    ///
    /// # Logic
    /// 1. 验证时间范围合法性。
    /// 2. 构建数据源请求，必要时分页。
    /// 3. 执行网络请求并解析响应数据。
    ///
    /// # Arguments
    /// * `stock`: 证券身份。
    /// * `timeframe`: K 线周期。
    /// * `start`: 开始时间（包含）。
    /// * `end`: 结束时间（不包含）。
    ///
    /// # Returns
    /// 成功返回 K 线列表。
    async fn fetch_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketError>;
}

/// # Summary
/// 实时行情流来源接口。
///
/// # Invariants
/// - 实现者必须在长连接中断后自行重连，并在重连成功后推送 `StreamEvent::Reconnected`。
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// # Summary
    /// 订阅实时事件流。
    ///
    /// # Logic
    /// 1. 建立长连接并完成鉴权。
    /// 2. 按数据类型集合订阅通配频道。
    /// 3. 持续解码消息并推入流中。
    ///
    /// # Arguments
    /// * `data_types`: 需要订阅的数据类型集合。
    ///
    /// # Returns
    /// 成功返回异步事件流。
    async fn subscribe(&self, data_types: &BTreeSet<DataType>)
    -> Result<MessageStream, MarketError>;
}
