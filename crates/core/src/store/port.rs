use super::error::StoreError;
use crate::common::{Stock, TimeFrame};
use crate::market::entity::{Candle, Quote, Trade};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// # Summary
/// 时序行情存储接口，负责 K 线、报价与成交的持久化与读取。
///
/// # Invariants
/// - 同一 `(stock, timeframe, time)` 的 K 线重复写入必须是幂等的（覆盖而非追加）。
/// - 实现者自行保证跨证券的并发读写安全，调用方不再额外加锁。
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// # Summary
    /// 批量保存 K 线数据。
    ///
    /// # Logic
    /// 1. 打开证券对应的数据库连接。
    /// 2. 批量写入 K 线数据，相同时间戳覆盖旧值。
    ///
    /// # Arguments
    /// * `stock`: 目标证券实体。
    /// * `timeframe`: K 线周期。
    /// * `candles`: 待保存的数据列表。
    ///
    /// # Returns
    /// 成功返回 Ok，失败返回 `StoreError`。
    async fn save_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        candles: &[Candle],
    ) -> Result<(), StoreError>;

    /// # Summary
    /// 从存储中加载特定时间段的 K 线数据。
    ///
    /// # Arguments
    /// * `stock`: 目标证券实体。
    /// * `timeframe`: K 线周期。
    /// * `start`: 开始时间（包含）。
    /// * `end`: 结束时间（包含）。
    ///
    /// # Returns
    /// 按时间升序的 K 线列表或 `StoreError`。
    async fn load_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError>;

    /// # Summary
    /// 查询不晚于 `at_or_before` 的最后一根 K 线的时间戳。
    ///
    /// # Logic
    /// 1. 按 `time <= at_or_before` 过滤。
    /// 2. 倒序取第一条。
    ///
    /// # Arguments
    /// * `stock`: 目标证券实体。
    /// * `timeframe`: K 线周期。
    /// * `at_or_before`: 查询上界（包含）。
    ///
    /// # Returns
    /// 存在返回 `Some(time)`，库中没有更早的记录返回 `None`。
    async fn latest_candle_time(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        at_or_before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// 批量保存报价。
    async fn save_quotes(&self, stock: &Stock, quotes: &[Quote]) -> Result<(), StoreError>;

    /// 批量保存逐笔成交。
    async fn save_trades(&self, stock: &Stock, trades: &[Trade]) -> Result<(), StoreError>;
}
