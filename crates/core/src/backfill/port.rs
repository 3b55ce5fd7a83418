use crate::backfill::error::BackfillError;
use crate::common::Stock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// # Summary
/// 断档信号接收端口，由实时流路由器调用。
///
/// # Invariants
/// - 调用必须是非阻塞的，不得拖慢实时流。
/// - 同一证券的多次调用以最后一次为准。
pub trait GapNotifier: Send + Sync {
    /// # Summary
    /// 登记一个可能的断档。
    ///
    /// # Arguments
    /// * `symbol`: 证券代码。
    /// * `last_known`: 实时流恢复后第一条数据的时间，即断档终点。
    fn notify_gap(&self, symbol: &str, last_known: DateTime<Utc>);
}

/// # Summary
/// 补洞执行端口：拉取并持久化一个区间内的全部 K 线。
///
/// # Invariants
/// - 对同一区间重复执行不得破坏已有数据（由存储层幂等写入保证）。
#[async_trait]
pub trait BackfillExecutor: Send + Sync {
    /// # Summary
    /// 拉取 `[from, to)` 区间的数据并写入存储。
    ///
    /// # Logic
    /// 1. `to` 缺省时取当前时间。
    /// 2. 调用远端数据源拉取。
    /// 3. 写入时序存储。
    ///
    /// # Arguments
    /// * `stock`: 目标证券。
    /// * `from`: 开始时间（包含）。
    /// * `to`: 结束时间（不包含），`None` 表示截至当前。
    ///
    /// # Returns
    /// 成功返回写入的 K 线数量。
    async fn fetch_and_persist(
        &self,
        stock: &Stock,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize, BackfillError>;
}
