use crate::common::Stock;
use chrono::{DateTime, Utc};

/// # Summary
/// 单个证券在补洞注册表中的状态。
///
/// # Invariants
/// - `Clean` 表示注册表中不存在该证券。
/// - `InFlight` 期间该证券不会被再次认领，即使期间又收到了新的断档信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapMarker {
    // 没有已知断档
    Clean,
    // 存在断档，终点为最后已知连续时间点，尚未被认领
    Pending(DateTime<Utc>),
    // 已被某个补洞任务认领
    InFlight,
}

/// # Summary
/// 一次补洞任务的解析结果，生命周期仅限于单个任务。
///
/// # Invariants
/// - `to` 为 `None` 时表示“截至当前”。
/// - 若 `to` 存在，必须晚于 `from`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRange {
    pub stock: Stock,
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
}
