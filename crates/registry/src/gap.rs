use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gapfill_core::backfill::entity::GapMarker;
use gapfill_core::backfill::port::GapNotifier;
use tracing::debug;

/// 注册表中单个证券的条目。
#[derive(Debug, Default)]
struct GapEntry {
    // 尚未被认领的断档终点
    pending: Option<DateTime<Utc>>,
    // 是否已被某个补洞任务认领
    in_flight: bool,
}

/// # Summary
/// 基于 DashMap 的断档注册表，Key 为证券代码。
///
/// # Invariants
/// - 认领（pending -> in_flight）在条目所在分片的写锁内一次完成，不存在先读后写的窗口。
/// - 同一证券在 `release` 之前不会被再次认领，因此任意时刻至多一个补洞任务。
/// - 认领期间到达的新断档信号保存在 `pending` 中，`release` 后可在下一轮被认领，不会丢失。
#[derive(Debug, Default)]
pub struct GapRegistry {
    entries: DashMap<String, GapEntry>,
}

impl GapRegistry {
    /// 创建一个空注册表。
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// # Summary
    /// 登记或覆盖一个待补洞标记。
    ///
    /// # Logic
    /// 1. 获取（或创建）证券条目。
    /// 2. 以最后一次写入为准覆盖 `pending`，不改变认领状态。
    ///
    /// # Arguments
    /// * `symbol`: 证券代码。
    /// * `last_known`: 断档终点。
    pub fn mark_pending(&self, symbol: &str, last_known: DateTime<Utc>) {
        let mut entry = self.entries.entry(symbol.to_string()).or_default();
        entry.pending = Some(last_known);
        debug!(symbol, %last_known, in_flight = entry.in_flight, "gap marked pending");
    }

    /// # Summary
    /// 扫描注册表并认领至多 `limit` 个待补洞证券。
    ///
    /// # Logic
    /// 1. 逐条遍历，跳过已认领或没有待补洞标记的条目。
    /// 2. 在分片写锁内取走 `pending` 并置 `in_flight`。
    /// 3. 认领数量达到 `limit` 后立即停止遍历。
    ///
    /// # Arguments
    /// * `limit`: 本次扫描的认领上限。
    ///
    /// # Returns
    /// 被认领的 `(symbol, last_known)` 列表，顺序为注册表迭代顺序。
    pub fn claim_all(&self, limit: usize) -> Vec<(String, DateTime<Utc>)> {
        let mut claimed = Vec::new();
        if limit == 0 {
            return claimed;
        }

        for mut entry in self.entries.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if entry.in_flight {
                continue;
            }
            if let Some(last_known) = entry.pending.take() {
                entry.in_flight = true;
                claimed.push((entry.key().clone(), last_known));
            }
        }

        claimed
    }

    /// # Summary
    /// 结束一次认领。
    ///
    /// # Logic
    /// 1. 清除 `in_flight`。
    /// 2. 若期间没有新的断档信号，移除条目使其回到 Clean。
    pub fn release(&self, symbol: &str) {
        if let Some(mut entry) = self.entries.get_mut(symbol) {
            entry.in_flight = false;
        }
        self.entries
            .remove_if(symbol, |_, e| !e.in_flight && e.pending.is_none());
    }

    /// # Summary
    /// 失败后重新入队。
    ///
    /// # Logic
    /// 仅在没有更新的断档信号时写回原始终点，不覆盖更新鲜的标记。
    pub fn requeue(&self, symbol: &str, last_known: DateTime<Utc>) {
        let mut entry = self.entries.entry(symbol.to_string()).or_default();
        entry.pending.get_or_insert(last_known);
    }

    /// 查询证券当前的断档状态。
    pub fn marker(&self, symbol: &str) -> GapMarker {
        match self.entries.get(symbol) {
            Some(e) if e.in_flight => GapMarker::InFlight,
            Some(e) => match e.pending {
                Some(ts) => GapMarker::Pending(ts),
                None => GapMarker::Clean,
            },
            None => GapMarker::Clean,
        }
    }

    /// 可被认领的证券数量。
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.in_flight && e.pending.is_some())
            .count()
    }

    /// 注册表中的条目数量（含已认领）。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GapNotifier for GapRegistry {
    fn notify_gap(&self, symbol: &str, last_known: DateTime<Utc>) {
        self.mark_pending(symbol, last_known);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 4, 9, min, 0).unwrap()
    }

    #[test]
    fn test_claim_yields_once() {
        let registry = GapRegistry::new();
        registry.mark_pending("AAPL", ts(30));

        let first = registry.claim_all(10);
        assert_eq!(first, vec![("AAPL".to_string(), ts(30))]);
        assert_eq!(registry.marker("AAPL"), GapMarker::InFlight);

        let second = registry.claim_all(10);
        assert!(second.is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let registry = GapRegistry::new();
        registry.mark_pending("AAPL", ts(30));
        registry.mark_pending("AAPL", ts(35));
        assert_eq!(registry.marker("AAPL"), GapMarker::Pending(ts(35)));
        assert_eq!(registry.claim_all(1), vec![("AAPL".to_string(), ts(35))]);
    }

    #[test]
    fn test_claim_respects_limit() {
        let registry = GapRegistry::new();
        for i in 0..10 {
            registry.mark_pending(&format!("SYM{}", i), ts(i));
        }

        let batch = registry.claim_all(4);
        assert_eq!(batch.len(), 4);
        assert_eq!(registry.pending_count(), 6);
        assert!(registry.claim_all(0).is_empty());

        let symbols: HashSet<_> = batch.iter().map(|(s, _)| s.clone()).collect();
        assert_eq!(symbols.len(), 4);
    }

    #[test]
    fn test_mark_during_flight_is_not_lost() {
        let registry = GapRegistry::new();
        registry.mark_pending("AAPL", ts(30));
        assert_eq!(registry.claim_all(10).len(), 1);

        // 任务运行期间收到新的断档信号
        registry.mark_pending("AAPL", ts(40));
        assert_eq!(registry.marker("AAPL"), GapMarker::InFlight);
        assert!(registry.claim_all(10).is_empty());

        registry.release("AAPL");
        assert_eq!(registry.marker("AAPL"), GapMarker::Pending(ts(40)));
        assert_eq!(registry.claim_all(10), vec![("AAPL".to_string(), ts(40))]);
    }

    #[test]
    fn test_release_returns_to_clean() {
        let registry = GapRegistry::new();
        registry.mark_pending("AAPL", ts(30));
        registry.claim_all(10);
        registry.release("AAPL");
        assert_eq!(registry.marker("AAPL"), GapMarker::Clean);
        assert!(registry.is_empty());

        // 未登记的证券 release 无副作用
        registry.release("MSFT");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_requeue_keeps_fresher_marker() {
        let registry = GapRegistry::new();
        registry.mark_pending("AAPL", ts(30));
        registry.claim_all(10);
        registry.mark_pending("AAPL", ts(45));

        registry.requeue("AAPL", ts(30));
        registry.release("AAPL");
        assert_eq!(registry.marker("AAPL"), GapMarker::Pending(ts(45)));

        registry.claim_all(10);
        registry.requeue("AAPL", ts(45));
        registry.release("AAPL");
        assert_eq!(registry.marker("AAPL"), GapMarker::Pending(ts(45)));
    }

    #[test]
    fn test_notifier_port() {
        let registry = GapRegistry::new();
        let notifier: &dyn GapNotifier = &registry;
        notifier.notify_gap("TSLA", ts(1));
        assert_eq!(registry.marker("TSLA"), GapMarker::Pending(ts(1)));
    }

    #[test]
    fn test_concurrent_marks_are_claimed_exactly_once() {
        let registry = Arc::new(GapRegistry::new());
        let total = 500;

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..total {
                    registry.mark_pending(&format!("SYM{}", i), ts(0));
                }
            })
        };

        let mut seen = HashSet::new();
        let mut rounds = 0;
        while seen.len() < total && rounds < 100_000 {
            for (symbol, _) in registry.claim_all(7) {
                assert!(seen.insert(symbol.clone()), "claimed twice: {}", symbol);
                registry.release(&symbol);
            }
            rounds += 1;
            std::thread::yield_now();
        }

        writer.join().unwrap();
        for (symbol, _) in registry.claim_all(usize::MAX) {
            assert!(seen.insert(symbol.clone()), "claimed twice: {}", symbol);
            registry.release(&symbol);
        }
        assert_eq!(seen.len(), total);
        assert!(registry.is_empty());
    }
}
