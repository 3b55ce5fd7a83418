use crate::resolver::RangeResolver;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gapfill_core::backfill::error::BackfillError;
use gapfill_core::backfill::port::BackfillExecutor;
use gapfill_core::common::{Stock, TimeFrame};
use gapfill_registry::GapRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// # Summary
/// 调度器参数。
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// 两次扫描之间的间隔
    pub interval: Duration,
    /// 单次扫描的并发上限
    pub ceiling: usize,
    /// 连续失败后自动重新入队的次数，0 表示失败即放弃
    pub max_requeue: u32,
    /// 补洞的 K 线周期
    pub timeframe: TimeFrame,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            ceiling: 10,
            max_requeue: 0,
            timeframe: TimeFrame::Minute1,
        }
    }
}

/// 单次扫描的结果统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub filled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub requeued: usize,
}

/// 单个补洞任务的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Filled(usize),
    Skipped,
    Failed { requeued: bool },
}

/// # Summary
/// 单个补洞任务的执行上下文，每个任务持有一份克隆。
#[derive(Clone)]
struct Worker {
    registry: Arc<GapRegistry>,
    resolver: Arc<RangeResolver>,
    executor: Arc<dyn BackfillExecutor>,
    // 每个证券连续失败的次数
    failures: Arc<DashMap<String, u32>>,
    max_requeue: u32,
    timeframe: TimeFrame,
}

impl Worker {
    /// # Summary
    /// 执行一个已认领证券的补洞，并在结束时释放认领。
    ///
    /// # Logic
    /// 1. 解析补洞区间，无历史记录时跳过。
    /// 2. 调用执行器拉取并写入。
    /// 3. 失败时按重新入队预算决定是否写回待补洞标记。
    /// 4. 无论结果如何都释放认领。
    async fn backfill(self, symbol: String, last_known: DateTime<Utc>) -> TaskOutcome {
        let bucket = Stock::new(symbol.as_str()).bucket_key(self.timeframe);

        let outcome = match self.attempt(&symbol, last_known).await {
            Ok(Some(bars)) => {
                self.failures.remove(&symbol);
                info!(%bucket, bars, "backfill completed");
                TaskOutcome::Filled(bars)
            }
            Ok(None) => {
                self.failures.remove(&symbol);
                debug!(%bucket, "no history on record, nothing to backfill");
                TaskOutcome::Skipped
            }
            Err(e) => {
                error!(%bucket, %last_known, error = %e, "backfill failed");
                let requeued = self.requeue(&symbol, last_known);
                TaskOutcome::Failed { requeued }
            }
        };

        self.registry.release(&symbol);
        outcome
    }

    async fn attempt(
        &self,
        symbol: &str,
        last_known: DateTime<Utc>,
    ) -> Result<Option<usize>, BackfillError> {
        let Some(range) = self.resolver.resolve_range(symbol, last_known).await? else {
            return Ok(None);
        };
        let bars = self
            .executor
            .fetch_and_persist(&range.stock, range.from, range.to)
            .await?;
        Ok(Some(bars))
    }

    /// 在预算内重新登记失败的证券，预算耗尽后清零计数并放弃。
    fn requeue(&self, symbol: &str, last_known: DateTime<Utc>) -> bool {
        if self.max_requeue == 0 {
            return false;
        }

        let attempts = {
            let mut count = self.failures.entry(symbol.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        if attempts > self.max_requeue {
            self.failures.remove(symbol);
            warn!(symbol, attempts, "requeue budget exhausted, giving up");
            return false;
        }

        self.registry.requeue(symbol, last_known);
        debug!(symbol, attempts, "requeued after failure");
        true
    }
}

/// # Summary
/// 有界并发补洞调度器。
///
/// # Invariants
/// - 单次扫描启动的任务数不超过 `ceiling`，上限在派发前由认领数量保证。
/// - 扫描之间没有重叠：下一次扫描在本次全部任务结束后才会开始。
/// - 单个证券失败不会中断本次扫描。
pub struct BoundedBackfillScheduler {
    worker: Worker,
    interval: Duration,
    ceiling: usize,
}

impl BoundedBackfillScheduler {
    /// # Arguments
    /// * `registry`: 与实时路由器共享的断档注册表。
    /// * `resolver`: 区间解析器。
    /// * `executor`: 补洞执行器。
    /// * `settings`: 调度参数。
    pub fn new(
        registry: Arc<GapRegistry>,
        resolver: Arc<RangeResolver>,
        executor: Arc<dyn BackfillExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            worker: Worker {
                registry,
                resolver,
                executor,
                failures: Arc::new(DashMap::new()),
                max_requeue: settings.max_requeue,
                timeframe: settings.timeframe,
            },
            interval: settings.interval.max(Duration::from_millis(1)),
            ceiling: settings.ceiling.max(1),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// # Summary
    /// 执行一次扫描。
    ///
    /// # Logic
    /// 1. 从注册表认领至多 `ceiling` 个证券。
    /// 2. 每个证券派发一个任务到 `JoinSet`。
    /// 3. 等待全部任务结束，不因单个失败提前返回。
    /// 4. 任务异常退出时由调度器代为释放认领。
    ///
    /// # Returns
    /// 本次扫描的统计。
    pub async fn run_cycle(&self) -> CycleReport {
        let claims = self.worker.registry.claim_all(self.ceiling);
        let mut report = CycleReport {
            claimed: claims.len(),
            ..CycleReport::default()
        };
        if claims.is_empty() {
            return report;
        }

        info!(
            claimed = report.claimed,
            ceiling = self.ceiling,
            waiting = self.worker.registry.pending_count(),
            "backfill cycle started"
        );

        let mut tasks = JoinSet::new();
        let mut owners = HashMap::with_capacity(claims.len());
        for (symbol, last_known) in claims {
            let worker = self.worker.clone();
            let handle = tasks.spawn(worker.backfill(symbol.clone(), last_known));
            owners.insert(handle.id(), symbol);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, TaskOutcome::Filled(_))) => report.filled += 1,
                Ok((_, TaskOutcome::Skipped)) => report.skipped += 1,
                Ok((_, TaskOutcome::Failed { requeued })) => {
                    report.failed += 1;
                    if requeued {
                        report.requeued += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    if let Some(symbol) = owners.get(&e.id()) {
                        error!(%symbol, error = %e, "backfill task aborted");
                        self.worker.registry.release(symbol);
                    }
                }
            }
        }

        info!(
            claimed = report.claimed,
            filled = report.filled,
            skipped = report.skipped,
            failed = report.failed,
            requeued = report.requeued,
            "backfill cycle finished"
        );
        report
    }

    /// # Summary
    /// 按固定间隔循环扫描，直到收到停机信号。
    ///
    /// # Logic
    /// 1. 第一次扫描在启动一个间隔之后；错过的节拍顺延而不是补跑。
    /// 2. 收到停机信号后不再开始新的扫描；正在进行的扫描会等待全部任务结束。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.interval, ceiling = self.ceiling, "backfill scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("backfill scheduler stopped");
    }
}
