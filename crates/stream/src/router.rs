use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use gapfill_core::backfill::port::GapNotifier;
use gapfill_core::common::{Stock, TimeFrame};
use gapfill_core::market::entity::{Candle, StreamEvent};
use gapfill_core::market::port::MessageStream;
use gapfill_core::store::port::MarketStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// # Summary
/// 路由器参数。
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// 证券白名单，`None` 表示全部接收
    pub allowlist: Option<HashSet<String>>,
    /// 是否保留 K 线的成交笔数
    pub keep_tick_count: bool,
    /// 实时 K 线周期
    pub timeframe: TimeFrame,
    /// 相邻两根 K 线之间允许超出一个周期的时间
    pub tolerance: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            allowlist: None,
            keep_tick_count: false,
            timeframe: TimeFrame::Minute1,
            tolerance: Duration::seconds(10),
        }
    }
}

/// 路由统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub bars: usize,
    pub quotes: usize,
    pub trades: usize,
    pub filtered: usize,
    pub gaps: usize,
    pub reconnects: usize,
}

/// # Summary
/// 实时流路由器，将推送事件写入存储并向注册表报告断档。
///
/// # Invariants
/// - 每个证券只记录最近一根 K 线的时间，乱序到达的旧 K 线不会使其倒退。
/// - 启动或重连后每个证券的第一根 K 线都视为断档终点。
/// - 写入失败只记录日志，不中断实时流。
pub struct StreamRouter {
    store: Arc<dyn MarketStore>,
    notifier: Arc<dyn GapNotifier>,
    settings: RouterSettings,
    // Key 为证券代码，Value 为最近一根 K 线的开始时间
    last_bar: DashMap<String, DateTime<Utc>>,
}

impl StreamRouter {
    pub fn new(
        store: Arc<dyn MarketStore>,
        notifier: Arc<dyn GapNotifier>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            store,
            notifier,
            settings,
            last_bar: DashMap::new(),
        }
    }

    fn accepts(&self, symbol: &str) -> bool {
        self.settings
            .allowlist
            .as_ref()
            .is_none_or(|allow| allow.contains(symbol))
    }

    /// # Summary
    /// 记录一根 K 线并判断是否出现断档。
    ///
    /// # Logic
    /// 1. 该证券没有历史记录时视为断档。
    /// 2. 与上一根的间隔超过 `周期 + 容忍时间` 时视为断档。
    /// 3. 只有更新的时间才会写回。
    fn observe_bar(&self, symbol: &str, time: DateTime<Utc>) -> bool {
        let threshold = self.settings.timeframe.duration() + self.settings.tolerance;
        match self.last_bar.entry(symbol.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(time);
                true
            }
            Entry::Occupied(mut slot) => {
                let previous = *slot.get();
                if time <= previous {
                    return false;
                }
                slot.insert(time);
                time - previous > threshold
            }
        }
    }

    /// # Summary
    /// 处理单个推送事件。
    ///
    /// # Logic
    /// 1. `Reconnected` 清空最近 K 线表，所有证券重新进入待检测状态。
    /// 2. 白名单之外的证券直接丢弃。
    /// 3. K 线先落库再检测断档，报价与成交直接落库。
    pub async fn handle(&self, event: StreamEvent, stats: &mut RouterStats) {
        if let StreamEvent::Reconnected = event {
            info!(symbols = self.last_bar.len(), "stream reconnected, re-arming gap detection");
            self.last_bar.clear();
            stats.reconnects += 1;
            return;
        }

        let Some(symbol) = event.symbol() else {
            return;
        };
        if !self.accepts(symbol) {
            stats.filtered += 1;
            return;
        }
        let stock = Stock::new(symbol);

        match event {
            StreamEvent::Bar { symbol, candle } => {
                let time = candle.time;
                let candle = self.prepare(candle);
                if let Err(e) = self
                    .store
                    .save_candles(&stock, self.settings.timeframe, &[candle])
                    .await
                {
                    error!(bucket = %stock.bucket_key(self.settings.timeframe), error = %e, "failed to persist bar");
                }
                stats.bars += 1;

                if self.observe_bar(&symbol, time) {
                    debug!(%symbol, %time, "gap detected on live stream");
                    self.notifier.notify_gap(&symbol, time);
                    stats.gaps += 1;
                }
            }
            StreamEvent::Quote { quote, .. } => {
                if let Err(e) = self.store.save_quotes(&stock, &[quote]).await {
                    error!(symbol = %stock.symbol, error = %e, "failed to persist quote");
                }
                stats.quotes += 1;
            }
            StreamEvent::Trade { trade, .. } => {
                if let Err(e) = self.store.save_trades(&stock, &[trade]).await {
                    error!(symbol = %stock.symbol, error = %e, "failed to persist trade");
                }
                stats.trades += 1;
            }
            StreamEvent::Reconnected => {}
        }
    }

    fn prepare(&self, mut candle: Candle) -> Candle {
        if !self.settings.keep_tick_count {
            candle.tick_count = None;
        }
        candle
    }

    /// # Summary
    /// 消费实时流直到流结束或收到停机信号。
    ///
    /// # Returns
    /// 本次运行的路由统计。
    pub async fn run(
        &self,
        mut stream: MessageStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> RouterStats {
        let mut stats = RouterStats::default();
        info!("stream router started");

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(event) => self.handle(event, &mut stats).await,
                    None => {
                        info!("live stream ended");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("stream router stopping");
                        break;
                    }
                }
            }
        }

        info!(?stats, "stream router stopped");
        stats
    }
}
