use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gapfill_core::backfill::error::BackfillError;
use gapfill_core::backfill::port::BackfillExecutor;
use gapfill_core::common::time::TimeProvider;
use gapfill_core::common::{Stock, TimeFrame};
use gapfill_core::market::port::HistoryProvider;
use gapfill_core::store::port::MarketStore;
use std::sync::Arc;
use tracing::debug;

/// # Summary
/// 基于历史行情接口的 K 线补洞执行器。
///
/// # Invariants
/// - 写入使用存储层的幂等覆盖语义，重复补同一区间不会产生重复数据。
pub struct BarBackfiller {
    provider: Arc<dyn HistoryProvider>,
    store: Arc<dyn MarketStore>,
    clock: Arc<dyn TimeProvider>,
    timeframe: TimeFrame,
    keep_tick_count: bool,
}

impl BarBackfiller {
    pub fn new(
        provider: Arc<dyn HistoryProvider>,
        store: Arc<dyn MarketStore>,
        clock: Arc<dyn TimeProvider>,
        timeframe: TimeFrame,
        keep_tick_count: bool,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
            timeframe,
            keep_tick_count,
        }
    }
}

#[async_trait]
impl BackfillExecutor for BarBackfiller {
    /// # Summary
    /// 拉取并写入 `[from, to)` 区间的 K 线。
    ///
    /// # Logic
    /// 1. `to` 缺省时取时钟当前时间。
    /// 2. 空区间直接返回 0。
    /// 3. 拉取、按配置去掉成交笔数后写入存储。
    async fn fetch_and_persist(
        &self,
        stock: &Stock,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize, BackfillError> {
        let to = to.unwrap_or_else(|| self.clock.now());
        if from >= to {
            return Ok(0);
        }

        let mut candles = self
            .provider
            .fetch_candles(stock, self.timeframe, from, to)
            .await?;
        if !self.keep_tick_count {
            for candle in &mut candles {
                candle.tick_count = None;
            }
        }

        self.store
            .save_candles(stock, self.timeframe, &candles)
            .await
            .map_err(|e| BackfillError::Fetch(format!("persist failed: {}", e)))?;

        debug!(
            bucket = %stock.bucket_key(self.timeframe),
            %from,
            %to,
            bars = candles.len(),
            "bars written"
        );
        Ok(candles.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use gapfill_core::common::time::FakeClockProvider;
    use gapfill_core::test_utils::{MemMarketStore, StaticHistoryProvider, flat_candle};

    fn t(m: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 4, 14, 30, 0).unwrap() + Duration::minutes(m)
    }

    fn seeded() -> Arc<StaticHistoryProvider> {
        let provider = Arc::new(StaticHistoryProvider::new());
        provider.seed(
            "AAPL",
            (0..10)
                .map(|m| {
                    let mut c = flat_candle(t(m), 100.0);
                    c.tick_count = Some(3);
                    c
                })
                .collect(),
        );
        provider
    }

    #[tokio::test]
    async fn test_open_end_uses_clock() {
        let provider = seeded();
        let store = Arc::new(MemMarketStore::new());
        let clock = Arc::new(FakeClockProvider::new(t(6)));
        let backfiller = BarBackfiller::new(
            provider.clone(),
            store.clone(),
            clock,
            TimeFrame::Minute1,
            false,
        );

        let stock = Stock::new("AAPL");
        let written = backfiller.fetch_and_persist(&stock, t(2), None).await.unwrap();
        assert_eq!(written, 4);
        assert_eq!(provider.calls(), vec![("AAPL".to_string(), t(2), t(6))]);

        let saved = store
            .load_candles(&stock, TimeFrame::Minute1, t(0), t(10))
            .await
            .unwrap();
        assert_eq!(saved.len(), 4);
        assert!(saved.iter().all(|c| c.tick_count.is_none()));

        // 重复补同一区间不会产生重复数据
        backfiller.fetch_and_persist(&stock, t(2), None).await.unwrap();
        assert_eq!(store.candle_count("AAPL", TimeFrame::Minute1), 4);
    }

    #[tokio::test]
    async fn test_explicit_end_and_tick_count() {
        let store = Arc::new(MemMarketStore::new());
        let backfiller = BarBackfiller::new(
            seeded(),
            store.clone(),
            Arc::new(FakeClockProvider::new(t(100))),
            TimeFrame::Minute1,
            true,
        );

        let stock = Stock::new("AAPL");
        assert_eq!(backfiller.fetch_and_persist(&stock, t(0), Some(t(3))).await.unwrap(), 3);
        let saved = store
            .load_candles(&stock, TimeFrame::Minute1, t(0), t(3))
            .await
            .unwrap();
        assert!(saved.iter().all(|c| c.tick_count == Some(3)));

        // 空区间
        assert_eq!(backfiller.fetch_and_persist(&stock, t(5), Some(t(5))).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_maps_to_fetch_error() {
        let provider = seeded();
        provider.fail_requests(true);
        let backfiller = BarBackfiller::new(
            provider,
            Arc::new(MemMarketStore::new()),
            Arc::new(FakeClockProvider::new(t(6))),
            TimeFrame::Minute1,
            false,
        );

        let result = backfiller.fetch_and_persist(&Stock::new("AAPL"), t(0), None).await;
        assert!(matches!(result, Err(BackfillError::Fetch(_))));
    }
}
