use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use gapfill_core::backfill::entity::ResolvedRange;
use gapfill_core::backfill::error::BackfillError;
use gapfill_core::common::{Stock, TimeFrame};
use gapfill_core::store::port::MarketStore;
use std::sync::Arc;
use tracing::debug;

/// 回退起始时间支持的格式，按顺序尝试，24 小时制，按 UTC 解释。
const DATETIME_LAYOUTS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];
const DATE_LAYOUT: &str = "%Y-%m-%d";

/// # Summary
/// 解析回退起始时间。
///
/// # Logic
/// 1. 依次尝试带时间的格式，第一个成功的结果即为答案。
/// 2. 最后尝试纯日期格式，取当日零点。
///
/// # Returns
/// 全部格式失败时返回 `BackfillError::Configuration`。
pub fn parse_query_start(raw: &str) -> Result<DateTime<Utc>, BackfillError> {
    let raw = raw.trim();

    for layout in DATETIME_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Ok(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, DATE_LAYOUT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            BackfillError::Configuration(format!("unrecognized query_start: {:?}", raw))
        })
}

/// # Summary
/// 补洞区间解析器，决定一次补洞从哪里开始。
///
/// # Invariants
/// - 配置了回退起始时间时不查询存储。
/// - 未配置时查询 `end - 一个周期` 及之前的最后一根 K 线，避免重复读取触发断档的那一根。
/// - 存储中没有任何记录时视为“无需补洞”。
pub struct RangeResolver {
    store: Arc<dyn MarketStore>,
    timeframe: TimeFrame,
    fallback: Option<String>,
}

impl RangeResolver {
    /// # Arguments
    /// * `store`: 时序存储。
    /// * `timeframe`: 补洞的 K 线周期。
    /// * `fallback`: 回退起始时间原始字符串。
    pub fn new(store: Arc<dyn MarketStore>, timeframe: TimeFrame, fallback: Option<String>) -> Self {
        Self {
            store,
            timeframe,
            fallback,
        }
    }

    /// # Summary
    /// 计算补洞起点。
    ///
    /// # Arguments
    /// * `symbol`: 证券代码。
    /// * `end`: 断档终点。
    ///
    /// # Returns
    /// * `Ok(Some(from))`: 需要从 `from` 开始补洞。
    /// * `Ok(None)`: 没有历史记录，无需补洞。
    /// * `Err`: 回退时间无法解析，或存储查询失败。
    pub async fn resolve(
        &self,
        symbol: &str,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackfillError> {
        if let Some(raw) = &self.fallback {
            return parse_query_start(raw).map(Some);
        }

        let stock = Stock::new(symbol);
        let at_or_before = end - self.timeframe.duration();
        let last = self
            .store
            .latest_candle_time(&stock, self.timeframe, at_or_before)
            .await?;

        debug!(
            bucket = %stock.bucket_key(self.timeframe),
            %at_or_before,
            last = ?last,
            "resolved backfill start"
        );
        Ok(last)
    }

    /// 计算完整的补洞区间，终点留空表示截至当前。
    pub async fn resolve_range(
        &self,
        symbol: &str,
        end: DateTime<Utc>,
    ) -> Result<Option<ResolvedRange>, BackfillError> {
        Ok(self.resolve(symbol, end).await?.map(|from| ResolvedRange {
            stock: Stock::new(symbol),
            from,
            to: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use gapfill_core::test_utils::{MemMarketStore, flat_candle};

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_layouts() {
        assert_eq!(parse_query_start("2021-01-04").unwrap(), t(0, 0));
        assert_eq!(parse_query_start("2021-01-04 09:30").unwrap(), t(9, 30));
        assert_eq!(parse_query_start("2021-01-04T09:30").unwrap(), t(9, 30));
        assert_eq!(
            parse_query_start("2021-01-04 09:30:15").unwrap(),
            t(9, 30) + Duration::seconds(15)
        );
        assert_eq!(parse_query_start(" 2021-01-04T16:05:00 ").unwrap(), t(16, 5));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for raw in ["not-a-date", "", "2021-13-01", "04/01/2021", "2021-01-04 9:30pm"] {
            assert!(
                matches!(parse_query_start(raw), Err(BackfillError::Configuration(_))),
                "accepted {:?}",
                raw
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_from_store() {
        let store = Arc::new(MemMarketStore::new());
        let stock = Stock::new("AAPL");
        let end = t(14, 35);
        store
            .save_candles(
                &stock,
                TimeFrame::Minute1,
                &[flat_candle(t(14, 20), 1.0), flat_candle(t(14, 30), 2.0)],
            )
            .await
            .unwrap();

        let resolver = RangeResolver::new(store.clone(), TimeFrame::Minute1, None);
        assert_eq!(resolver.resolve("AAPL", end).await.unwrap(), Some(t(14, 30)));

        // 触发断档的那一根不参与计算
        store
            .save_candles(&stock, TimeFrame::Minute1, &[flat_candle(end, 3.0)])
            .await
            .unwrap();
        assert_eq!(resolver.resolve("AAPL", end).await.unwrap(), Some(t(14, 30)));

        let range = resolver.resolve_range("AAPL", end).await.unwrap().unwrap();
        assert_eq!(range.stock, stock);
        assert_eq!(range.from, t(14, 30));
        assert_eq!(range.to, None);
    }

    #[tokio::test]
    async fn test_resolve_empty_store_is_no_gap() {
        let resolver = RangeResolver::new(Arc::new(MemMarketStore::new()), TimeFrame::Minute1, None);
        assert_eq!(resolver.resolve("MSFT", t(14, 35)).await.unwrap(), None);
        assert_eq!(resolver.resolve_range("MSFT", t(14, 35)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_with_fallback_skips_store() {
        let store = Arc::new(MemMarketStore::new());
        store.fail_queries(true);

        let resolver = RangeResolver::new(
            store.clone(),
            TimeFrame::Minute1,
            Some("2021-01-04 09:30".into()),
        );
        assert_eq!(resolver.resolve("AAPL", t(14, 35)).await.unwrap(), Some(t(9, 30)));

        let broken = RangeResolver::new(store, TimeFrame::Minute1, Some("not-a-date".into()));
        assert!(matches!(
            broken.resolve("AAPL", t(14, 35)).await,
            Err(BackfillError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_transient() {
        let store = Arc::new(MemMarketStore::new());
        store.fail_queries(true);
        let resolver = RangeResolver::new(store, TimeFrame::Minute1, None);
        assert!(matches!(
            resolver.resolve("AAPL", t(14, 35)).await,
            Err(BackfillError::TransientStore(_))
        ));
    }
}
