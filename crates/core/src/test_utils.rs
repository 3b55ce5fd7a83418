//! 供各 crate 测试使用的内存端口实现。

use crate::common::{Stock, TimeFrame};
use crate::market::entity::{Candle, Quote, Trade};
use crate::market::error::MarketError;
use crate::market::port::HistoryProvider;
use crate::store::error::StoreError;
use crate::store::port::MarketStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// 构造一根价格恒定的测试 K 线。
pub fn flat_candle(time: DateTime<Utc>, price: f64) -> Candle {
    Candle {
        time,
        open: price,
        high: price,
        low: price,
        close: price,
        volume: 100.0,
        vwap: Some(price),
        tick_count: None,
    }
}

/// # Summary
/// 基于 DashMap 的内存时序存储。
///
/// # Invariants
/// - K 线按时间戳去重，重复写入覆盖旧值。
#[derive(Default)]
pub struct MemMarketStore {
    candles: DashMap<(String, TimeFrame), BTreeMap<DateTime<Utc>, Candle>>,
    quotes: DashMap<String, Vec<Quote>>,
    trades: DashMap<String, Vec<Trade>>,
    fail_queries: AtomicBool,
}

impl MemMarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让后续 `latest_candle_time` 调用全部失败，用于模拟存储故障。
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// 指定证券与周期下的 K 线数量。
    pub fn candle_count(&self, symbol: &str, timeframe: TimeFrame) -> usize {
        self.candles
            .get(&(symbol.to_string(), timeframe))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn quote_count(&self, symbol: &str) -> usize {
        self.quotes.get(symbol).map(|v| v.len()).unwrap_or(0)
    }

    pub fn trade_count(&self, symbol: &str) -> usize {
        self.trades.get(symbol).map(|v| v.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MarketStore for MemMarketStore {
    async fn save_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        candles: &[Candle],
    ) -> Result<(), StoreError> {
        let mut entry = self
            .candles
            .entry((stock.symbol.clone(), timeframe))
            .or_default();
        for candle in candles {
            entry.insert(candle.time, candle.clone());
        }
        Ok(())
    }

    async fn load_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        // 与 SQLite 实现一致：起点晚于终点时返回空集
        if start > end {
            return Ok(vec![]);
        }
        Ok(self
            .candles
            .get(&(stock.symbol.clone(), timeframe))
            .map(|m| m.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn latest_candle_time(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        at_or_before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected query failure".into()));
        }
        Ok(self
            .candles
            .get(&(stock.symbol.clone(), timeframe))
            .and_then(|m| m.range(..=at_or_before).next_back().map(|(t, _)| *t)))
    }

    async fn save_quotes(&self, stock: &Stock, quotes: &[Quote]) -> Result<(), StoreError> {
        self.quotes
            .entry(stock.symbol.clone())
            .or_default()
            .extend_from_slice(quotes);
        Ok(())
    }

    async fn save_trades(&self, stock: &Stock, trades: &[Trade]) -> Result<(), StoreError> {
        self.trades
            .entry(stock.symbol.clone())
            .or_default()
            .extend_from_slice(trades);
        Ok(())
    }
}

/// # Summary
/// 预置数据的历史行情提供者，记录每一次请求区间。
#[derive(Default)]
pub struct StaticHistoryProvider {
    candles: DashMap<String, Vec<Candle>>,
    calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    fail: AtomicBool,
}

impl StaticHistoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为指定证券预置历史 K 线。
    pub fn seed(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.insert(symbol.to_string(), candles);
    }

    /// 让后续请求全部返回网络错误。
    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// 已收到的请求 `(symbol, start, end)` 列表。
    pub fn calls(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HistoryProvider for StaticHistoryProvider {
    async fn fetch_candles(
        &self,
        stock: &Stock,
        _timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((stock.symbol.clone(), start, end));

        if self.fail.load(Ordering::SeqCst) {
            return Err(MarketError::Network("injected request failure".into()));
        }

        Ok(self
            .candles
            .get(&stock.symbol)
            .map(|v| {
                v.iter()
                    .filter(|c| c.time >= start && c.time < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
