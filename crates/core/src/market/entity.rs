use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// # Summary
/// 单根 K 线数据实体，记录特定时段内的行情波动。
///
/// # Invariants
/// - `high` 必须大于或等于 `low`, `open`, `close`。
/// - `time` 为该周期的开始时间。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    // K 线开始时间
    pub time: DateTime<Utc>,
    // 开盘价
    pub open: f64,
    // 最高价
    pub high: f64,
    // 最低价
    pub low: f64,
    // 收盘价
    pub close: f64,
    // 成交量
    pub volume: f64,
    // 成交量加权均价 (数据源提供时)
    pub vwap: Option<f64>,
    // 周期内成交笔数，仅在开启 add_bar_tick_count 时落库
    pub tick_count: Option<u64>,
}

/// 买卖一档报价。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub time: DateTime<Utc>,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
}

/// 逐笔成交。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
}

/// # Summary
/// 实时流产出的事件。
///
/// # Invariants
/// - `Reconnected` 只在连接中断并重新建立之后出现，用于让下游重新布防断档检测。
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Bar { symbol: String, candle: Candle },
    Quote { symbol: String, quote: Quote },
    Trade { symbol: String, trade: Trade },
    Reconnected,
}

impl StreamEvent {
    /// 事件所属的证券代码，`Reconnected` 没有归属。
    pub fn symbol(&self) -> Option<&str> {
        match self {
            StreamEvent::Bar { symbol, .. }
            | StreamEvent::Quote { symbol, .. }
            | StreamEvent::Trade { symbol, .. } => Some(symbol),
            StreamEvent::Reconnected => None,
        }
    }
}
