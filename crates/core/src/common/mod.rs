use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod time;

/// # Summary
/// 证券标的实体，代表系统关注的特定股票或资产。
///
/// # Invariants
/// - `symbol` 必须是合法的交易代码（大写，如 AAPL）。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Stock {
    // 股票代码 (例如: AAPL, MSFT)
    pub symbol: String,
    // 交易所代码 (可选，例如: NASDAQ)
    pub exchange: Option<String>,
}

impl Stock {
    /// 以代码构造一个无交易所信息的标的。
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: None,
        }
    }

    /// # Summary
    /// 生成该标的在时序库中的规范桶键，例如 `AAPL/1Min/OHLCV`。
    ///
    /// # Arguments
    /// * `timeframe`: K 线周期。
    ///
    /// # Returns
    /// 规范桶键字符串，用于日志与存储定位。
    pub fn bucket_key(&self, timeframe: TimeFrame) -> String {
        format!("{}/{}/OHLCV", self.symbol, timeframe.bucket_name())
    }
}

/// # Summary
/// 交易时间周期枚举，定义 K 线的时间跨度。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TimeFrame {
    // 1分钟
    Minute1,
    // 5分钟
    Minute5,
    // 1小时
    Hour1,
    // 1日
    Day1,
}

impl TimeFrame {
    /// # Summary
    /// 单个周期的时长。
    ///
    /// # Logic
    /// 用于补洞时的“一周期安全边距”以及实时流的断档判断。
    pub fn duration(&self) -> chrono::Duration {
        match self {
            TimeFrame::Minute1 => chrono::Duration::minutes(1),
            TimeFrame::Minute5 => chrono::Duration::minutes(5),
            TimeFrame::Hour1 => chrono::Duration::hours(1),
            TimeFrame::Day1 => chrono::Duration::days(1),
        }
    }

    /// 时序库桶键中使用的周期名称。
    pub fn bucket_name(&self) -> &'static str {
        match self {
            TimeFrame::Minute1 => "1Min",
            TimeFrame::Minute5 => "5Min",
            TimeFrame::Hour1 => "1H",
            TimeFrame::Day1 => "1D",
        }
    }
}

impl FromStr for TimeFrame {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1m" | "1min" | "minute1" => Ok(TimeFrame::Minute1),
            "5m" | "5min" | "minute5" => Ok(TimeFrame::Minute5),
            "1h" | "hour1" => Ok(TimeFrame::Hour1),
            "1d" | "day1" => Ok(TimeFrame::Day1),
            _ => Err(format!("Unknown TimeFrame: {}", s)),
        }
    }
}

impl std::fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeFrame::Minute1 => write!(f, "1m"),
            TimeFrame::Minute5 => write!(f, "5m"),
            TimeFrame::Hour1 => write!(f, "1h"),
            TimeFrame::Day1 => write!(f, "1d"),
        }
    }
}

/// # Summary
/// 实时流订阅的数据类型。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    // 分钟聚合 K 线
    Bars,
    // 买卖报价
    Quotes,
    // 逐笔成交
    Trades,
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bars" => Ok(DataType::Bars),
            "quotes" => Ok(DataType::Quotes),
            "trades" => Ok(DataType::Trades),
            _ => Err(format!("Unknown DataType: {}", s)),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Bars => write!(f, "bars"),
            DataType::Quotes => write!(f, "quotes"),
            DataType::Trades => write!(f, "trades"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key() {
        let stock = Stock::new("AAPL");
        assert_eq!(stock.bucket_key(TimeFrame::Minute1), "AAPL/1Min/OHLCV");
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("Bars".parse::<DataType>(), Ok(DataType::Bars));
        assert_eq!(" trades ".parse::<DataType>(), Ok(DataType::Trades));
        assert!("candles".parse::<DataType>().is_err());
    }

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(TimeFrame::Minute1.duration(), chrono::Duration::minutes(1));
        assert_eq!("1m".parse::<TimeFrame>(), Ok(TimeFrame::Minute1));
    }
}
