use crate::common::DataType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;
use tracing::warn;

/// 默认 REST 数据源地址
pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";
/// 默认实时流地址
pub const DEFAULT_WS_SERVERS: &str = "wss://socket.polygon.io";

/// # Summary
/// 启动期配置错误，全部为致命错误。
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one valid data_type is required (bars, quotes, trades)")]
    NoDataType,
    #[error("unparseable query_start: {0}")]
    InvalidQueryStart(String),
    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// # Summary
/// 进程级抓取配置，启动时读取一次，之后只读。
///
/// # Invariants
/// - `data_types` 中至少存在一个合法取值，否则 `validate` 失败。
/// - `query_start` 为空字符串时等价于未配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    // 数据源 API Key，实时流与 REST 共用
    pub api_key: String,
    // REST 数据源地址（可被代理覆盖）
    pub base_url: String,
    // 实时流地址
    pub ws_servers: String,
    // 订阅的数据类型 (bars / quotes / trades)
    pub data_types: Vec<String>,
    // 关注的证券白名单，空或包含 "*" 表示全部
    pub symbols: Vec<String>,
    // 回退起始时间，例如 "2021-01-04 09:30"
    pub query_start: Option<String>,
    // K 线是否附带成交笔数
    pub add_bar_tick_count: bool,
    // 补洞调度周期（秒）
    pub backfill_interval_secs: u64,
    // 每个逻辑核允许的并发补洞任务数
    pub concurrency_per_cpu: usize,
    // 并发上限的硬性覆盖值
    pub max_concurrency: Option<usize>,
    // 失败后最多重新入队的次数，0 表示不重试
    pub max_requeue: u32,
    // 存储根目录
    pub data_dir: String,
    // 默认日志级别（RUST_LOG 优先）
    pub log_level: String,
    // 滚动日志目录，缺省只输出到标准输出
    pub log_dir: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_servers: DEFAULT_WS_SERVERS.to_string(),
            data_types: Vec::new(),
            symbols: Vec::new(),
            query_start: None,
            add_bar_tick_count: false,
            backfill_interval_secs: 30,
            concurrency_per_cpu: 10,
            max_concurrency: None,
            max_requeue: 0,
            data_dir: "data".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl FetcherConfig {
    /// # Summary
    /// 校验配置并返回归一化后的数据类型集合。
    ///
    /// # Logic
    /// 1. 逐个解析 `data_types`，未知取值记录警告后忽略。
    /// 2. 合法集合为空时返回 `ConfigError::NoDataType`。
    ///
    /// # Returns
    /// 去重排序后的数据类型集合。
    pub fn validate(&self) -> Result<BTreeSet<DataType>, ConfigError> {
        let mut types = BTreeSet::new();
        for raw in &self.data_types {
            match raw.parse::<DataType>() {
                Ok(dt) => {
                    types.insert(dt);
                }
                Err(e) => warn!("ignoring data_type entry: {}", e),
            }
        }

        if types.is_empty() {
            return Err(ConfigError::NoDataType);
        }
        Ok(types)
    }

    /// 回退起始时间，空白字符串视为未配置。
    pub fn query_start(&self) -> Option<&str> {
        self.query_start
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// REST 地址，空字符串回落到默认值。
    pub fn base_url(&self) -> &str {
        if self.base_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            self.base_url.trim_end_matches('/')
        }
    }

    /// 实时流地址，空字符串回落到默认值。
    pub fn ws_servers(&self) -> &str {
        if self.ws_servers.trim().is_empty() {
            DEFAULT_WS_SERVERS
        } else {
            self.ws_servers.trim_end_matches('/')
        }
    }

    /// # Summary
    /// 证券白名单。
    ///
    /// # Returns
    /// 未配置或包含通配符 `*` 时返回 `None`（不过滤），否则返回大写代码集合。
    pub fn symbol_allowlist(&self) -> Option<HashSet<String>> {
        if self.symbols.is_empty() || self.symbols.iter().any(|s| s.trim() == "*") {
            return None;
        }
        Some(
            self.symbols
                .iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    /// # Summary
    /// 计算补洞并发上限。
    ///
    /// # Logic
    /// 优先使用 `max_concurrency`，否则按 `cpus * concurrency_per_cpu` 计算，下限为 1。
    ///
    /// # Arguments
    /// * `cpus`: 可用逻辑核数量。
    pub fn concurrency_ceiling(&self, cpus: usize) -> usize {
        self.max_concurrency
            .unwrap_or_else(|| cpus.saturating_mul(self.concurrency_per_cpu))
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FetcherConfig::default();
        assert_eq!(config.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.ws_servers(), DEFAULT_WS_SERVERS);
        assert_eq!(config.backfill_interval_secs, 30);
        assert_eq!(config.concurrency_per_cpu, 10);
        assert_eq!(config.max_requeue, 0);
        assert!(config.query_start().is_none());
    }

    #[test]
    fn test_validate_requires_data_type() {
        let mut config = FetcherConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::NoDataType)));

        config.data_types = vec!["candles".into()];
        assert!(matches!(config.validate(), Err(ConfigError::NoDataType)));

        config.data_types = vec!["bars".into(), "candles".into(), "bars".into(), "trades".into()];
        let types = config.validate().unwrap();
        assert_eq!(types.len(), 2);
        assert!(types.contains(&DataType::Bars));
        assert!(types.contains(&DataType::Trades));
    }

    #[test]
    fn test_blank_query_start_is_absent() {
        let config = FetcherConfig {
            query_start: Some("   ".into()),
            ..Default::default()
        };
        assert!(config.query_start().is_none());
    }

    #[test]
    fn test_symbol_allowlist() {
        let mut config = FetcherConfig::default();
        assert!(config.symbol_allowlist().is_none());

        config.symbols = vec!["*".into(), "AAPL".into()];
        assert!(config.symbol_allowlist().is_none());

        config.symbols = vec!["aapl".into(), " msft ".into()];
        let allow = config.symbol_allowlist().unwrap();
        assert!(allow.contains("AAPL"));
        assert!(allow.contains("MSFT"));
    }

    #[test]
    fn test_concurrency_ceiling() {
        let mut config = FetcherConfig::default();
        assert_eq!(config.concurrency_ceiling(8), 80);

        config.max_concurrency = Some(4);
        assert_eq!(config.concurrency_ceiling(8), 4);

        config.max_concurrency = Some(0);
        assert_eq!(config.concurrency_ceiling(8), 1);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{"api_key":"k","data_types":["quotes"],"query_start":"2021-01-04"}"#;
        let config: FetcherConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.api_key, "k");
        assert_eq!(config.query_start(), Some("2021-01-04"));
        assert_eq!(config.backfill_interval_secs, 30);
    }
}
