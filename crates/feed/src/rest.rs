use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gapfill_core::common::{Stock, TimeFrame};
use gapfill_core::market::entity::Candle;
use gapfill_core::market::error::MarketError;
use gapfill_core::market::port::HistoryProvider;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// 单次请求的最大返回条数
const PAGE_LIMIT: usize = 50_000;

/// # Summary
/// Polygon 聚合 K 线 REST 客户端。
///
/// # Invariants
/// - 使用 `reqwest` 异步客户端进行通讯。
/// - `base_url` 不以 `/` 结尾。
#[derive(Clone)]
pub struct PolygonRestClient {
    /// 内部使用的 HTTP 客户端
    client: Client,
    base_url: String,
    api_key: String,
    page_limit: usize,
}

impl PolygonRestClient {
    /// # Summary
    /// 创建一个新的 REST 客户端。
    ///
    /// # Logic
    /// 1. 安装 rustls 加密后端。
    /// 2. 配置 30 秒超时并初始化 reqwest 客户端。
    ///
    /// # Arguments
    /// * `base_url`: REST 服务地址。
    /// * `api_key`: 鉴权 Key。
    ///
    /// # Returns
    /// 初始化后的客户端，HTTP 客户端构建失败时返回 `MarketError::Network`。
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, MarketError> {
        crate::ensure_tls_provider();

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MarketError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            page_limit: PAGE_LIMIT,
        })
    }

    /// 覆盖单页条数上限。
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    /// 将周期映射为 `(multiplier, timespan)`。
    fn span(timeframe: TimeFrame) -> (u32, &'static str) {
        match timeframe {
            TimeFrame::Minute1 => (1, "minute"),
            TimeFrame::Minute5 => (5, "minute"),
            TimeFrame::Hour1 => (1, "hour"),
            TimeFrame::Day1 => (1, "day"),
        }
    }

    /// 构建单页请求地址。
    fn aggs_url(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        let (multiplier, timespan) = Self::span(timeframe);
        format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            symbol,
            multiplier,
            timespan,
            start.timestamp_millis(),
            end.timestamp_millis()
        )
    }

    /// # Summary
    /// 请求单页数据。
    ///
    /// # Logic
    /// 1. 发起 GET 请求并检查状态码，401/403 映射为鉴权错误。
    /// 2. 解析 JSON 并检查业务状态。
    async fn fetch_page(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggBar>, MarketError> {
        let url = self.aggs_url(symbol, timeframe, start, end);
        let limit = self.page_limit.to_string();

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", limit.as_str()),
                ("apiKey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| MarketError::Network(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(MarketError::Auth(format!("HTTP {}", resp.status())));
            }
            StatusCode::NOT_FOUND => return Err(MarketError::NotFound),
            s => return Err(MarketError::Network(format!("HTTP {}", s))),
        }

        let body: AggsResponse = resp
            .json()
            .await
            .map_err(|e| MarketError::Parse(e.to_string()))?;
        body.into_bars()
    }
}

/// # Summary
/// 聚合接口响应体。
#[derive(Deserialize, Debug)]
struct AggsResponse {
    status: Option<String>,
    results: Option<Vec<AggBar>>,
    error: Option<String>,
}

impl AggsResponse {
    fn into_bars(self) -> Result<Vec<AggBar>, MarketError> {
        if self.status.as_deref() == Some("ERROR") {
            return Err(MarketError::Unknown(
                self.error.unwrap_or_else(|| "unspecified error".into()),
            ));
        }
        Ok(self.results.unwrap_or_default())
    }
}

/// 单根聚合 K 线，字段名沿用数据源缩写。
#[derive(Deserialize, Debug)]
struct AggBar {
    // 周期开始时间 (毫秒)
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    vw: Option<f64>,
    n: Option<u64>,
}

impl AggBar {
    fn into_candle(self) -> Option<Candle> {
        Some(Candle {
            time: DateTime::from_timestamp_millis(self.t)?,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
            vwap: self.vw,
            tick_count: self.n,
        })
    }
}

#[async_trait]
impl HistoryProvider for PolygonRestClient {
    /// # Summary
    /// 分页拉取 `[start, end)` 区间的聚合 K 线。
    ///
    /// # Logic
    /// 1. 以游标 `cursor = start` 请求一页。
    /// 2. 丢弃 `time >= end` 的数据（数据源的终点是包含的）。
    /// 3. 单页条数达到上限时，游标移到最后一根之后的下一个周期继续请求。
    async fn fetch_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketError> {
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let page = self.fetch_page(&stock.symbol, timeframe, cursor, end).await?;
            let page_len = page.len();

            let before = candles.len();
            candles.extend(
                page.into_iter()
                    .filter_map(AggBar::into_candle)
                    .filter(|c| c.time >= cursor && c.time < end),
            );

            debug!(
                symbol = %stock.symbol,
                %cursor,
                received = page_len,
                kept = candles.len() - before,
                "aggregates page fetched"
            );

            if page_len < self.page_limit {
                break;
            }
            match candles.last() {
                Some(last) if last.time >= cursor => cursor = last.time + timeframe.duration(),
                _ => break,
            }
        }

        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_aggs_url() {
        let client = PolygonRestClient::new("https://api.example.com/", "key").unwrap();
        let start = Utc.with_ymd_and_hms(2021, 1, 4, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2021, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(
            client.aggs_url("AAPL", TimeFrame::Minute1, start, end),
            "https://api.example.com/v2/aggs/ticker/AAPL/range/1/minute/1609718400000/1609804800000"
        );
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "ticker": "AAPL",
            "status": "OK",
            "resultsCount": 2,
            "results": [
                {"t": 1609770600000, "o": 133.52, "h": 133.61, "l": 133.1, "c": 133.2, "v": 1000, "vw": 133.3, "n": 12},
                {"t": 1609770660000, "o": 133.2, "h": 133.4, "l": 133.0, "c": 133.3, "v": 800}
            ]
        }"#;
        let body: AggsResponse = serde_json::from_str(json).unwrap();
        let candles: Vec<Candle> = body
            .into_bars()
            .unwrap()
            .into_iter()
            .filter_map(AggBar::into_candle)
            .collect();

        assert_eq!(candles.len(), 2);
        assert_eq!(
            candles[0].time,
            Utc.with_ymd_and_hms(2021, 1, 4, 14, 30, 0).unwrap()
        );
        assert_eq!(candles[0].tick_count, Some(12));
        assert_eq!(candles[1].vwap, None);
    }

    #[test]
    fn test_error_status() {
        let json = r#"{"status": "ERROR", "error": "bad ticker"}"#;
        let body: AggsResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(body.into_bars(), Err(MarketError::Unknown(m)) if m == "bad ticker"));

        let json = r#"{"status": "OK", "resultsCount": 0}"#;
        let body: AggsResponse = serde_json::from_str(json).unwrap();
        assert!(body.into_bars().unwrap().is_empty());
    }
}
