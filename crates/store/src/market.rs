use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gapfill_core::common::{Stock, TimeFrame};
use gapfill_core::market::entity::{Candle, Quote, Trade};
use gapfill_core::store::error::StoreError;
use gapfill_core::store::port::MarketStore;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 个股数据库建表语句
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    timeframe TEXT NOT NULL,
    time DATETIME NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    vwap REAL,
    tick_count INTEGER,
    PRIMARY KEY (timeframe, time)
);

CREATE TABLE IF NOT EXISTS quotes (
    time DATETIME NOT NULL,
    bid_price REAL NOT NULL,
    bid_size REAL NOT NULL,
    ask_price REAL NOT NULL,
    ask_size REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    time DATETIME NOT NULL,
    price REAL NOT NULL,
    size REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_quotes_time ON quotes (time);
CREATE INDEX IF NOT EXISTS idx_trades_time ON trades (time);
"#;

/// MarketStore 的 SQLite 实现，采用“一库一股”策略。
///
/// # Summary
/// 为每个股票维护一个独立的 SQLite 数据库文件，以实现物理数据隔离。
/// 不同股票的补洞任务因此落在不同的连接池上，互不争用写锁。
///
/// # Invariants
/// * 数据库文件存储在 `{root}/market` 目录下。
/// * 连接池被缓存以避免频繁的文件打开操作。
/// * K 线主键为 `(timeframe, time)`，重复写入覆盖旧值。
pub struct SqliteMarketStore {
    base_path: PathBuf,
    pools: DashMap<String, SqlitePool>,
}

impl SqliteMarketStore {
    /// 创建新的 SqliteMarketStore 实例。
    ///
    /// # Logic
    /// 1. 计算数据根目录下的 `market` 子目录。
    /// 2. 确保该目录存在。
    ///
    /// # Arguments
    /// * `root` - 数据根目录。
    ///
    /// # Returns
    /// * `Result<Self, StoreError>` - 存储实例或错误。
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_path = root.as_ref().join("market");
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)
                .map_err(|e| StoreError::InitError(e.to_string()))?;
        }
        Ok(Self {
            base_path,
            pools: DashMap::new(),
        })
    }

    /// 个股数据库文件路径。
    pub fn db_path(&self, stock: &Stock) -> PathBuf {
        self.base_path.join(format!("{}.db", Self::file_key(stock)))
    }

    fn file_key(stock: &Stock) -> String {
        let exchange = stock.exchange.as_deref().unwrap_or("UNKNOWN");
        format!("{}_{}", stock.symbol, exchange)
    }

    /// 获取或初始化特定股票的连接池。
    ///
    /// # Logic
    /// 1. 根据股票代码和交易所生成文件名。
    /// 2. 配置 SQLite 连接选项，开启 `create_if_missing`。
    /// 3. 如果缓存中没有，则创建新连接池并运行初始化建表 SQL。
    async fn get_or_init_pool(&self, stock: &Stock) -> Result<SqlitePool, StoreError> {
        let key = Self::file_key(stock);

        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }

        let options = SqliteConnectOptions::new()
            .filename(self.db_path(stock))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::InitError(e.to_string()))?;

        debug!(key = %key, "opened market database");

        // 并发初始化时以先写入者为准，后来者的连接池随之丢弃
        let pool = self.pools.entry(key).or_insert(pool).value().clone();
        Ok(pool)
    }
}

fn tick_count_to_sql(n: Option<u64>) -> Option<i64> {
    n.map(|n| i64::try_from(n).unwrap_or(i64::MAX))
}

#[async_trait]
impl MarketStore for SqliteMarketStore {
    /// # Summary
    /// 批量保存 K 线数据。
    ///
    /// # Logic
    /// 1. 获取个股连接池。
    /// 2. 在单个事务中执行批量 `INSERT OR REPLACE`。
    async fn save_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        candles: &[Candle],
    ) -> Result<(), StoreError> {
        if candles.is_empty() {
            return Ok(());
        }

        let pool = self.get_or_init_pool(stock).await?;
        let timeframe_str = format!("{:?}", timeframe);

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for candle in candles {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO candles (timeframe, time, open, high, low, close, volume, vwap, tick_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&timeframe_str)
            .bind(candle.time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(candle.vwap)
            .bind(tick_count_to_sql(candle.tick_count))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    /// # Summary
    /// 加载 K 线数据。
    ///
    /// # Logic
    /// 1. 获取个股连接池。
    /// 2. 按时间区间查询 `candles` 表。
    async fn load_candles(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let pool = self.get_or_init_pool(stock).await?;
        let timeframe_str = format!("{:?}", timeframe);

        let records = sqlx::query_as::<
            _,
            (DateTime<Utc>, f64, f64, f64, f64, f64, Option<f64>, Option<i64>),
        >(
            r#"
            SELECT time, open, high, low, close, volume, vwap, tick_count
            FROM candles
            WHERE timeframe = ? AND time >= ? AND time <= ?
            ORDER BY time ASC
            "#,
        )
        .bind(&timeframe_str)
        .bind(start)
        .bind(end)
        .fetch_all(&pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(records
            .into_iter()
            .map(|r| Candle {
                time: r.0,
                open: r.1,
                high: r.2,
                low: r.3,
                close: r.4,
                volume: r.5,
                vwap: r.6,
                tick_count: r.7.and_then(|n| u64::try_from(n).ok()),
            })
            .collect())
    }

    /// # Summary
    /// 查询不晚于给定时间的最后一根 K 线时间。
    ///
    /// # Logic
    /// 1. 获取个股连接池（首次访问会建库，空库返回 None）。
    /// 2. 倒序取一条。
    async fn latest_candle_time(
        &self,
        stock: &Stock,
        timeframe: TimeFrame,
        at_or_before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let pool = self.get_or_init_pool(stock).await?;
        let timeframe_str = format!("{:?}", timeframe);

        let row = sqlx::query_as::<_, (DateTime<Utc>,)>(
            r#"
            SELECT time
            FROM candles
            WHERE timeframe = ? AND time <= ?
            ORDER BY time DESC
            LIMIT 1
            "#,
        )
        .bind(&timeframe_str)
        .bind(at_or_before)
        .fetch_optional(&pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|r| r.0))
    }

    async fn save_quotes(&self, stock: &Stock, quotes: &[Quote]) -> Result<(), StoreError> {
        if quotes.is_empty() {
            return Ok(());
        }
        let pool = self.get_or_init_pool(stock).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for quote in quotes {
            sqlx::query(
                "INSERT INTO quotes (time, bid_price, bid_size, ask_price, ask_size) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(quote.time)
            .bind(quote.bid_price)
            .bind(quote.bid_size)
            .bind(quote.ask_price)
            .bind(quote.ask_size)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn save_trades(&self, stock: &Stock, trades: &[Trade]) -> Result<(), StoreError> {
        if trades.is_empty() {
            return Ok(());
        }
        let pool = self.get_or_init_pool(stock).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for trade in trades {
            sqlx::query("INSERT INTO trades (time, price, size) VALUES (?, ?, ?)")
                .bind(trade.time)
                .bind(trade.price)
                .bind(trade.size)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
