//! 基于 SQLite 的时序行情存储实现。

pub mod market;

pub use market::SqliteMarketStore;
