//! 行情补洞系统的领域内核：实体、错误与端口 (Port) 定义。
//!
//! 具体实现（SQLite 存储、Polygon 数据源、调度器）全部位于其它 crate，
//! 并且只通过本 crate 的 trait 相互连接。

pub mod common;
pub mod config;

pub mod market {
    pub mod entity;
    pub mod error;
    pub mod port;
}

pub mod store {
    pub mod error;
    pub mod port;
}

pub mod backfill {
    pub mod entity;
    pub mod error;
    pub mod port;
}

#[cfg(feature = "test-utils")]
pub mod test_utils;
