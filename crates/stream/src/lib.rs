//! 实时行情路由：过滤、落库与断档检测。

pub mod router;

pub use router::{RouterSettings, RouterStats, StreamRouter};
