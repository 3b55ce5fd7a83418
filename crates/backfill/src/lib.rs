//! 补洞应用服务：区间解析、补洞执行与有界并发调度。

pub mod executor;
pub mod resolver;
pub mod scheduler;

pub use executor::BarBackfiller;
pub use resolver::{RangeResolver, parse_query_start};
pub use scheduler::{BoundedBackfillScheduler, CycleReport, SchedulerSettings};
