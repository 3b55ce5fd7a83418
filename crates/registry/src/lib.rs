//! 补洞注册表：实时流与补洞调度器之间唯一共享的可变状态。

pub mod gap;

pub use gap::GapRegistry;
