use crate::market::error::MarketError;
use crate::store::error::StoreError;
use thiserror::Error;

/// # Summary
/// 补洞域错误枚举。所有变体都只影响单个证券的单次任务，不会向调度循环传播。
///
/// # Invariants
/// - 必须通过 `thiserror` 派生 `Error` trait。
#[derive(Error, Debug)]
pub enum BackfillError {
    // 回退起始时间无法解析
    #[error("Configuration error: {0}")]
    Configuration(String),
    // 查询最后一条记录失败
    #[error("Transient store error: {0}")]
    TransientStore(#[from] StoreError),
    // 远端拉取或落库失败
    #[error("Fetch error: {0}")]
    Fetch(String),
}

impl From<MarketError> for BackfillError {
    fn from(err: MarketError) -> Self {
        BackfillError::Fetch(err.to_string())
    }
}
