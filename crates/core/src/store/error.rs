use thiserror::Error;

/// # Summary
/// 行情存储错误。
///
/// # Invariants
/// - 读写失败统一归为 `Database`，补洞调度视其为可重试的瞬时故障。
/// - `InitError` 只在打开存储根目录或按证券建库时出现。
#[derive(Error, Debug)]
pub enum StoreError {
    /// 查询或写入失败
    #[error("Database error: {0}")]
    Database(String),
    /// 存储目录或单证券数据库初始化失败
    #[error("Initialization error: {0}")]
    InitError(String),
}
