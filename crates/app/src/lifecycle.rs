use gapfill_stream::RouterStats;
use std::future::Future;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

/// 进程退出的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// 收到停机信号，路由器仍在运行
    Signal,
    /// 实时流先于停机信号结束
    StreamEnded(RouterStats),
}

/// # Summary
/// 等待停机信号或路由任务结束，以先发生者为准。
///
/// # Logic
/// 1. 信号先到：返回 `Signal`，路由任务留给调用方在广播停机后回收。
/// 2. 路由任务先结束：说明实时流已断开且不会恢复，返回其统计。
pub async fn wait_for_exit<F>(
    signal: F,
    router: &mut JoinHandle<RouterStats>,
) -> Result<ExitReason, JoinError>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        signal = signal => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("Shutdown signal received. Draining in-flight backfills...");
            Ok(ExitReason::Signal)
        }
        stats = router => {
            let stats = stats?;
            error!(?stats, "live stream ended unexpectedly. Draining in-flight backfills...");
            Ok(ExitReason::StreamEnded(stats))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dead_stream_ends_wait() {
        let stats = RouterStats {
            bars: 3,
            ..RouterStats::default()
        };
        let mut router = tokio::spawn(async move { stats });

        let reason = tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_exit(std::future::pending(), &mut router),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reason, ExitReason::StreamEnded(stats));
    }

    #[tokio::test]
    async fn test_signal_leaves_router_running() {
        let mut router = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            RouterStats::default()
        });

        let reason = wait_for_exit(async { Ok(()) }, &mut router).await.unwrap();
        assert_eq!(reason, ExitReason::Signal);
        assert!(!router.is_finished());
        assert_eq!(router.await.unwrap(), RouterStats::default());
    }
}
