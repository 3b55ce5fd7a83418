mod lifecycle;
mod logging;
mod settings;

use gapfill_backfill::{
    BarBackfiller, BoundedBackfillScheduler, RangeResolver, SchedulerSettings, parse_query_start,
};
use gapfill_core::common::TimeFrame;
use gapfill_core::common::time::RealTimeProvider;
use gapfill_core::config::ConfigError;
use gapfill_core::market::error::MarketError;
use gapfill_core::market::port::StreamSource;
use gapfill_core::store::port::MarketStore;
use gapfill_feed::{PolygonRestClient, PolygonStream};
use gapfill_registry::GapRegistry;
use gapfill_store::SqliteMarketStore;
use gapfill_stream::{RouterSettings, StreamRouter};
use lifecycle::ExitReason;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// 未指定配置文件时的默认路径
const DEFAULT_CONFIG: &str = "gapfill.toml";

/// 实时流与补洞使用的 K 线周期
const TIMEFRAME: TimeFrame = TimeFrame::Minute1;

/// # Summary
/// 应用启动入口，纯粹的 DI 容器。
/// 负责实例化所有具体实现组件并通过 `Arc<dyn Trait>` 注入到路由器与调度器。
///
/// # Logic
/// 1. 加载配置并初始化日志。
/// 2. 校验数据类型与回退起始时间，任何错误都在启动阶段失败。
/// 3. 实例化基础设施层（Store、REST、WebSocket）。
/// 4. 构造共享注册表、路由器与调度器并分别启动。
/// 5. 等待 Ctrl-C 或实时流终止，通知停机并等待正在进行的补洞结束；实时流终止时以错误退出。
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. 配置与日志
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = settings::load(&path)?;
    let _log_guard = logging::init(&config.log_level, config.log_dir.as_deref());
    info!(config = %path.display(), "gapfill starting...");

    // 2. 启动期校验
    let data_types = config.validate()?;
    if let Some(raw) = config.query_start() {
        let start = parse_query_start(raw)
            .map_err(|e| ConfigError::InvalidQueryStart(format!("{}: {}", raw, e)))?;
        info!(%start, "backfills will start from the configured query_start");
    }

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let ceiling = config.concurrency_ceiling(cpus);

    // 3. 基础设施层
    let store: Arc<dyn MarketStore> = Arc::new(SqliteMarketStore::new(&config.data_dir)?);
    let rest = Arc::new(PolygonRestClient::new(config.base_url(), &config.api_key)?);
    let source = PolygonStream::new(config.ws_servers(), &config.api_key);

    // 4. 注册表、补洞调度与实时路由
    let registry = Arc::new(GapRegistry::new());

    let executor = Arc::new(BarBackfiller::new(
        rest,
        store.clone(),
        Arc::new(RealTimeProvider),
        TIMEFRAME,
        config.add_bar_tick_count,
    ));
    let resolver = Arc::new(RangeResolver::new(
        store.clone(),
        TIMEFRAME,
        config.query_start().map(str::to_string),
    ));
    let scheduler = Arc::new(BoundedBackfillScheduler::new(
        registry.clone(),
        resolver,
        executor,
        SchedulerSettings {
            interval: Duration::from_secs(config.backfill_interval_secs),
            ceiling,
            max_requeue: config.max_requeue,
            timeframe: TIMEFRAME,
        },
    ));

    let router = StreamRouter::new(
        store,
        registry,
        RouterSettings {
            allowlist: config.symbol_allowlist(),
            keep_tick_count: config.add_bar_tick_count,
            timeframe: TIMEFRAME,
            ..RouterSettings::default()
        },
    );

    let stream = source.subscribe(&data_types).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut router_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { router.run(stream, shutdown).await })
    };
    let scheduler_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    info!(?data_types, ceiling, cpus, "gapfill running. Waiting for signals...");

    // 5. 等待退出信号或实时流终止，随后排空
    let reason = lifecycle::wait_for_exit(tokio::signal::ctrl_c(), &mut router_task).await?;
    shutdown_tx.send(true)?;

    let stats = match reason {
        ExitReason::StreamEnded(stats) => stats,
        ExitReason::Signal => router_task.await?,
    };
    scheduler_task.await?;
    info!(?stats, "gapfill stopped");

    if let ExitReason::StreamEnded(_) = reason {
        return Err(MarketError::Network("live stream ended".into()).into());
    }
    Ok(())
}
