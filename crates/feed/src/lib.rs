//! Polygon 风格的行情数据源适配器：REST 历史 K 线与 WebSocket 实时流。

use std::sync::Once;
use tracing::debug;

pub mod rest;
pub mod ws;

pub use rest::PolygonRestClient;
pub use ws::PolygonStream;

static TLS_PROVIDER_ONCE: Once = Once::new();

/// # Summary
/// 安装进程级 rustls 加密后端。
///
/// # Logic
/// reqwest 与 tungstenite 均以 `no-provider` 方式引入 rustls，首次构建客户端前必须安装一次。
/// 已被其它组件安装时忽略。
pub fn ensure_tls_provider() {
    TLS_PROVIDER_ONCE.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}
