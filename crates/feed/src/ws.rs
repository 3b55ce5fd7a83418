use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use gapfill_core::common::DataType;
use gapfill_core::market::entity::{Candle, Quote, StreamEvent, Trade};
use gapfill_core::market::error::MarketError;
use gapfill_core::market::port::{MessageStream, StreamSource};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// 推送通道容量
const CHANNEL_CAPACITY: usize = 4096;

/// # Summary
/// 订阅参数，每种数据类型对应一个全市场通配订阅。
///
/// # Returns
/// 逗号分隔的频道列表，例如 `AM.*,Q.*,T.*`；集合为空时返回空串。
pub fn subscription_params(types: &BTreeSet<DataType>) -> String {
    types
        .iter()
        .map(|t| match t {
            DataType::Bars => "AM.*",
            DataType::Quotes => "Q.*",
            DataType::Trades => "T.*",
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// 第 `attempt` 次重连前的等待时间，指数增长并封顶。
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// 服务端推送的单条事件，以 `ev` 字段区分类型。
#[derive(Deserialize, Debug)]
#[serde(tag = "ev")]
enum WireEvent {
    #[serde(rename = "AM")]
    Aggregate {
        sym: String,
        o: f64,
        h: f64,
        l: f64,
        c: f64,
        v: f64,
        vw: Option<f64>,
        // 周期开始时间 (毫秒)
        s: i64,
        n: Option<u64>,
    },
    #[serde(rename = "Q")]
    Quote {
        sym: String,
        bp: f64,
        bs: f64,
        ap: f64,
        #[serde(rename = "as")]
        ask_size: f64,
        t: i64,
    },
    #[serde(rename = "T")]
    Trade { sym: String, p: f64, s: f64, t: i64 },
    #[serde(rename = "status")]
    Status {
        status: String,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// 解码后的帧内容。
#[derive(Debug, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    Status { status: String, message: String },
}

fn millis(ms: i64) -> Result<DateTime<Utc>, MarketError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| MarketError::Parse(format!("timestamp out of range: {}", ms)))
}

/// 将单条线上事件映射为帧内容，未知事件类型返回 `None`。
fn to_frame(event: WireEvent) -> Result<Option<Frame>, MarketError> {
    let frame = match event {
        WireEvent::Aggregate {
            sym,
            o,
            h,
            l,
            c,
            v,
            vw,
            s,
            n,
        } => Frame::Event(StreamEvent::Bar {
            symbol: sym,
            candle: Candle {
                time: millis(s)?,
                open: o,
                high: h,
                low: l,
                close: c,
                volume: v,
                vwap: vw,
                tick_count: n,
            },
        }),
        WireEvent::Quote {
            sym,
            bp,
            bs,
            ap,
            ask_size,
            t,
        } => Frame::Event(StreamEvent::Quote {
            symbol: sym,
            quote: Quote {
                time: millis(t)?,
                bid_price: bp,
                bid_size: bs,
                ask_price: ap,
                ask_size,
            },
        }),
        WireEvent::Trade { sym, p, s, t } => Frame::Event(StreamEvent::Trade {
            symbol: sym,
            trade: Trade {
                time: millis(t)?,
                price: p,
                size: s,
            },
        }),
        WireEvent::Status { status, message } => Frame::Status { status, message },
        WireEvent::Unknown => return Ok(None),
    };
    Ok(Some(frame))
}

/// # Summary
/// 解码一帧文本消息。
///
/// # Logic
/// 1. 服务端每帧推送一个 JSON 数组，先只解析到数组层。
/// 2. 逐个元素映射为 `StreamEvent` 或状态信息，未知事件类型被忽略。
/// 3. 单个元素字段缺失或时间戳越界时记录告警并跳过，同帧其余事件照常返回。
///
/// # Returns
/// 帧内全部可识别的事件；整帧不是 JSON 数组时返回 `MarketError::Parse`。
pub fn decode_frame(text: &str) -> Result<Vec<Frame>, MarketError> {
    let elements: Vec<serde_json::Value> =
        serde_json::from_str(text).map_err(|e| MarketError::Parse(e.to_string()))?;

    let mut frames = Vec::with_capacity(elements.len());
    for element in elements {
        let decoded = serde_json::from_value::<WireEvent>(element)
            .map_err(|e| MarketError::Parse(e.to_string()))
            .and_then(to_frame);
        match decoded {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "skipping malformed stream event"),
        }
    }
    Ok(frames)
}

/// 单次会话的结束方式。
enum SessionEnd {
    /// 连接断开，需要重连
    Disconnected,
    /// 下游已不再接收
    ReceiverClosed,
}

/// # Summary
/// Polygon 风格的 WebSocket 实时行情源。
///
/// # Invariants
/// - 每次 `subscribe` 启动一个独立的后台任务维护连接。
/// - 断线后按指数退避重连，重连成功后先推送 `StreamEvent::Reconnected`。
/// - 下游丢弃流后后台任务在下一次发送或重连前退出。
#[derive(Clone)]
pub struct PolygonStream {
    url: String,
    api_key: String,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl PolygonStream {
    /// # Summary
    /// 创建实时行情源。
    ///
    /// # Arguments
    /// * `ws_servers`: WebSocket 服务地址，实际连接 `{ws_servers}/stocks`。
    /// * `api_key`: 鉴权 Key。
    pub fn new(ws_servers: &str, api_key: &str) -> Self {
        crate::ensure_tls_provider();
        Self {
            url: format!("{}/stocks", ws_servers.trim_end_matches('/')),
            api_key: api_key.to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// 覆盖重连退避参数。
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// # Summary
    /// 后台连接维护循环。
    ///
    /// # Logic
    /// 1. 建立会话并转发事件。
    /// 2. 会话结束后按退避时间等待再重连，成功转发过数据的会话会重置退避计数。
    /// 3. 鉴权失败或下游关闭时退出。
    async fn pump(self, params: String, tx: mpsc::Sender<StreamEvent>) {
        let mut attempt: u32 = 0;
        let mut reconnecting = false;

        loop {
            if tx.is_closed() {
                break;
            }

            match self.session(&params, &tx, reconnecting).await {
                Ok((SessionEnd::ReceiverClosed, _)) => break,
                Ok((SessionEnd::Disconnected, delivered)) => {
                    warn!(url = %self.url, "stream disconnected");
                    if delivered {
                        attempt = 0;
                    }
                }
                Err(MarketError::Auth(msg)) => {
                    error!(url = %self.url, message = %msg, "stream authentication failed");
                    break;
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, attempt, "stream session failed");
                }
            }

            reconnecting = true;
            let delay = backoff_delay(attempt, self.initial_backoff, self.max_backoff);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tx.closed() => break,
            }
        }

        info!(url = %self.url, "stream task stopped");
    }

    /// # Summary
    /// 单次会话：连接、鉴权、订阅、转发。
    ///
    /// # Returns
    /// 会话结束方式，以及本次会话是否转发过数据。
    async fn session(
        &self,
        params: &str,
        tx: &mpsc::Sender<StreamEvent>,
        reconnecting: bool,
    ) -> Result<(SessionEnd, bool), MarketError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| MarketError::Network(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        let auth = serde_json::json!({"action": "auth", "params": self.api_key}).to_string();
        sink.send(Message::Text(auth.into()))
            .await
            .map_err(|e| MarketError::Network(e.to_string()))?;

        let mut delivered = false;

        while let Some(msg) = source.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(frame)) => {
                    info!(?frame, "stream closed by server");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "stream read error");
                    break;
                }
            };

            let frames = match decode_frame(text.as_str()) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            for frame in frames {
                match frame {
                    Frame::Status { status, message } => match status.as_str() {
                        "auth_success" => {
                            let sub = serde_json::json!({"action": "subscribe", "params": params})
                                .to_string();
                            sink.send(Message::Text(sub.into()))
                                .await
                                .map_err(|e| MarketError::Network(e.to_string()))?;
                            info!(url = %self.url, %params, "stream subscribed");

                            if reconnecting && tx.send(StreamEvent::Reconnected).await.is_err() {
                                return Ok((SessionEnd::ReceiverClosed, delivered));
                            }
                        }
                        "auth_failed" => return Err(MarketError::Auth(message)),
                        _ => debug!(%status, %message, "stream status"),
                    },
                    Frame::Event(event) => {
                        if tx.send(event).await.is_err() {
                            return Ok((SessionEnd::ReceiverClosed, delivered));
                        }
                        delivered = true;
                    }
                }
            }
        }

        Ok((SessionEnd::Disconnected, delivered))
    }
}

#[async_trait]
impl StreamSource for PolygonStream {
    /// # Summary
    /// 订阅给定数据类型的全市场实时数据。
    ///
    /// # Logic
    /// 1. 生成订阅参数，为空时拒绝。
    /// 2. 启动后台连接任务，通过 mpsc 通道向流推送事件。
    async fn subscribe(&self, types: &BTreeSet<DataType>) -> Result<MessageStream, MarketError> {
        let params = subscription_params(types);
        if params.is_empty() {
            return Err(MarketError::Unknown("no data types to subscribe".into()));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.clone().pump(params, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
