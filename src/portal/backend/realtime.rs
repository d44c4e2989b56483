//! 托管后端实时变更推送（Phoenix 协议 WebSocket）
//!
//! 每个订阅对应一个独立 topic（`realtime:<collection>-<n>`），同一集合可被多个
//! 同步器同时订阅。连接断开时所有订阅的发送端被丢弃，接收方据此得知订阅已失效；
//! 这里不做自动重连。

use crate::portal::auth::SessionStore;
use crate::portal::backend::{
    ChangeKind, ChangeSink, PushSubscription, RawChange, SubscriptionHandle,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 心跳间隔
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Phoenix 协议帧（vsn 1.0.0，JSON 对象格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

/// 由项目地址推导 realtime 地址：`http(s)://` → `ws(s)://.../realtime/v1/websocket`
pub fn websocket_url(base_url: &str, anon_key: &str) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(anyhow::anyhow!("无法识别的项目地址: {}", base_url));
    };
    Ok(format!(
        "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
        ws_base, anon_key
    ))
}

/// `phx_join` 的 payload：订阅 public schema 下某张表的全部变更
pub(crate) fn join_payload(collection: &str, access_token: Option<&str>) -> Value {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [
                { "event": "*", "schema": "public", "table": collection }
            ]
        }
    });
    if let (Some(token), Value::Object(map)) = (access_token, &mut payload) {
        map.insert("access_token".to_string(), Value::String(token.to_string()));
    }
    payload
}

/// 把 `postgres_changes` 的 payload 转为 [`RawChange`]
///
/// 结构：`{"data": {"type": "INSERT", "table": "...", "record": {...}, "old_record": {...}}}`
pub(crate) fn parse_change_payload(payload: &Value) -> Result<RawChange> {
    let data = payload
        .get("data")
        .ok_or_else(|| anyhow::anyhow!("变更事件缺少 data 字段"))?;
    let kind: ChangeKind = serde_json::from_value(data.get("type").cloned().unwrap_or(Value::Null))
        .context("无法识别的变更类型")?;
    let collection = data
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("变更事件缺少 table 字段"))?
        .to_string();

    let non_empty = |v: Option<&Value>| match v {
        Some(Value::Object(map)) if !map.is_empty() => Some(Value::Object(map.clone())),
        _ => None,
    };
    let after = non_empty(data.get("record"));
    let before = non_empty(data.get("old_record"));

    match kind {
        ChangeKind::Insert | ChangeKind::Update if after.is_none() => {
            Err(anyhow::anyhow!("{:?} 事件缺少 record", kind))
        }
        ChangeKind::Delete if before.is_none() => Err(anyhow::anyhow!("DELETE 事件缺少 old_record")),
        _ => Ok(RawChange {
            kind,
            collection,
            before,
            after,
        }),
    }
}

/// `phx_reply` 是否成功，失败时给出原因
fn check_reply(payload: &Value) -> Result<()> {
    match payload.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        status => {
            let reason = payload
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| payload.to_string());
            Err(anyhow::anyhow!(
                "服务器拒绝请求（status={}）: {}",
                status.unwrap_or("unknown"),
                reason
            ))
        }
    }
}

struct RealtimeRoute {
    collection: String,
    sink: ChangeSink,
}

struct Shared {
    writer: Mutex<WsWriter>,
    routes: StdMutex<HashMap<String, RealtimeRoute>>,
    pending: StdMutex<HashMap<String, oneshot::Sender<Value>>>,
    next_ref: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, RealtimeRoute>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    async fn send_frame(&self, frame: &PhoenixFrame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow::anyhow!("实时连接已关闭"));
        }
        let text = serde_json::to_string(frame).context("序列化 Phoenix 帧失败")?;
        let mut w = self.writer.lock().await;
        w.send(WsMessage::Text(text))
            .await
            .context("发送 WebSocket 消息失败")?;
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let frame: PhoenixFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[Realtime] 无法解析的消息: {}，原始内容: {}", e, text);
                return;
            }
        };

        match frame.event.as_str() {
            "phx_reply" => {
                let Some(reference) = frame.reference else {
                    return;
                };
                if let Some(tx) = self.pending().remove(&reference) {
                    let _ = tx.send(frame.payload);
                }
            }
            "postgres_changes" => {
                let change = match parse_change_payload(&frame.payload) {
                    Ok(change) => change,
                    Err(e) => {
                        warn!("[Realtime] 跳过无法解析的变更事件（{}）: {}", frame.topic, e);
                        return;
                    }
                };
                let mut routes = self.routes();
                let closed = match routes.get(&frame.topic) {
                    Some(route) => {
                        debug!(
                            "[Realtime] 📥 {} {:?} → {}",
                            route.collection, change.kind, frame.topic
                        );
                        route.sink.send(change).is_err()
                    }
                    None => false,
                };
                if closed {
                    debug!("[Realtime] {} 的接收端已关闭，移除", frame.topic);
                    routes.remove(&frame.topic);
                }
            }
            "phx_error" | "phx_close" => {
                if self.routes().remove(&frame.topic).is_some() {
                    warn!("[Realtime] ⚠️ 订阅 {} 被服务器关闭（{}）", frame.topic, frame.event);
                }
            }
            "system" => {
                debug!("[Realtime] 系统消息 {}: {}", frame.topic, frame.payload);
            }
            other => {
                debug!("[Realtime] 忽略事件 {}（{}）", other, frame.topic);
            }
        }
    }

    /// 连接结束：丢弃所有订阅发送端和等待中的应答
    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped = {
            let mut routes = self.routes();
            let count = routes.len();
            routes.clear();
            count
        };
        self.pending().clear();
        if dropped > 0 {
            warn!("[Realtime] 🔌 连接已断开，{} 个订阅失效", dropped);
        }
    }
}

/// 实时变更推送客户端
pub struct RealtimeClient {
    shared: Arc<Shared>,
    sessions: SessionStore,
    reply_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeClient {
    /// 建立连接并启动心跳和读取任务
    pub async fn connect(
        base_url: &str,
        anon_key: &str,
        sessions: SessionStore,
        reply_timeout: Duration,
    ) -> Result<Self> {
        let url = websocket_url(base_url, anon_key)?;
        info!("[Realtime] 🔗 连接实时服务: {}", base_url);

        let (ws_stream, response) = connect_async(&url)
            .await
            .context("连接实时服务失败")?;
        info!(
            "[Realtime] ✅ WebSocket 连接成功, 状态: {}",
            response.status()
        );

        let (write, read) = ws_stream.split();
        let shared = Arc::new(Shared {
            writer: Mutex::new(write),
            routes: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            next_ref: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        info!("[Realtime] 💓 启动心跳");
        let heartbeat_shared = shared.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = PhoenixFrame {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    reference: Some(heartbeat_shared.next_ref()),
                };
                if heartbeat_shared.send_frame(&frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            handle_messages(reader_shared, read).await;
        });

        Ok(Self {
            shared,
            sessions,
            reply_timeout,
            tasks: vec![heartbeat, reader],
        })
    }

    /// 连接是否仍然可用
    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// 发送请求并等待 `phx_reply`
    async fn request(&self, topic: &str, event: &str, payload: Value) -> Result<Value> {
        let reference = self.shared.next_ref();
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(reference.clone(), tx);

        let frame = PhoenixFrame {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.clone()),
        };
        if let Err(e) = self.shared.send_frame(&frame).await {
            self.shared.pending().remove(&reference);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(anyhow::anyhow!("等待 {} 应答时连接已断开", event)),
            Err(_) => {
                self.shared.pending().remove(&reference);
                return Err(anyhow::anyhow!(
                    "等待 {} 应答超时（{:?}）",
                    event,
                    self.reply_timeout
                ));
            }
        };
        check_reply(&reply)?;
        Ok(reply)
    }

    /// 主动关闭连接
    pub async fn close(&self) {
        {
            let mut w = self.shared.writer.lock().await;
            let _ = w.send(WsMessage::Close(None)).await;
        }
        self.shared.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        info!("[Realtime] 👋 已关闭实时连接");
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.shutdown();
    }
}

/// 读取循环：连接结束后清理全部订阅
async fn handle_messages(shared: Arc<Shared>, mut read: WsReader) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => shared.handle_frame(&text),
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                break;
            }
            Err(e) => {
                error!("[Realtime] WebSocket 错误: {}", e);
                break;
            }
            _ => {}
        }
    }
    shared.shutdown();
}

#[async_trait]
impl PushSubscription for RealtimeClient {
    async fn subscribe(&self, collection: &str, sink: ChangeSink) -> Result<SubscriptionHandle> {
        let topic = format!("realtime:{}-{}", collection, self.shared.next_ref());
        // 先登记路由，避免 join 应答与第一条变更之间的事件丢失
        self.shared.routes().insert(
            topic.clone(),
            RealtimeRoute {
                collection: collection.to_string(),
                sink,
            },
        );

        let token = self.sessions.access_token();
        let payload = join_payload(collection, token.as_deref());
        if let Err(e) = self.request(&topic, "phx_join", payload).await {
            self.shared.routes().remove(&topic);
            return Err(e.context(format!("订阅 {} 失败", collection)));
        }

        info!("[Realtime] 📡 已订阅 {}（{}）", collection, topic);
        Ok(SubscriptionHandle {
            id: topic,
            collection: collection.to_string(),
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if self.shared.routes().remove(&handle.id).is_none() {
            return Ok(());
        }
        if !self.is_connected() {
            return Ok(());
        }

        let frame = PhoenixFrame {
            topic: handle.id.clone(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(self.shared.next_ref()),
        };
        self.shared
            .send_frame(&frame)
            .await
            .context(format!("取消订阅 {} 失败", handle.collection))?;
        info!("[Realtime] 取消订阅 {}（{}）", handle.collection, handle.id);
        Ok(())
    }
}
