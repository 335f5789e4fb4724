use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::core::process;
use crate::models::settings::ToolSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub url: String,
    pub dir: PathBuf,
    pub filename: String,
    pub gid: String,
    pub single_connection: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStatus {
    pub error_code: String,
    pub error_message: String,
    pub completed_length: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveStat {
    pub gid: String,
    pub completed_length: u64,
    pub connections: u32,
    pub speed: u64,
}

/// Lifecycle notifications pushed by the accelerator. Every accepted transfer
/// ends with exactly one of `Stop`, `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceleratorEvent {
    Start(String),
    Pause(String),
    Stop(String),
    Complete(String),
    Error(String),
    Disconnected,
}

#[async_trait]
pub trait Accelerator: Send + Sync {
    async fn add_transfer(&self, request: &TransferRequest) -> anyhow::Result<String>;
    async fn remove_transfer(&self, gid: &str) -> anyhow::Result<()>;
    async fn query_status(&self, gid: &str) -> anyhow::Result<TransferStatus>;
    async fn query_active(&self) -> anyhow::Result<Vec<ActiveStat>>;
    async fn version(&self) -> anyhow::Result<String>;
}

pub fn aria2_args(port: u16) -> Vec<String> {
    vec![
        "-k".to_string(),
        "1M".to_string(),
        "-j".to_string(),
        "1".to_string(),
        "--allow-overwrite=true".to_string(),
        "--disable-ipv6".to_string(),
        "--allow-piece-length-change=true".to_string(),
        "--enable-rpc".to_string(),
        format!("--rpc-listen-port={}", port),
    ]
}

pub fn spawn_aria2(tools: &ToolSettings) -> anyhow::Result<tokio::process::Child> {
    process::command(&tools.aria2_binary)
        .args(aria2_args(tools.aria2_port))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| anyhow!("failed to start aria2 ({}): {}", tools.aria2_binary, e))
}

/// `addUri` options. Fragments and single-connection setups get one
/// connection; otherwise the file is split in twice as many pieces as there
/// are connections so slow connections can be outpaced.
pub fn add_uri_options(request: &TransferRequest, max_connections: u32) -> Value {
    let single = request.single_connection || max_connections <= 1;
    let (split, per_server) = if single {
        ("1".to_string(), "1".to_string())
    } else {
        ((max_connections * 2).to_string(), max_connections.to_string())
    };
    json!({
        "gid": request.gid,
        "dir": request.dir.to_string_lossy(),
        "out": request.filename,
        "file-allocation": "none",
        "split": split,
        "max-connection-per-server": per_server,
    })
}

#[derive(Deserialize)]
struct RawStatus {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
    #[serde(rename = "completedLength", default)]
    completed_length: Option<String>,
}

#[derive(Deserialize)]
struct RawActive {
    gid: String,
    #[serde(rename = "completedLength", default)]
    completed_length: Option<String>,
    #[serde(default)]
    connections: Option<String>,
    #[serde(rename = "downloadSpeed", default)]
    download_speed: Option<String>,
}

fn parse_num<T: std::str::FromStr + Default>(raw: Option<&str>) -> T {
    raw.and_then(|s| s.parse().ok()).unwrap_or_default()
}

pub fn parse_status(value: Value) -> anyhow::Result<TransferStatus> {
    let raw: RawStatus = serde_json::from_value(value)?;
    Ok(TransferStatus {
        error_code: raw.error_code.unwrap_or_default(),
        error_message: raw.error_message.unwrap_or_default(),
        completed_length: parse_num(raw.completed_length.as_deref()),
    })
}

pub fn parse_active(value: Value) -> anyhow::Result<Vec<ActiveStat>> {
    let raw: Vec<RawActive> = serde_json::from_value(value)?;
    Ok(raw
        .into_iter()
        .map(|r| ActiveStat {
            completed_length: parse_num(r.completed_length.as_deref()),
            connections: parse_num(r.connections.as_deref()),
            speed: parse_num(r.download_speed.as_deref()),
            gid: r.gid,
        })
        .collect())
}

#[derive(Debug, PartialEq)]
enum Incoming {
    Response {
        id: u64,
        result: Result<Value, String>,
    },
    Notification(AcceleratorEvent),
}

fn parse_incoming(text: &str) -> Option<Incoming> {
    let value: Value = serde_json::from_str(text).ok()?;

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        let gid = value
            .get("params")
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("gid"))
            .and_then(|g| g.as_str())?
            .to_string();
        let event = match method {
            "aria2.onDownloadStart" => AcceleratorEvent::Start(gid),
            "aria2.onDownloadPause" => AcceleratorEvent::Pause(gid),
            "aria2.onDownloadStop" => AcceleratorEvent::Stop(gid),
            "aria2.onDownloadComplete" => AcceleratorEvent::Complete(gid),
            "aria2.onDownloadError" => AcceleratorEvent::Error(gid),
            _ => return None,
        };
        return Some(Incoming::Notification(event));
    }

    let id = match value.get("id")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let result = match value.get("error") {
        Some(err) => Err(err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string()),
        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
    };
    Some(Incoming::Response { id, result })
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, String>>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// JSON-RPC client for aria2 over its WebSocket endpoint.
pub struct Aria2Client {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    max_connections: u32,
}

impl Aria2Client {
    /// Connects to a running aria2 and starts the socket tasks. Notifications
    /// arrive on the returned receiver; `Disconnected` is sent once when the
    /// socket goes away.
    pub async fn connect(
        tools: &ToolSettings,
        max_connections: u32,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<AcceleratorEvent>)> {
        let url = format!("ws://localhost:{}/jsonrpc", tools.aria2_port);
        let attempts = tools.connect_attempts.max(1);
        let mut attempt = 0;

        let stream = loop {
            attempt += 1;
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((stream, _)) => break stream,
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "[aria2] connect attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(tools.connect_delay_ms)).await;
                }
                Err(e) => bail!("could not connect to aria2 at {}: {}", url, e),
            }
        };

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::default();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::error!("[aria2] write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => match parse_incoming(&text) {
                        Some(Incoming::Response { id, result }) => {
                            if let Some(tx) = lock_pending(&reader_pending).remove(&id) {
                                let _ = tx.send(result);
                            }
                        }
                        Some(Incoming::Notification(event)) => {
                            let _ = event_tx.send(event);
                        }
                        None => tracing::debug!("[aria2] ignored message: {}", text),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("[aria2] read failed: {}", e);
                        break;
                    }
                }
            }
            lock_pending(&reader_pending).clear();
            tracing::error!("[aria2] connection lost");
            let _ = event_tx.send(AcceleratorEvent::Disconnected);
        });

        let client = Self {
            outgoing: out_tx,
            pending,
            next_id: AtomicU64::new(1),
            max_connections,
        };
        Ok((client, event_rx))
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": format!("aria2.{}", method),
            "params": params,
        });

        if self.outgoing.send(payload.to_string()).is_err() {
            lock_pending(&self.pending).remove(&id);
            bail!("aria2 connection closed");
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(anyhow!("aria2 {} error: {}", method, message)),
            Err(_) => Err(anyhow!("aria2 connection closed during {}", method)),
        }
    }
}

#[async_trait]
impl Accelerator for Aria2Client {
    async fn add_transfer(&self, request: &TransferRequest) -> anyhow::Result<String> {
        let options = add_uri_options(request, self.max_connections);
        let result = self
            .call("addUri", vec![json!([request.url]), options])
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("aria2 addUri returned no gid"))
    }

    async fn remove_transfer(&self, gid: &str) -> anyhow::Result<()> {
        self.call("remove", vec![json!(gid)]).await?;
        Ok(())
    }

    async fn query_status(&self, gid: &str) -> anyhow::Result<TransferStatus> {
        let value = self
            .call(
                "tellStatus",
                vec![
                    json!(gid),
                    json!(["errorCode", "errorMessage", "completedLength"]),
                ],
            )
            .await?;
        parse_status(value)
    }

    async fn query_active(&self) -> anyhow::Result<Vec<ActiveStat>> {
        let value = self
            .call(
                "tellActive",
                vec![json!(["gid", "completedLength", "connections", "downloadSpeed"])],
            )
            .await?;
        parse_active(value)
    }

    async fn version(&self) -> anyhow::Result<String> {
        let value = self.call("getVersion", Vec::new()).await?;
        value
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("aria2 getVersion returned no version"))
    }
}
