use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobProgress {
    pub id: i64,
    pub bytes_loaded: u64,
    pub speed_bytes_per_sec: u64,
    pub connections: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    Completed { id: i64, bytes_loaded: u64 },
    Stopped { id: i64 },
    Error { id: i64, message: String },
    Progress { total_speed: u64, jobs: Vec<JobProgress> },
    RefreshFinished { id: i64, success: bool },
    /// The accelerator connection is gone; nothing can make progress anymore.
    Fatal { message: String },
}

pub trait EventEmitter: Send + Sync + Clone + 'static {
    fn emit(&self, event: EngineEvent);
}

#[derive(Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
