//! In-memory stand-ins for the accelerator, muxer, resolver and disk probe,
//! plus a harness that runs a real engine against them.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::aria2::{Accelerator, AcceleratorEvent, ActiveStat, TransferRequest, TransferStatus};
use crate::core::disk::SpaceProbe;
use crate::core::errors::{MuxError, ResolveError};
use crate::core::events::{ChannelEmitter, EngineEvent};
use crate::core::ffmpeg::{MuxRequest, Muxer};
use crate::core::orchestrator::{EngineContext, EngineHandle, Orchestrator};
use crate::core::ytdlp::{ResolveOptions, ResolvedVideo, Resolver};
use crate::models::download::DownloadJob;
use crate::models::media::{ChannelInfo, PlaylistInfo};
use crate::models::settings::EngineSettings;
use crate::storage::sqlite::SqliteStore;
use crate::storage::DownloadStore;

#[derive(Default)]
pub struct FakeAccelerator {
    added: Mutex<Vec<TransferRequest>>,
    removed: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<String, TransferStatus>>,
    active: Mutex<Vec<ActiveStat>>,
    fail_adds: AtomicBool,
    fail_status: AtomicBool,
}

impl FakeAccelerator {
    pub fn added(&self) -> Vec<TransferRequest> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status_queries(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn set_status(&self, gid: &str, status: TransferStatus) {
        self.statuses.lock().unwrap().insert(gid.to_string(), status);
    }

    pub fn set_active(&self, stats: Vec<ActiveStat>) {
        *self.active.lock().unwrap() = stats;
    }

    pub fn request_for(&self, gid: &str) -> TransferRequest {
        self.added()
            .into_iter()
            .find(|r| r.gid == gid)
            .unwrap_or_else(|| panic!("no transfer with gid {gid}"))
    }
}

#[async_trait]
impl Accelerator for FakeAccelerator {
    async fn add_transfer(&self, request: &TransferRequest) -> anyhow::Result<String> {
        if self.fail_adds.load(Ordering::SeqCst) {
            anyhow::bail!("addUri rejected");
        }
        self.added.lock().unwrap().push(request.clone());
        Ok(request.gid.clone())
    }

    async fn remove_transfer(&self, gid: &str) -> anyhow::Result<()> {
        self.removed.lock().unwrap().push(gid.to_string());
        Ok(())
    }

    async fn query_status(&self, gid: &str) -> anyhow::Result<TransferStatus> {
        if self.fail_status.load(Ordering::SeqCst) {
            anyhow::bail!("tellStatus timed out");
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(gid)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_active(&self) -> anyhow::Result<Vec<ActiveStat>> {
        Ok(self.active.lock().unwrap().clone())
    }

    async fn version(&self) -> anyhow::Result<String> {
        Ok("1.37.0".to_string())
    }
}

/// Records requests and writes a placeholder output on success.
#[derive(Default)]
pub struct FakeMuxer {
    requests: Mutex<Vec<MuxRequest>>,
    failure: Mutex<Option<MuxError>>,
    held: AtomicBool,
}

impl FakeMuxer {
    pub fn requests(&self) -> Vec<MuxRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fail_with(&self, error: MuxError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// While held, a mux is recorded but does not finish.
    pub fn hold(&self, held: bool) {
        self.held.store(held, Ordering::SeqCst);
    }
}

#[async_trait]
impl Muxer for FakeMuxer {
    async fn mux(&self, request: &MuxRequest, _cancel: CancellationToken) -> Result<(), MuxError> {
        self.requests.lock().unwrap().push(request.clone());
        while self.held.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let failure = self.failure.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        tokio::fs::write(&request.output, b"muxed")
            .await
            .map_err(|e| MuxError::Failed(e.to_string()))
    }
}

pub struct FakeSpace(AtomicU64);

impl FakeSpace {
    pub fn new(free: u64) -> Self {
        Self(AtomicU64::new(free))
    }

    pub fn set(&self, free: u64) {
        self.0.store(free, Ordering::SeqCst);
    }
}

impl SpaceProbe for FakeSpace {
    fn available_space(&self, _path: &Path) -> Option<u64> {
        Some(self.0.load(Ordering::SeqCst))
    }
}

/// Answers video lookups from a queue; an empty queue means the resolver
/// gave up.
#[derive(Default)]
pub struct FakeResolver {
    videos: Mutex<VecDeque<Result<ResolvedVideo, ResolveError>>>,
    video_calls: AtomicUsize,
    hang: AtomicBool,
}

impl FakeResolver {
    pub fn push_video(&self, result: Result<ResolvedVideo, ResolveError>) {
        self.videos.lock().unwrap().push_back(result);
    }

    pub fn video_calls(&self) -> usize {
        self.video_calls.load(Ordering::SeqCst)
    }

    /// Makes every lookup block until it is cancelled.
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn video_info(
        &self,
        _video_id: &str,
        _options: ResolveOptions,
        cancel: &CancellationToken,
    ) -> Result<ResolvedVideo, ResolveError> {
        self.video_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(ResolveError::Cancelled);
        }
        let next = self.videos.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ResolveError::Exhausted("no response queued".to_string())))
    }

    async fn playlist_info(
        &self,
        playlist_id: &str,
        _count: Option<u32>,
        _cancel: &CancellationToken,
    ) -> Result<PlaylistInfo, ResolveError> {
        Err(ResolveError::NotFound(playlist_id.to_string()))
    }

    async fn channel_info(
        &self,
        handle: &str,
        _cancel: &CancellationToken,
    ) -> Result<ChannelInfo, ResolveError> {
        Err(ResolveError::NotFound(handle.to_string()))
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// A running engine wired to fakes, a sqlite store and a scratch directory.
pub struct Harness {
    pub engine: EngineHandle,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub accelerator: Arc<FakeAccelerator>,
    pub muxer: Arc<FakeMuxer>,
    pub space: Arc<FakeSpace>,
    pub resolver: Arc<FakeResolver>,
    pub store: Arc<SqliteStore>,
    pub dir: tempfile::TempDir,
    accel_tx: mpsc::UnboundedSender<AcceleratorEvent>,
}

impl Harness {
    pub async fn new() -> Self {
        let mut settings = EngineSettings::default();
        settings.download.max_connections = 4;
        settings.advanced.retry_delay_ms = 200;
        settings.advanced.progress_interval_ms = 50;
        settings.advanced.persist_every_ticks = 2;
        settings.advanced.refresh_variant_delay_ms = 10;

        let accelerator = Arc::new(FakeAccelerator::default());
        let muxer = Arc::new(FakeMuxer::default());
        let space = Arc::new(FakeSpace::new(u64::MAX / 2));
        let resolver = Arc::new(FakeResolver::default());
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (emitter, events) = ChannelEmitter::new();
        let (accel_tx, accel_rx) = mpsc::unbounded_channel();

        let ctx = EngineContext {
            accelerator: accelerator.clone(),
            muxer: muxer.clone(),
            resolver: resolver.clone(),
            space: space.clone(),
            store: store.clone(),
            emitter,
            settings,
        };
        let engine = Orchestrator::spawn(ctx, accel_rx);

        Self {
            engine,
            events,
            accelerator,
            muxer,
            space,
            resolver,
            store,
            dir: tempfile::tempdir().unwrap(),
            accel_tx,
        }
    }

    /// Persists `job` and returns it with its assigned id and priority.
    pub async fn add_job(&self, mut job: DownloadJob) -> DownloadJob {
        let (id, priority) = self.store.add_download(&job).await.unwrap();
        job.id = id;
        job.priority = priority;
        job
    }

    pub fn notify(&self, event: AcceleratorEvent) {
        self.accel_tx.send(event).unwrap();
    }

    /// Writes the transfer's file as the accelerator would and reports it
    /// complete.
    pub fn complete(&self, gid: &str, bytes: &[u8]) {
        let request = self.accelerator.request_for(gid);
        std::fs::create_dir_all(&request.dir).unwrap();
        std::fs::write(request.dir.join(&request.filename), bytes).unwrap();
        self.accelerator.set_status(
            gid,
            TransferStatus {
                completed_length: bytes.len() as u64,
                ..Default::default()
            },
        );
        self.notify(AcceleratorEvent::Complete(gid.to_string()));
    }

    /// Returns once the engine has handled everything sent before it.
    pub async fn barrier(&self, id: i64) {
        let _ = self.engine.snapshot(id).await;
    }

    /// Next event other than a progress tick.
    pub async fn next_event(&mut self) -> EngineEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for an engine event")
                .expect("event channel closed");
            if !matches!(event, EngineEvent::Progress { .. }) {
                return event;
            }
        }
    }

    /// Next progress tick that saw some transfer speed.
    pub async fn next_progress(&mut self) -> EngineEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for progress")
                .expect("event channel closed");
            if matches!(event, EngineEvent::Progress { total_speed, .. } if total_speed > 0) {
                return event;
            }
        }
    }

    /// Events already emitted, progress ticks left out.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if !matches!(event, EngineEvent::Progress { .. }) {
                events.push(event);
            }
        }
        events
    }
}
