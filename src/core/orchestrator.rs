//! The download engine. One task owns every job, package and transfer;
//! accelerator notifications, progress samples, timers and the results of
//! merges, muxes and refreshes all arrive as messages on its queue, so no
//! state is shared across tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::aria2::{Accelerator, AcceleratorEvent, ActiveStat};
use crate::core::disk::SpaceProbe;
use crate::core::errors::{classify_transfer_error, MergeError, MuxError, TransferErrorKind};
use crate::core::events::{EngineEvent, EventEmitter};
use crate::core::fetch::{self, FetchContext, FetchResult, MergePlan};
use crate::core::ffmpeg::{self, MuxRequest, Muxer};
use crate::core::fragments::{self, FileStats};
use crate::core::ids::GidGenerator;
use crate::core::package::{ActiveTransfer, RuntimePackage, TransferTable};
use crate::core::progress::{self, ProgressAggregator};
use crate::core::refresh::{self, RefreshOrigin, RefreshOutcome, RefreshPolicy};
use crate::core::ytdlp::Resolver;
use crate::models::download::{DownloadJob, PartKind};
use crate::models::settings::EngineSettings;
use crate::storage::DownloadStore;

const NO_SPACE: &str = "No Space";
const UNKNOWN_ERROR: &str = "Unknown Error";
const MERGE_FAILED: &str = "Merge Failed";
const REFRESH_FAILED: &str = "Refresh Failed";
const STORAGE_ERROR: &str = "Storage Error";

/// Collaborators the engine drives.
pub struct EngineContext<E: EventEmitter> {
    pub accelerator: Arc<dyn Accelerator>,
    pub muxer: Arc<dyn Muxer>,
    pub resolver: Arc<dyn Resolver>,
    pub space: Arc<dyn SpaceProbe>,
    pub store: Arc<dyn DownloadStore>,
    pub emitter: E,
    pub settings: EngineSettings,
}

enum Command {
    Start(Box<DownloadJob>),
    Stop(i64),
    Refresh(Box<DownloadJob>),
    CancelRefresh(i64),
    SelectVariant {
        job: Box<DownloadJob>,
        variant_id: i32,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(i64, oneshot::Sender<Option<DownloadJob>>),
    Accelerator(AcceleratorEvent),
    ProgressSample {
        stats: Vec<ActiveStat>,
        reply: oneshot::Sender<bool>,
    },
    RetryDue(ActiveTransfer),
    MergeFinished {
        plan: MergePlan,
        result: Result<u64, MergeError>,
    },
    MuxFinished {
        id: i64,
        request: MuxRequest,
        result: Result<(), MuxError>,
    },
    RefreshFinished {
        id: i64,
        origin: RefreshOrigin,
        outcome: RefreshOutcome,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cheap handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("[engine] command dropped, engine is gone");
        }
    }

    pub fn start(&self, job: DownloadJob) {
        self.send(Command::Start(Box::new(job)));
    }

    pub fn stop(&self, id: i64) {
        self.send(Command::Stop(id));
    }

    pub fn refresh(&self, job: DownloadJob) {
        self.send(Command::Refresh(Box::new(job)));
    }

    pub fn cancel_refresh(&self, id: i64) {
        self.send(Command::CancelRefresh(id));
    }

    /// Switches an idle job to another of its variants. False when the job
    /// is busy or the variant cannot be used.
    pub async fn select_variant(&self, job: DownloadJob, variant_id: i32) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SelectVariant {
            job: Box::new(job),
            variant_id,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// The engine's view of a job it has seen, once every command sent
    /// before this one has been handled.
    pub async fn snapshot(&self, id: i64) -> Option<DownloadJob> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(id, reply));
        rx.await.ok().flatten()
    }

    /// Stops every running job and ends the engine task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply));
        let _ = rx.await;
    }
}

pub struct Orchestrator<E: EventEmitter> {
    ctx: EngineContext<E>,
    tx: mpsc::UnboundedSender<Command>,
    jobs: HashMap<i64, DownloadJob>,
    packages: HashMap<i64, RuntimePackage>,
    transfers: TransferTable,
    refreshes: HashMap<i64, CancellationToken>,
    gids: GidGenerator,
    aggregator: ProgressAggregator,
    sampler_running: bool,
}

impl<E: EventEmitter> Orchestrator<E> {
    /// Starts the engine task. `accelerator_events` is the notification
    /// stream of the same accelerator held in `ctx`.
    pub fn spawn(
        ctx: EngineContext<E>,
        mut accelerator_events: mpsc::UnboundedReceiver<AcceleratorEvent>,
    ) -> EngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let forward = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = accelerator_events.recv().await {
                if forward.send(Command::Accelerator(event)).is_err() {
                    break;
                }
            }
        });

        let persist_every = ctx.settings.advanced.persist_every_ticks;
        let engine = Orchestrator {
            ctx,
            tx: tx.clone(),
            jobs: HashMap::new(),
            packages: HashMap::new(),
            transfers: TransferTable::new(),
            refreshes: HashMap::new(),
            gids: GidGenerator::new(),
            aggregator: ProgressAggregator::new(persist_every),
            sampler_running: false,
        };
        tokio::spawn(engine.run(rx));

        EngineHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Start(job) => self.start(*job).await,
                Command::Stop(id) => self.stop(id).await,
                Command::Refresh(job) => self.user_refresh(*job),
                Command::CancelRefresh(id) => self.cancel_refresh(id),
                Command::SelectVariant {
                    job,
                    variant_id,
                    reply,
                } => {
                    let _ = reply.send(self.select_variant(*job, variant_id).await);
                }
                Command::Snapshot(id, reply) => {
                    let _ = reply.send(self.jobs.get(&id).cloned());
                }
                Command::Accelerator(event) => self.on_accelerator(event).await,
                Command::ProgressSample { stats, reply } => self.on_progress(stats, reply).await,
                Command::RetryDue(transfer) => self.retry_due(transfer).await,
                Command::MergeFinished { plan, result } => self.merge_finished(plan, result).await,
                Command::MuxFinished {
                    id,
                    request,
                    result,
                } => self.mux_finished(id, request, result).await,
                Command::RefreshFinished {
                    id,
                    origin,
                    outcome,
                } => self.refresh_finished(id, origin, outcome).await,
                Command::Shutdown(reply) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        tracing::info!("[engine] stopped");
    }

    fn max_parallel(&self) -> usize {
        self.ctx.settings.download.normalized_max_connections() as usize
    }

    // Start and sequencing

    async fn start(&mut self, mut job: DownloadJob) {
        let id = job.id;
        if self.packages.contains_key(&id) || self.refreshes.contains_key(&id) {
            tracing::debug!(download_id = id, "[engine] already active, start ignored");
            return;
        }
        if !job.has_variant() {
            tracing::warn!(download_id = id, "[engine] no compatible variant, not starting");
            self.jobs.insert(id, job);
            self.report_failure(id, REFRESH_FAILED, true).await;
            return;
        }

        let file_stats = match self.ctx.store.file_stats(id).await {
            Ok(rows) => FileStats::from_rows(rows),
            Err(e) => {
                tracing::error!(download_id = id, "[engine] failed to load file stats: {}", e);
                self.ctx.emitter.emit(EngineEvent::Error {
                    id,
                    message: STORAGE_ERROR.to_string(),
                });
                return;
            }
        };

        tracing::info!(
            download_id = id,
            "[engine] starting {} ({} known files)",
            job.video_id,
            file_stats.len()
        );
        job.set_downloading();
        self.jobs.insert(id, job);
        self.packages.insert(id, RuntimePackage::new(id, file_stats));
        self.ensure_sampler();
        self.advance(id).await;
    }

    /// Walks the parts in order, stopping at the first one that is not yet
    /// on disk. Re-entered after every direct part and every merge.
    async fn advance(&mut self, id: i64) {
        let accelerator = self.ctx.accelerator.clone();
        let max_parallel = self.max_parallel();
        let (Some(job), Some(pkg)) = (self.jobs.get_mut(&id), self.packages.get_mut(&id)) else {
            return;
        };

        pkg.bytes_loaded = 0;
        for kind in [PartKind::Video, PartKind::Audio] {
            job.set_fetching(kind);
            let mut cx = FetchContext {
                accelerator: accelerator.as_ref(),
                gids: &mut self.gids,
                transfers: &mut self.transfers,
                max_parallel,
            };
            match fetch::fetch_part(&mut cx, pkg, job, kind).await {
                FetchResult::Complete => continue,
                FetchResult::Pending => {
                    if pkg.ready_to_merge() {
                        self.begin_merge(id);
                    }
                    return;
                }
                FetchResult::Failed(reason) => {
                    tracing::error!(download_id = id, "[engine] cannot fetch {:?}: {}", kind, reason);
                    self.fail_job(id, UNKNOWN_ERROR, true).await;
                    return;
                }
            }
        }
        self.begin_mux(id);
    }

    fn ensure_sampler(&mut self) {
        if self.sampler_running {
            return;
        }
        self.sampler_running = true;
        self.aggregator.reset();
        let tx = self.tx.clone();
        let interval = Duration::from_millis(self.ctx.settings.advanced.progress_interval_ms);
        progress::spawn_sampler(self.ctx.accelerator.clone(), interval, move |stats, reply| {
            tx.send(Command::ProgressSample { stats, reply }).is_ok()
        });
    }

    // Merge and mux

    fn begin_merge(&mut self, id: i64) {
        let margin = self.ctx.settings.advanced.merge_safety_margin;
        let (Some(job), Some(pkg)) = (self.jobs.get(&id), self.packages.get_mut(&id)) else {
            return;
        };
        let Some(plan) = fetch::merge_plan(job, pkg, margin) else {
            return;
        };
        pkg.merging = true;
        tracing::debug!(download_id = id, "[merge] merging {} fragments", plan.fragments.len());

        let cancel = pkg.cancel.child_token();
        let space = self.ctx.space.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = fetch::merge_fragments(&plan, space.as_ref(), &cancel).await;
            let _ = tx.send(Command::MergeFinished { plan, result });
        });
    }

    async fn merge_finished(&mut self, plan: MergePlan, result: Result<u64, MergeError>) {
        let id = plan.job_id;
        let Some(pkg) = self.packages.get_mut(&id) else {
            tracing::debug!(download_id = id, "[merge] finished for an inactive job");
            return;
        };
        pkg.merging = false;

        match result {
            Ok(size) => {
                let store = &self.ctx.store;
                let persisted = async {
                    store.remove_file_stats(id, &plan.prefix).await?;
                    store.save_file_stat(id, &plan.prefix, size).await
                }
                .await;
                if let Err(e) = persisted {
                    tracing::error!(download_id = id, "[merge] failed to persist part size: {}", e);
                    self.fail_job(id, STORAGE_ERROR, false).await;
                    return;
                }
                pkg.file_stats.remove_prefix(&plan.prefix);
                pkg.file_stats.record(&plan.prefix, size);
                fetch::remove_fragment_files(&plan).await;
                tracing::info!(download_id = id, "[merge] {} merged, {} bytes", plan.prefix, size);
                self.advance(id).await;
            }
            Err(MergeError::Stopped) => {
                tracing::debug!(download_id = id, "[merge] stopped");
            }
            Err(e) => {
                tracing::error!(download_id = id, "[merge] failed: {}", e);
                self.fail_job(id, MERGE_FAILED, true).await;
            }
        }
    }

    fn begin_mux(&mut self, id: i64) {
        let (Some(job), Some(pkg)) = (self.jobs.get_mut(&id), self.packages.get_mut(&id)) else {
            return;
        };
        job.set_muxing();
        job.bytes_loaded = pkg.bytes_loaded;
        pkg.current = None;

        let job: &DownloadJob = job;
        let request = MuxRequest {
            video: fragments::part_path(job, job.part_itag(PartKind::Video)),
            audio: fragments::part_path(job, job.part_itag(PartKind::Audio)),
            output: job.output_path(),
            chapters: job.chapters.clone(),
            metadata_path: fragments::metadata_path(job),
        };
        tracing::info!(download_id = id, "[mux] muxing into {}", request.output.display());

        let cancel = pkg.cancel.child_token();
        let muxer = self.ctx.muxer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = muxer.mux(&request, cancel).await;
            let _ = tx.send(Command::MuxFinished {
                id,
                request,
                result,
            });
        });
    }

    async fn mux_finished(&mut self, id: i64, request: MuxRequest, result: Result<(), MuxError>) {
        let Some(bytes) = self.packages.get(&id).map(|p| p.bytes_loaded) else {
            tracing::debug!(download_id = id, "[mux] finished for an inactive job");
            return;
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.ctx.store.save_completed(id, bytes).await {
                    tracing::error!(download_id = id, "[mux] failed to persist completion: {}", e);
                    self.fail_job(id, STORAGE_ERROR, false).await;
                    return;
                }
                ffmpeg::remove_inputs(&request).await;
                self.packages.remove(&id);
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.set_completed(bytes);
                }
                self.ctx.emitter.emit(EngineEvent::Completed {
                    id,
                    bytes_loaded: bytes,
                });
            }
            Err(MuxError::Cancelled) => {
                tracing::debug!(download_id = id, "[mux] cancelled");
            }
            Err(e) => {
                tracing::error!(download_id = id, "[mux] failed: {}", e);
                self.fail_job(id, &e.job_message(), true).await;
            }
        }
    }

    // Accelerator notifications

    async fn on_accelerator(&mut self, event: AcceleratorEvent) {
        match event {
            AcceleratorEvent::Start(gid) => tracing::debug!(gid = %gid, "[aria2] start"),
            AcceleratorEvent::Pause(gid) => {
                tracing::warn!(gid = %gid, "[aria2] unexpected pause notification")
            }
            AcceleratorEvent::Stop(gid) => self.on_stop(gid).await,
            AcceleratorEvent::Complete(gid) => self.on_complete(gid).await,
            AcceleratorEvent::Error(gid) => self.on_error(gid).await,
            AcceleratorEvent::Disconnected => {
                tracing::error!("[aria2] connection lost");
                self.ctx.emitter.emit(EngineEvent::Fatal {
                    message: "aria2 connection lost".to_string(),
                });
            }
        }
    }

    async fn on_complete(&mut self, gid: String) {
        let Some(transfer) = self.transfers.remove(&gid) else {
            tracing::debug!(gid = %gid, "[aria2] completion for unknown transfer");
            return;
        };
        let id = transfer.job_id;
        let accelerator = self.ctx.accelerator.clone();
        let max_parallel = self.max_parallel();
        let size = match accelerator.query_status(&gid).await {
            Ok(status) => Some(status.completed_length),
            Err(e) => {
                tracing::warn!(gid = %gid, "[aria2] tellStatus failed: {}", e);
                tokio::fs::metadata(transfer.local_path())
                    .await
                    .map(|m| m.len())
                    .ok()
            }
        };
        let Some(pkg) = self.packages.get_mut(&id) else {
            return;
        };
        pkg.gids.remove(&gid);

        // Without a size the file cannot be trusted; fetch it again.
        let Some(size) = size else {
            if pkg.stopped {
                if transfer.fragment.is_some() {
                    pkg.in_flight = pkg.in_flight.saturating_sub(1);
                }
                self.finish_stop_if_idle(id);
                return;
            }
            tracing::warn!(
                download_id = id,
                gid = %gid,
                file_id = %transfer.file_id,
                "[engine] completed transfer has no known size"
            );
            self.schedule_retry(transfer);
            return;
        };
        if transfer.fragment.is_some() {
            pkg.in_flight = pkg.in_flight.saturating_sub(1);
        }

        if let Err(e) = self.ctx.store.save_file_stat(id, &transfer.file_id, size).await {
            tracing::error!(download_id = id, "[engine] failed to persist {}: {}", transfer.file_id, e);
            self.fail_job(id, STORAGE_ERROR, false).await;
            return;
        }
        pkg.file_stats.record(&transfer.file_id, size);
        pkg.bytes_loaded += size;
        tracing::debug!(
            download_id = id,
            gid = %gid,
            file_id = %transfer.file_id,
            "[engine] transfer complete, {} bytes",
            size
        );

        if pkg.stopped {
            self.finish_stop_if_idle(id);
            return;
        }
        if transfer.fragment.is_none() {
            self.advance(id).await;
            return;
        }

        let mut cx = FetchContext {
            accelerator: accelerator.as_ref(),
            gids: &mut self.gids,
            transfers: &mut self.transfers,
            max_parallel,
        };
        if let Err(e) = fetch::schedule_fragments(&mut cx, pkg).await {
            tracing::error!(download_id = id, "[fetch] failed to schedule fragments: {}", e);
            self.fail_job(id, UNKNOWN_ERROR, true).await;
            return;
        }
        if pkg.ready_to_merge() {
            self.begin_merge(id);
        }
    }

    async fn on_stop(&mut self, gid: String) {
        let Some(transfer) = self.transfers.remove(&gid) else {
            tracing::debug!(gid = %gid, "[aria2] stop for unknown transfer");
            return;
        };
        let id = transfer.job_id;
        let Some(pkg) = self.packages.get_mut(&id) else {
            return;
        };
        pkg.gids.remove(&gid);
        if transfer.fragment.is_some() {
            pkg.in_flight = pkg.in_flight.saturating_sub(1);
        }

        if !pkg.stopped {
            tracing::warn!(download_id = id, gid = %gid, "[engine] transfer removed outside of a stop");
            self.stop(id).await;
            return;
        }
        self.finish_stop_if_idle(id);
    }

    async fn on_error(&mut self, gid: String) {
        let Some(transfer) = self.transfers.remove(&gid) else {
            tracing::debug!(gid = %gid, "[aria2] error for unknown transfer");
            return;
        };
        let id = transfer.job_id;
        let status = match self.ctx.accelerator.query_status(&gid).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(gid = %gid, "[aria2] tellStatus failed: {}", e);
                Default::default()
            }
        };
        let Some(pkg) = self.packages.get_mut(&id) else {
            return;
        };
        pkg.gids.remove(&gid);
        tracing::error!(
            download_id = id,
            gid = %gid,
            file_id = %transfer.file_id,
            "[aria2] transfer error {}: {}",
            status.error_code,
            status.error_message
        );

        if pkg.stopped {
            if transfer.fragment.is_some() {
                pkg.in_flight = pkg.in_flight.saturating_sub(1);
            }
            self.finish_stop_if_idle(id);
            return;
        }

        let mut kind = classify_transfer_error(&status.error_code, &status.error_message);
        if kind == TransferErrorKind::Aborted {
            kind = if fetch::clear_empty_control_file(&transfer).await {
                TransferErrorKind::Transient
            } else {
                TransferErrorKind::Unknown
            };
        }

        match kind {
            TransferErrorKind::Expired => {
                tracing::info!(download_id = id, "[engine] link expired, refreshing");
                self.abandon(id).await;
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.set_refreshing(true);
                }
                self.spawn_refresh(id, RefreshOrigin::Expired);
            }
            TransferErrorKind::Transient => self.schedule_retry(transfer),
            TransferErrorKind::DiskFull => self.fail_job(id, NO_SPACE, true).await,
            TransferErrorKind::Aborted | TransferErrorKind::Unknown => {
                self.fail_job(id, UNKNOWN_ERROR, true).await
            }
        }
    }

    fn schedule_retry(&mut self, transfer: ActiveTransfer) {
        let Some(pkg) = self.packages.get(&transfer.job_id) else {
            return;
        };
        let delay = Duration::from_millis(self.ctx.settings.advanced.retry_delay_ms);
        tracing::debug!(
            download_id = transfer.job_id,
            file_id = %transfer.file_id,
            "[engine] retrying in {:?}",
            delay
        );

        let cancel = pkg.cancel.child_token();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Command::RetryDue(transfer));
                }
            }
        });
    }

    async fn retry_due(&mut self, transfer: ActiveTransfer) {
        let id = transfer.job_id;
        let accelerator = self.ctx.accelerator.clone();
        let max_parallel = self.max_parallel();
        let Some(pkg) = self.packages.get_mut(&id) else {
            return;
        };
        if pkg.stopped {
            return;
        }

        let mut cx = FetchContext {
            accelerator: accelerator.as_ref(),
            gids: &mut self.gids,
            transfers: &mut self.transfers,
            max_parallel,
        };
        if let Err(e) = fetch::issue_transfer(&mut cx, pkg, transfer).await {
            tracing::error!(download_id = id, "[engine] retry failed: {}", e);
            self.fail_job(id, UNKNOWN_ERROR, true).await;
        }
    }

    // Stop and failure

    async fn stop(&mut self, id: i64) {
        if let Some(token) = self.refreshes.get(&id) {
            tracing::debug!(download_id = id, "[engine] cancelling refresh");
            token.cancel();
            return;
        }
        let accelerator = self.ctx.accelerator.clone();
        let Some(pkg) = self.packages.get_mut(&id) else {
            tracing::debug!(download_id = id, "[engine] stop for inactive job");
            return;
        };
        if pkg.stopped {
            return;
        }
        pkg.stopped = true;
        pkg.cancel.cancel();

        let gids: Vec<String> = pkg.gids.iter().cloned().collect();
        for gid in gids {
            if let Err(e) = accelerator.remove_transfer(&gid).await {
                tracing::warn!(download_id = id, gid = %gid, "[engine] remove failed: {}", e);
                pkg.gids.remove(&gid);
                if let Some(t) = self.transfers.remove(&gid) {
                    if t.fragment.is_some() {
                        pkg.in_flight = pkg.in_flight.saturating_sub(1);
                    }
                }
            }
        }

        let bytes = self
            .jobs
            .get(&id)
            .map(|j| j.bytes_loaded)
            .unwrap_or_default()
            .max(pkg.bytes_loaded);
        if let Err(e) = self.ctx.store.save_progress(id, bytes).await {
            tracing::error!(download_id = id, "[engine] failed to persist progress: {}", e);
        }
        tracing::info!(download_id = id, "[engine] stopping, {} transfers pending", pkg.gids.len());
        self.finish_stop_if_idle(id);
    }

    fn finish_stop_if_idle(&mut self, id: i64) {
        let Some(pkg) = self.packages.get(&id) else {
            return;
        };
        if !pkg.gids.is_empty() {
            return;
        }
        self.packages.remove(&id);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.set_stopped();
        }
        self.ctx.emitter.emit(EngineEvent::Stopped { id });
    }

    /// Drops the package and tells the accelerator to let go of whatever it
    /// still runs for it.
    async fn abandon(&mut self, id: i64) {
        let Some(pkg) = self.packages.remove(&id) else {
            return;
        };
        pkg.cancel.cancel();
        for gid in &pkg.gids {
            self.transfers.remove(gid);
            if let Err(e) = self.ctx.accelerator.remove_transfer(gid).await {
                tracing::warn!(download_id = id, gid = %gid, "[engine] remove failed: {}", e);
            }
        }
    }

    async fn fail_job(&mut self, id: i64, message: &str, disable: bool) {
        self.abandon(id).await;
        self.report_failure(id, message, disable).await;
    }

    async fn report_failure(&mut self, id: i64, message: &str, disable: bool) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        job.set_failed(message, disable);
        let bytes = job.bytes_loaded;

        let store = &self.ctx.store;
        let persisted = async {
            store.set_error(id, Some(message)).await?;
            if disable {
                store.set_enabled(&[id], false).await?;
            }
            store.save_progress(id, bytes).await
        }
        .await;
        if let Err(e) = persisted {
            tracing::error!(download_id = id, "[engine] failed to persist error state: {}", e);
        }

        self.ctx.emitter.emit(EngineEvent::Error {
            id,
            message: message.to_string(),
        });
    }

    // Refresh

    fn user_refresh(&mut self, mut job: DownloadJob) {
        let id = job.id;
        let busy = self.packages.contains_key(&id) || self.refreshes.contains_key(&id);
        if busy || job.enabled || job.completed {
            tracing::warn!(download_id = id, "[refresh] job is queued, busy or done, refresh rejected");
            self.ctx
                .emitter
                .emit(EngineEvent::RefreshFinished { id, success: false });
            return;
        }
        job.set_refreshing(true);
        self.jobs.insert(id, job);
        self.spawn_refresh(id, RefreshOrigin::User);
    }

    fn cancel_refresh(&mut self, id: i64) {
        if let Some(token) = self.refreshes.get(&id) {
            token.cancel();
        }
    }

    async fn select_variant(&mut self, mut job: DownloadJob, variant_id: i32) -> bool {
        let id = job.id;
        if self.packages.contains_key(&id) || self.refreshes.contains_key(&id) {
            tracing::warn!(download_id = id, "[engine] job is busy, variant change rejected");
            return false;
        }
        if let Err(e) = refresh::override_variant(&mut job, variant_id, self.ctx.store.as_ref()).await {
            tracing::error!(download_id = id, "[engine] variant change failed: {}", e);
            return false;
        }
        self.jobs.insert(id, job);
        true
    }

    fn spawn_refresh(&mut self, id: i64, origin: RefreshOrigin) {
        let Some(job) = self.jobs.get(&id).cloned() else {
            return;
        };
        let token = CancellationToken::new();
        self.refreshes.insert(id, token.clone());

        let policy = RefreshPolicy::for_origin(origin, &self.ctx.settings.advanced);
        let resolver = self.ctx.resolver.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = refresh::refresh_job(resolver.as_ref(), &job, &policy, &token).await;
            let _ = tx.send(Command::RefreshFinished { id, origin, outcome });
        });
    }

    async fn refresh_finished(&mut self, id: i64, origin: RefreshOrigin, outcome: RefreshOutcome) {
        self.refreshes.remove(&id);
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };

        let applied = match outcome {
            RefreshOutcome::Cancelled => {
                job.set_stopped();
                let event = match origin {
                    RefreshOrigin::Expired => EngineEvent::Stopped { id },
                    RefreshOrigin::User => EngineEvent::RefreshFinished { id, success: false },
                };
                self.ctx.emitter.emit(event);
                return;
            }
            RefreshOutcome::Failed(reason) => {
                tracing::warn!(download_id = id, "[refresh] failed: {}", reason);
                false
            }
            RefreshOutcome::Updated(refreshed) => {
                match refresh::apply_refresh(job, *refreshed, self.ctx.store.as_ref()).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(download_id = id, "[refresh] failed to apply: {}", e);
                        false
                    }
                }
            }
        };

        if !applied {
            self.report_failure(id, REFRESH_FAILED, true).await;
            if origin == RefreshOrigin::User {
                self.ctx
                    .emitter
                    .emit(EngineEvent::RefreshFinished { id, success: false });
            }
            return;
        }

        job.set_refreshing(false);
        match origin {
            RefreshOrigin::Expired if job.enabled && job.has_variant() => {
                let next = job.clone();
                self.start(next).await;
            }
            RefreshOrigin::Expired => self.report_failure(id, REFRESH_FAILED, true).await,
            RefreshOrigin::User => {
                self.ctx
                    .emitter
                    .emit(EngineEvent::RefreshFinished { id, success: true });
            }
        }
    }

    // Progress

    async fn on_progress(&mut self, stats: Vec<ActiveStat>, reply: oneshot::Sender<bool>) {
        if self.packages.is_empty() {
            self.sampler_running = false;
            let _ = reply.send(false);
            return;
        }

        let report = self
            .aggregator
            .fold(&stats, &self.transfers, &mut self.packages, &mut self.jobs);
        for &(id, bytes) in &report.persist {
            if let Err(e) = self.ctx.store.save_progress(id, bytes).await {
                tracing::warn!(download_id = id, "[progress] failed to persist: {}", e);
            }
        }
        self.ctx.emitter.emit(EngineEvent::Progress {
            total_speed: report.total_speed,
            jobs: report.jobs,
        });
        let _ = reply.send(true);
    }

    async fn shutdown(&mut self) {
        for token in self.refreshes.values() {
            token.cancel();
        }
        let ids: Vec<i64> = self.packages.keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::aria2::TransferStatus;
    use crate::core::testing::{eventually, Harness};
    use crate::core::variants;
    use crate::models::download::{fixtures, JobPhase};
    use crate::models::media::Protocol;

    fn failed_status(code: &str, message: &str) -> TransferStatus {
        TransferStatus {
            error_code: code.to_string(),
            error_message: message.to_string(),
            completed_length: 0,
        }
    }

    #[tokio::test]
    async fn direct_parts_download_then_mux() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;

        h.engine.start(job);
        h.barrier(id).await;
        let video = h.accelerator.added();
        assert_eq!(video.len(), 1);
        assert!(!video[0].single_connection);
        h.complete(&video[0].gid, &[1u8; 1000]);

        eventually(|| h.accelerator.added().len() == 2).await;
        let audio = h.accelerator.added()[1].clone();
        assert_eq!(audio.filename, "dQw4w9WgXcQ_u1_140.part");
        h.complete(&audio.gid, &[2u8; 500]);

        assert_eq!(
            h.next_event().await,
            EngineEvent::Completed {
                id,
                bytes_loaded: 1500
            }
        );
        let requests = h.muxer.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].video.ends_with("dQw4w9WgXcQ_u1_137.part"));
        assert!(requests[0].audio.ends_with("dQw4w9WgXcQ_u1_140.part"));
        assert!(!requests[0].video.exists());
        assert!(!requests[0].audio.exists());
        assert!(requests[0].output.exists());

        let snapshot = h.engine.snapshot(id).await.unwrap();
        assert!(snapshot.completed);
        assert!(!snapshot.enabled);
        assert_eq!(snapshot.phase, JobPhase::Completed);
        assert_eq!(snapshot.active_flag_count(), 1);

        let stored = h.store.list_downloads().await.unwrap().remove(0);
        assert!(stored.completed);
        assert_eq!(stored.bytes_loaded, 1500);
        assert!(h.store.file_stats(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_fragment_error_is_retried_before_merge() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::segmented_job(h.dir.path(), 4)).await;
        let id = job.id;
        let part = fragments::part_path(&job, "137");
        let frag_dir = fragments::fragments_dir(&job, "137");

        h.engine.start(job);
        h.barrier(id).await;
        let issued = h.accelerator.added();
        assert_eq!(issued.len(), 4);
        assert!(issued.iter().all(|r| r.single_connection));

        h.complete(&issued[0].gid, b"aa");
        h.complete(&issued[1].gid, b"bb");
        h.complete(&issued[3].gid, b"dd");
        h.accelerator
            .set_status(&issued[2].gid, failed_status("2", "Timeout."));
        h.notify(AcceleratorEvent::Error(issued[2].gid.clone()));
        h.barrier(id).await;

        assert_eq!(h.accelerator.added().len(), 4);
        assert!(!part.exists());
        assert!(h.engine.snapshot(id).await.unwrap().enabled);

        eventually(|| h.accelerator.added().len() == 5).await;
        let retry = h.accelerator.added()[4].clone();
        assert_eq!(retry.filename, issued[2].filename);
        assert_eq!(retry.dir, issued[2].dir);
        assert_ne!(retry.gid, issued[2].gid);
        assert!(retry.single_connection);
        h.barrier(id).await;
        assert!(!part.exists());

        h.complete(&retry.gid, b"cc");
        eventually(|| h.accelerator.added().len() == 6).await;
        assert_eq!(std::fs::read(&part).unwrap(), b"aabbccdd");
        assert!(!frag_dir.exists());

        let mut stats = h.store.file_stats(id).await.unwrap();
        stats.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].file_id, "v");
        assert_eq!(stats[0].filesize, 8);

        let audio = h.accelerator.added()[5].clone();
        h.complete(&audio.gid, b"audio");
        assert_eq!(
            h.next_event().await,
            EngineEvent::Completed {
                id,
                bytes_loaded: 13
            }
        );
    }

    #[tokio::test]
    async fn stop_waits_for_every_transfer() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::segmented_job(h.dir.path(), 3)).await;
        let id = job.id;

        h.engine.start(job);
        h.barrier(id).await;
        let issued = h.accelerator.added();
        assert_eq!(issued.len(), 3);

        h.engine.stop(id);
        h.barrier(id).await;
        let mut removed = h.accelerator.removed();
        removed.sort();
        let mut expected: Vec<String> = issued.iter().map(|r| r.gid.clone()).collect();
        expected.sort();
        assert_eq!(removed, expected);

        h.notify(AcceleratorEvent::Stop(issued[0].gid.clone()));
        h.notify(AcceleratorEvent::Stop(issued[1].gid.clone()));
        h.barrier(id).await;
        assert!(!h.drain_events().contains(&EngineEvent::Stopped { id }));
        assert!(h.engine.snapshot(id).await.unwrap().downloading);

        h.notify(AcceleratorEvent::Stop(issued[2].gid.clone()));
        assert_eq!(h.next_event().await, EngineEvent::Stopped { id });

        let snapshot = h.engine.snapshot(id).await.unwrap();
        assert!(!snapshot.downloading);
        assert!(snapshot.enabled);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn stop_of_failed_job_is_a_no_op() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        h.accelerator.fail_adds(true);
        h.engine.start(job);
        // the failed add already ended the job
        assert_eq!(
            h.next_event().await,
            EngineEvent::Error {
                id,
                message: "Unknown Error".to_string()
            }
        );
        h.engine.stop(id);
        h.barrier(id).await;
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn merge_without_space_fails_the_job() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::segmented_job(h.dir.path(), 2)).await;
        let id = job.id;
        let part = fragments::part_path(&job, "137");
        h.space.set(10);

        h.engine.start(job);
        h.barrier(id).await;
        let issued = h.accelerator.added();
        h.complete(&issued[0].gid, &[0u8; 100]);
        h.complete(&issued[1].gid, &[1u8; 100]);

        assert_eq!(
            h.next_event().await,
            EngineEvent::Error {
                id,
                message: "Merge Failed".to_string()
            }
        );
        assert!(!part.exists());
        assert_eq!(h.store.file_stats(id).await.unwrap().len(), 2);

        let snapshot = h.engine.snapshot(id).await.unwrap();
        assert!(!snapshot.enabled);
        assert!(!snapshot.downloading);
        let stored = h.store.list_downloads().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].error.as_deref(), Some("Merge Failed"));
    }

    #[tokio::test]
    async fn whitelisted_code_retries_exactly_once() {
        for code in ["1", "2", "6", "19", "22", "23", "24", "29"] {
            let h = Harness::new().await;
            let job = h.add_job(fixtures::job(h.dir.path())).await;
            let id = job.id;
            h.engine.start(job);
            h.barrier(id).await;

            let first = h.accelerator.added()[0].clone();
            h.accelerator.set_status(&first.gid, failed_status(code, "network"));
            h.notify(AcceleratorEvent::Error(first.gid.clone()));

            eventually(|| h.accelerator.added().len() == 2).await;
            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(h.accelerator.added().len(), 2, "code {code}");
            let snapshot = h.engine.snapshot(id).await.unwrap();
            assert!(snapshot.enabled, "code {code}");
            assert!(snapshot.error.is_none(), "code {code}");
        }
    }

    #[tokio::test]
    async fn other_codes_disable_the_job() {
        for (code, message) in [("5", "Unknown Error"), ("9", "No Space"), ("13", "Unknown Error")] {
            let mut h = Harness::new().await;
            let job = h.add_job(fixtures::job(h.dir.path())).await;
            let id = job.id;
            h.engine.start(job);
            h.barrier(id).await;

            let first = h.accelerator.added()[0].clone();
            h.accelerator.set_status(&first.gid, failed_status(code, "boom"));
            h.notify(AcceleratorEvent::Error(first.gid.clone()));

            assert_eq!(
                h.next_event().await,
                EngineEvent::Error {
                    id,
                    message: message.to_string()
                }
            );
            assert!(!h.engine.snapshot(id).await.unwrap().enabled);
            assert!(!h.store.list_downloads().await.unwrap()[0].enabled);
            assert_eq!(h.accelerator.added().len(), 1);
        }
    }

    #[tokio::test]
    async fn aborted_transfer_retries_only_with_empty_control_file() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        h.engine.start(job);
        h.barrier(id).await;

        let first = h.accelerator.added()[0].clone();
        let control = first.dir.join(format!("{}.aria2", first.filename));
        std::fs::write(&control, b"").unwrap();
        h.accelerator
            .set_status(&first.gid, failed_status("1", "Download aborted."));
        h.notify(AcceleratorEvent::Error(first.gid.clone()));
        eventually(|| h.accelerator.added().len() == 2).await;
        assert!(!control.exists());

        let second = h.accelerator.added()[1].clone();
        h.accelerator
            .set_status(&second.gid, failed_status("1", "Download aborted."));
        h.notify(AcceleratorEvent::Error(second.gid.clone()));
        assert_eq!(
            h.next_event().await,
            EngineEvent::Error {
                id,
                message: "Unknown Error".to_string()
            }
        );
    }

    #[tokio::test]
    async fn expired_link_refreshes_and_resumes() {
        let h = Harness::new().await;
        let job = variants::new_job(
            "dQw4w9WgXcQ",
            &variants::fixtures::resolved(),
            h.dir.path(),
            "*TITLE*",
        )
        .unwrap();
        let job = h.add_job(job).await;
        let id = job.id;
        h.resolver.push_video(Ok(variants::fixtures::resolved()));

        h.engine.start(job);
        h.barrier(id).await;
        let first = h.accelerator.added()[0].clone();
        h.accelerator
            .set_status(&first.gid, failed_status("22", "status=403"));
        h.notify(AcceleratorEvent::Error(first.gid.clone()));

        eventually(|| h.accelerator.added().len() == 2).await;
        let resumed = h.accelerator.added()[1].clone();
        assert_eq!(resumed.filename, first.filename);
        assert_ne!(resumed.gid, first.gid);
        assert_eq!(h.resolver.video_calls(), 1);

        let snapshot = h.engine.snapshot(id).await.unwrap();
        assert!(snapshot.downloading);
        assert!(!snapshot.refreshing);
        assert!(snapshot.enabled);
        assert_eq!(snapshot.active_flag_count(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_after_expiry_disables() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        h.resolver.push_video(Err(crate::core::errors::ResolveError::Unavailable(
            "Video unavailable".to_string(),
        )));

        h.engine.start(job);
        h.barrier(id).await;
        let first = h.accelerator.added()[0].clone();
        h.accelerator.set_status(&first.gid, failed_status("3", ""));
        h.notify(AcceleratorEvent::Error(first.gid.clone()));

        assert_eq!(
            h.next_event().await,
            EngineEvent::Error {
                id,
                message: "Refresh Failed".to_string()
            }
        );
        let snapshot = h.engine.snapshot(id).await.unwrap();
        assert!(!snapshot.enabled);
        assert!(!snapshot.refreshing);
    }

    #[tokio::test]
    async fn user_refresh_purges_part_with_new_source() {
        let mut h = Harness::new().await;
        let mut job = variants::new_job(
            "dQw4w9WgXcQ",
            &variants::fixtures::resolved(),
            h.dir.path(),
            "*TITLE*",
        )
        .unwrap();
        let avc = job
            .variants
            .iter()
            .find(|v| v.v_format_id == "137" && v.a_format_id == "140")
            .cloned()
            .unwrap();
        job.selected_variant = variants::select_variant(&avc, &job.formats).unwrap();
        job.selected_variant.v_protocol = Protocol::Segmented;
        job.selected_variant.v_format_id = "137-dash".to_string();
        job.enabled = false;
        let job = h.add_job(job).await;
        let id = job.id;
        let old_part = fragments::part_path(&job, "137");
        std::fs::write(&old_part, b"old source").unwrap();

        h.resolver.push_video(Ok(variants::fixtures::resolved()));
        h.engine.refresh(job);
        assert_eq!(
            h.next_event().await,
            EngineEvent::RefreshFinished { id, success: true }
        );
        let snapshot = h.engine.snapshot(id).await.unwrap();
        assert_eq!(snapshot.selected_variant.v_format_id, "137-dash");
        assert_eq!(snapshot.selected_variant.v_protocol, Protocol::Segmented);
        assert!(!snapshot.refreshing);
        assert!(!snapshot.enabled);
        // the dash twin carries no lmt, so the old part cannot be resumed
        assert!(!old_part.exists());
    }

    #[tokio::test]
    async fn refresh_of_running_job_is_rejected() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        h.engine.start(job.clone());
        h.engine.refresh(job);
        assert_eq!(
            h.next_event().await,
            EngineEvent::RefreshFinished { id, success: false }
        );
        assert_eq!(h.resolver.video_calls(), 0);
    }

    #[tokio::test]
    async fn refresh_of_queued_or_completed_job_is_rejected() {
        let mut h = Harness::new().await;
        let queued = h.add_job(fixtures::job(h.dir.path())).await;
        let mut done = fixtures::job(h.dir.path());
        done.set_completed(1500);
        let done = h.add_job(done).await;
        h.store.save_completed(done.id, 1500).await.unwrap();
        h.resolver.hang(true);

        for job in [queued, done] {
            let id = job.id;
            h.engine.refresh(job);
            assert_eq!(
                h.next_event().await,
                EngineEvent::RefreshFinished { id, success: false }
            );
            assert!(h.engine.snapshot(id).await.is_none());
        }
        assert_eq!(h.resolver.video_calls(), 0);

        let stored = h.store.list_downloads().await.unwrap();
        assert!(stored[1].completed);
        assert_eq!(stored[1].bytes_loaded, 1500);
    }

    #[tokio::test]
    async fn stop_during_refresh_reports_stopped() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        h.resolver.hang(true);

        h.engine.start(job);
        h.barrier(id).await;
        let first = h.accelerator.added()[0].clone();
        h.accelerator.set_status(&first.gid, failed_status("3", ""));
        h.notify(AcceleratorEvent::Error(first.gid.clone()));
        eventually(|| h.resolver.video_calls() == 1).await;
        assert!(h.engine.snapshot(id).await.unwrap().refreshing);

        h.engine.stop(id);
        assert_eq!(h.next_event().await, EngineEvent::Stopped { id });
        let snapshot = h.engine.snapshot(id).await.unwrap();
        assert!(!snapshot.refreshing);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn progress_is_reported_and_persisted() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        h.engine.start(job);
        h.barrier(id).await;

        let first = h.accelerator.added()[0].clone();
        h.accelerator.set_active(vec![ActiveStat {
            gid: first.gid.clone(),
            completed_length: 300,
            connections: 4,
            speed: 1000,
        }]);

        let progress = h.next_progress().await;
        let EngineEvent::Progress { total_speed, jobs } = progress else {
            panic!("expected progress");
        };
        assert_eq!(total_speed, 1000);
        assert_eq!(jobs[0].bytes_loaded, 300);
        assert_eq!(jobs[0].connections, 4);

        let store = h.store.clone();
        let mut persisted = false;
        for _ in 0..100 {
            if store.list_downloads().await.unwrap()[0].bytes_loaded == 300 {
                persisted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(persisted);
    }

    #[tokio::test]
    async fn resumed_job_skips_parts_on_disk() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        std::fs::write(fragments::part_path(&job, "137"), [0u8; 64]).unwrap();
        std::fs::write(fragments::part_path(&job, "140"), [0u8; 32]).unwrap();
        h.store.save_file_stat(id, "v", 64).await.unwrap();
        h.store.save_file_stat(id, "a", 32).await.unwrap();

        h.engine.start(job);
        assert_eq!(
            h.next_event().await,
            EngineEvent::Completed {
                id,
                bytes_loaded: 96
            }
        );
        assert!(h.accelerator.added().is_empty());
    }

    #[tokio::test]
    async fn mux_failure_disables_with_reason() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        std::fs::write(fragments::part_path(&job, "137"), [0u8; 4]).unwrap();
        std::fs::write(fragments::part_path(&job, "140"), [0u8; 4]).unwrap();
        h.store.save_file_stat(id, "v", 4).await.unwrap();
        h.store.save_file_stat(id, "a", 4).await.unwrap();
        h.muxer.fail_with(MuxError::NoSpace);

        h.engine.start(job);
        assert_eq!(
            h.next_event().await,
            EngineEvent::Error {
                id,
                message: "Mux Failed (No Space)".to_string()
            }
        );
        assert!(!h.engine.snapshot(id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn completion_without_known_size_is_fetched_again() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        h.engine.start(job);
        h.barrier(id).await;

        let first = h.accelerator.added()[0].clone();
        h.accelerator.fail_status_queries(true);
        h.notify(AcceleratorEvent::Complete(first.gid.clone()));
        h.barrier(id).await;
        assert!(h.store.file_stats(id).await.unwrap().is_empty());
        assert_eq!(h.accelerator.added().len(), 1);

        eventually(|| h.accelerator.added().len() == 2).await;
        let again = h.accelerator.added()[1].clone();
        assert_eq!(again.filename, first.filename);
        assert_ne!(again.gid, first.gid);

        h.accelerator.fail_status_queries(false);
        h.complete(&again.gid, &[1u8; 1000]);
        eventually(|| h.accelerator.added().len() == 3).await;
        let stats = h.store.file_stats(id).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].filesize, 1000);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn mux_inputs_survive_a_failed_completion_write() {
        let mut h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;
        let video = fragments::part_path(&job, "137");
        let audio = fragments::part_path(&job, "140");
        std::fs::write(&video, [0u8; 4]).unwrap();
        std::fs::write(&audio, [0u8; 4]).unwrap();
        h.store.save_file_stat(id, "v", 4).await.unwrap();
        h.store.save_file_stat(id, "a", 4).await.unwrap();
        h.muxer.hold(true);

        h.engine.start(job);
        eventually(|| h.muxer.requests().len() == 1).await;
        h.store.remove_downloads(&[id]).await.unwrap();
        h.muxer.hold(false);

        assert_eq!(
            h.next_event().await,
            EngineEvent::Error {
                id,
                message: "Storage Error".to_string()
            }
        );
        assert!(video.exists());
        assert!(audio.exists());
    }

    #[tokio::test]
    async fn selecting_another_variant_purges_the_superseded_part() {
        let h = Harness::new().await;
        let job = variants::new_job(
            "dQw4w9WgXcQ",
            &variants::fixtures::resolved(),
            h.dir.path(),
            "*TITLE*",
        )
        .unwrap();
        let job = h.add_job(job).await;
        let id = job.id;
        assert_eq!(job.selected_variant.v_itag, "248");
        assert_eq!(job.selected_variant.a_itag, "251");
        let old_video = fragments::part_path(&job, "248");
        let audio = fragments::part_path(&job, "251");
        std::fs::write(&old_video, [0u8; 8]).unwrap();
        std::fs::write(&audio, [0u8; 4]).unwrap();
        h.store.save_file_stat(id, "v", 8).await.unwrap();
        h.store.save_file_stat(id, "a", 4).await.unwrap();

        let avc_opus = job
            .variants
            .iter()
            .find(|v| v.v_format_id == "137" && v.a_format_id == "251")
            .map(|v| v.id)
            .unwrap();
        assert!(h.engine.select_variant(job, avc_opus).await);

        assert!(!old_video.exists());
        assert!(audio.exists());
        let stats = h.store.file_stats(id).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].file_id, "a");

        let stored = h.store.list_downloads().await.unwrap().remove(0);
        assert_eq!(stored.selected_variant.id, avc_opus);
        assert_eq!(stored.selected_variant.v_itag, "137");
        assert_eq!(stored.filesize, 1310);
        assert_eq!(stored.container, "mp4");
        assert_eq!(
            h.engine.snapshot(id).await.unwrap().selected_variant.v_itag,
            "137"
        );
    }

    #[tokio::test]
    async fn variant_change_is_rejected_while_running_or_unknown() {
        let h = Harness::new().await;
        let job = h.add_job(fixtures::job(h.dir.path())).await;
        let id = job.id;

        assert!(!h.engine.select_variant(job.clone(), 99).await);

        h.engine.start(job.clone());
        h.barrier(id).await;
        assert!(!h.engine.select_variant(job, 0).await);
        let stored = h.store.list_downloads().await.unwrap().remove(0);
        assert_eq!(stored.selected_variant.v_itag, "137");
    }

    #[tokio::test]
    async fn lost_connection_is_fatal() {
        let mut h = Harness::new().await;
        h.notify(AcceleratorEvent::Disconnected);
        assert!(matches!(h.next_event().await, EngineEvent::Fatal { .. }));
    }

    #[tokio::test]
    async fn unknown_gids_are_ignored() {
        let mut h = Harness::new().await;
        h.notify(AcceleratorEvent::Complete("0123456789abcdef".to_string()));
        h.notify(AcceleratorEvent::Error("0123456789abcdef".to_string()));
        h.notify(AcceleratorEvent::Stop("0123456789abcdef".to_string()));
        h.barrier(0).await;
        assert!(h.drain_events().is_empty());
    }
}
