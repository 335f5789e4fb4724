use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::core::aria2::{Accelerator, ActiveStat};
use crate::core::events::JobProgress;
use crate::core::package::{RuntimePackage, TransferTable};
use crate::models::download::DownloadJob;

#[derive(Debug, Default, PartialEq)]
pub struct TickReport {
    pub total_speed: u64,
    pub jobs: Vec<JobProgress>,
    /// `(download_id, bytes_loaded)` rows due for persistence this tick.
    pub persist: Vec<(i64, u64)>,
}

/// Folds `tellActive` samples into the running jobs. Persistence is
/// throttled to one write per job every `persist_every` ticks.
#[derive(Debug)]
pub struct ProgressAggregator {
    ticks: u64,
    persist_every: u64,
}

impl ProgressAggregator {
    pub fn new(persist_every: u32) -> Self {
        Self {
            ticks: 0,
            persist_every: u64::from(persist_every.max(1)),
        }
    }

    pub fn reset(&mut self) {
        self.ticks = 0;
    }

    pub fn fold(
        &mut self,
        stats: &[ActiveStat],
        transfers: &TransferTable,
        packages: &mut HashMap<i64, RuntimePackage>,
        jobs: &mut HashMap<i64, DownloadJob>,
    ) -> TickReport {
        for stat in stats {
            let Some(transfer) = transfers.get(&stat.gid) else {
                tracing::trace!(gid = %stat.gid, "[progress] sample for untracked transfer");
                continue;
            };
            let Some(pkg) = packages.get_mut(&transfer.job_id) else {
                continue;
            };
            if transfer.fragment.is_some() {
                pkg.tick.speed += stat.speed;
                pkg.tick.connections += stat.connections;
                pkg.tick.loaded += stat.completed_length;
            } else {
                pkg.tick.speed = stat.speed;
                pkg.tick.connections = stat.connections;
                pkg.tick.loaded = stat.completed_length;
            }
        }

        self.ticks += 1;
        let persist_due = self.ticks % self.persist_every == 0;

        let mut report = TickReport::default();
        for (id, pkg) in packages.iter_mut() {
            let tick = std::mem::take(&mut pkg.tick);
            let Some(job) = jobs.get_mut(id) else {
                continue;
            };
            job.speed = tick.speed;
            job.connections = tick.connections;
            job.bytes_loaded = pkg.bytes_loaded + tick.loaded;
            report.total_speed += tick.speed;
            report.jobs.push(JobProgress {
                id: *id,
                bytes_loaded: job.bytes_loaded,
                speed_bytes_per_sec: job.speed,
                connections: job.connections,
            });
            if persist_due {
                report.persist.push((*id, job.bytes_loaded));
            }
        }
        report.jobs.sort_by_key(|j| j.id);
        report.persist.sort_by_key(|p| p.0);
        report
    }
}

/// Polls the accelerator every `interval` and hands each sample to `deliver`
/// together with a reply channel. The loop ends when the reply is `false`
/// (no running jobs left) or the receiving side is gone.
pub fn spawn_sampler<F>(
    accelerator: Arc<dyn Accelerator>,
    interval: Duration,
    deliver: F,
) -> JoinHandle<()>
where
    F: Fn(Vec<ActiveStat>, oneshot::Sender<bool>) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let stats = match accelerator.query_active().await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::warn!("[progress] tellActive failed: {}", e);
                    Vec::new()
                }
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if !deliver(stats, reply_tx) {
                break;
            }
            match reply_rx.await {
                Ok(true) => continue,
                _ => break,
            }
        }
        tracing::debug!("[progress] sampler stopped");
    })
}
