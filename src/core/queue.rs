use std::collections::HashSet;

use crate::core::orchestrator::EngineHandle;
use crate::models::download::DownloadJob;
use crate::storage::DownloadStore;

/// Which stored jobs the runner has handed to the engine. A job that
/// finished, whatever the outcome, is not started again in the same run.
#[derive(Debug, Default)]
pub struct RunQueue {
    active: HashSet<i64>,
    done: HashSet<i64>,
    max_concurrent: usize,
}

impl RunQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: HashSet::new(),
            done: HashSet::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn mark_finished(&mut self, id: i64) -> bool {
        let was_active = self.active.remove(&id);
        if was_active {
            self.done.insert(id);
        }
        was_active
    }

    /// Jobs to start now, in priority order, filling the free slots.
    pub fn next_runnable<'a>(&self, jobs: &'a [DownloadJob]) -> Vec<&'a DownloadJob> {
        let slots = self.max_concurrent.saturating_sub(self.active_count());
        let mut ordered: Vec<&DownloadJob> = jobs
            .iter()
            .filter(|j| j.enabled && !j.completed && j.has_variant())
            .filter(|j| !self.active.contains(&j.id) && !self.done.contains(&j.id))
            .collect();
        ordered.sort_by_key(|j| j.priority);
        ordered.truncate(slots);
        ordered
    }

    fn mark_active(&mut self, id: i64) {
        self.active.insert(id);
    }
}

/// Starts the next enabled, unfinished jobs by priority. Returns how many
/// were handed to the engine.
pub async fn try_start_next(
    queue: &mut RunQueue,
    store: &dyn DownloadStore,
    engine: &EngineHandle,
) -> anyhow::Result<usize> {
    let jobs = store.list_downloads().await?;
    let next: Vec<DownloadJob> = queue.next_runnable(&jobs).into_iter().cloned().collect();
    for job in &next {
        tracing::info!(download_id = job.id, "[queue] starting {}", job.video_id);
        queue.mark_active(job.id);
    }
    let started = next.len();
    for job in next {
        engine.start(job);
    }
    Ok(started)
}
