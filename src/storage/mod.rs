pub mod config;
pub mod sqlite;

use async_trait::async_trait;

use crate::models::download::{DownloadJob, FileStat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Persistence for download records and their confirmed file sizes.
///
/// Priorities are kept as the contiguous sequence `1..=n` by every operation
/// that adds, removes or reorders records.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    /// Inserts the job at the end of the queue and returns its id and priority.
    async fn add_download(&self, job: &DownloadJob) -> anyhow::Result<(i64, i64)>;
    async fn list_downloads(&self) -> anyhow::Result<Vec<DownloadJob>>;
    async fn update_download(&self, job: &DownloadJob) -> anyhow::Result<()>;

    async fn file_stats(&self, download_id: i64) -> anyhow::Result<Vec<FileStat>>;
    async fn save_file_stat(
        &self,
        download_id: i64,
        file_id: &str,
        filesize: u64,
    ) -> anyhow::Result<()>;
    /// Deletes the rows whose file id starts with `prefix`; an empty prefix
    /// deletes every row of the download.
    async fn remove_file_stats(&self, download_id: i64, prefix: &str) -> anyhow::Result<()>;

    async fn save_progress(&self, download_id: i64, bytes_loaded: u64) -> anyhow::Result<()>;
    async fn save_completed(&self, download_id: i64, bytes_loaded: u64) -> anyhow::Result<()>;
    async fn set_enabled(&self, ids: &[i64], enabled: bool) -> anyhow::Result<()>;
    async fn set_error(&self, download_id: i64, error: Option<&str>) -> anyhow::Result<()>;

    async fn remove_downloads(&self, ids: &[i64]) -> anyhow::Result<()>;
    /// Applies `(id, offset)` priority changes in one transaction.
    async fn update_priorities(&self, changes: &[(i64, i64)]) -> anyhow::Result<()>;

    async fn move_up(&self, ids: &[i64]) -> anyhow::Result<()> {
        self.reorder(ids, Direction::Up).await
    }

    async fn move_down(&self, ids: &[i64]) -> anyhow::Result<()> {
        self.reorder(ids, Direction::Down).await
    }

    async fn reorder(&self, ids: &[i64], direction: Direction) -> anyhow::Result<()> {
        let order: Vec<i64> = self
            .list_downloads()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let changes = reorder_changes(&order, ids, direction);
        if changes.is_empty() {
            return Ok(());
        }
        self.update_priorities(&changes).await
    }
}

/// Computes the `(id, offset)` changes that move every selected id one slot
/// in `direction`. Each run of adjacent selected ids swaps with the
/// neighbour in front of it. Nothing moves if the selection already touches
/// the edge.
pub fn reorder_changes(order: &[i64], selected: &[i64], direction: Direction) -> Vec<(i64, i64)> {
    let mut positions: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, id)| selected.contains(id))
        .map(|(i, _)| i)
        .collect();
    positions.sort_unstable();

    let (Some(&first), Some(&last)) = (positions.first(), positions.last()) else {
        return Vec::new();
    };
    let at_edge = match direction {
        Direction::Up => first == 0,
        Direction::Down => last + 1 == order.len(),
    };
    if at_edge {
        return Vec::new();
    }

    let mut runs: Vec<(usize, usize)> = Vec::new();
    for pos in positions {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == pos => *end = pos,
            _ => runs.push((pos, pos)),
        }
    }

    let mut changes = Vec::new();
    for (start, end) in runs {
        let len = (end - start + 1) as i64;
        match direction {
            Direction::Up => {
                changes.extend(order[start..=end].iter().map(|id| (*id, -1)));
                changes.push((order[start - 1], len));
            }
            Direction::Down => {
                changes.extend(order[start..=end].iter().map(|id| (*id, 1)));
                changes.push((order[end + 1], -len));
            }
        }
    }
    changes
}
