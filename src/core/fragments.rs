//! Durable per-file bookkeeping used to decide whether on-disk parts and
//! fragments can be trusted on resume, plus the naming scheme that ties a
//! file id to its path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::download::{DownloadJob, FileStat, PartKind};

pub fn file_id(kind: PartKind, fragment: Option<usize>) -> String {
    match fragment {
        Some(i) => format!("{}{}", kind.prefix(), i),
        None => kind.prefix().to_string(),
    }
}

pub fn part_stem(job: &DownloadJob, itag: &str) -> String {
    format!("{}_{}_{}", job.video_id, job.uuid, itag)
}

pub fn part_filename(job: &DownloadJob, itag: &str) -> String {
    format!("{}.part", part_stem(job, itag))
}

pub fn part_path(job: &DownloadJob, itag: &str) -> PathBuf {
    job.save_to.join(part_filename(job, itag))
}

pub fn fragments_dir(job: &DownloadJob, itag: &str) -> PathBuf {
    job.save_to.join(part_stem(job, itag))
}

pub fn fragment_filename(job: &DownloadJob, itag: &str, index: usize) -> String {
    format!("{}_{}.part", part_stem(job, itag), index)
}

pub fn fragment_path(job: &DownloadJob, itag: &str, index: usize) -> PathBuf {
    fragments_dir(job, itag).join(fragment_filename(job, itag, index))
}

pub fn fragment_url(base: &str, fragment_path: &str) -> String {
    format!("{}{}", base, fragment_path)
}

pub fn metadata_path(job: &DownloadJob) -> PathBuf {
    job.save_to
        .join(format!("{}_{}_metadata", job.video_id, job.uuid))
}

/// Confirmed sizes keyed by file id (`v`, `v0`, `a`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileStats {
    sizes: HashMap<String, u64>,
}

impl FileStats {
    pub fn from_rows(rows: impl IntoIterator<Item = FileStat>) -> Self {
        Self {
            sizes: rows
                .into_iter()
                .map(|r| (r.file_id, r.filesize))
                .collect(),
        }
    }

    pub fn get(&self, file_id: &str) -> Option<u64> {
        self.sizes.get(file_id).copied()
    }

    pub fn record(&mut self, file_id: &str, size: u64) {
        self.sizes.insert(file_id.to_string(), size);
    }

    pub fn remove_prefix(&mut self, prefix: &str) {
        self.sizes.retain(|id, _| !id.starts_with(prefix));
    }


    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Size of `path` if it is recorded under `file_id` and the file on disk
    /// has exactly that length.
    pub async fn verified_size(&self, file_id: &str, path: &Path) -> Option<u64> {
        let recorded = self.get(file_id)?;
        let meta = tokio::fs::metadata(path).await.ok()?;
        (meta.is_file() && meta.len() == recorded).then_some(recorded)
    }
}
