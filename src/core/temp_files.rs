use std::path::{Path, PathBuf};

use regex::Regex;

use crate::core::fragments;
use crate::models::download::{DownloadJob, PartKind};
use crate::models::media::{Protocol, SelectedVariant};
use crate::storage::DownloadStore;

fn temp_file_pattern(job: &DownloadJob, kind: Option<PartKind>) -> anyhow::Result<Regex> {
    let itag = match kind {
        Some(kind) => regex::escape(job.part_itag(kind)),
        None => r"\d+".to_string(),
    };
    let pattern = format!(
        r"^{}_{}_{}(?:_\d+)?\.part(?:\.aria2)?$",
        regex::escape(&job.video_id),
        regex::escape(&job.uuid),
        itag
    );
    Ok(Regex::new(&pattern)?)
}

async fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files
}

/// Deletes the `.part` files, their `.aria2` control files and the fragment
/// directories of one part (or every part when `kind` is `None`), then drops
/// the matching file rows. Failures are logged per file.
pub async fn purge_temp_files(
    job: &DownloadJob,
    kind: Option<PartKind>,
    store: &dyn DownloadStore,
) -> anyhow::Result<usize> {
    let re = temp_file_pattern(job, kind)?;
    if !tokio::fs::try_exists(&job.save_to).await.unwrap_or(false) {
        return Ok(0);
    }

    let mut candidates = list_files(&job.save_to).await;
    let mut dirs = Vec::new();
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => vec![PartKind::Video, PartKind::Audio],
    };
    for k in kinds {
        if job.part_protocol(k) != Protocol::Segmented {
            continue;
        }
        let dir = fragments::fragments_dir(job, job.part_itag(k));
        candidates.extend(list_files(&dir).await);
        dirs.push(dir);
    }

    let mut removed = 0;
    for path in candidates {
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| re.is_match(n));
        if !matches {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::error!(
                download_id = job.id,
                "[purge] failed to delete {}: {}",
                path.display(),
                e
            ),
        }
    }

    for dir in dirs {
        if let Err(e) = tokio::fs::remove_dir(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(
                    download_id = job.id,
                    "[purge] failed to delete {}: {}",
                    dir.display(),
                    e
                );
            }
        }
    }

    let prefix = kind.map(|k| k.prefix()).unwrap_or("");
    store.remove_file_stats(job.id, prefix).await?;
    tracing::debug!(download_id = job.id, "[purge] removed {} temp files", removed);
    Ok(removed)
}

/// Parts whose itag or protocol differ between the current selection and
/// `next`; their partial files can no longer be resumed.
pub fn superseded_parts(current: &SelectedVariant, next: &SelectedVariant) -> Vec<PartKind> {
    let mut kinds = Vec::new();
    if current.v_itag != next.v_itag || current.v_protocol != next.v_protocol {
        kinds.push(PartKind::Video);
    }
    if current.a_itag != next.a_itag || current.a_protocol != next.a_protocol {
        kinds.push(PartKind::Audio);
    }
    kinds
}

pub async fn purge_superseded(
    job: &DownloadJob,
    next: &SelectedVariant,
    store: &dyn DownloadStore,
) -> anyhow::Result<()> {
    for kind in superseded_parts(&job.selected_variant, next) {
        purge_temp_files(job, Some(kind), store).await?;
    }
    Ok(())
}
