use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::core::aria2::{Accelerator, TransferRequest};
use crate::core::disk::{self, SpaceProbe};
use crate::core::errors::MergeError;
use crate::core::fragments;
use crate::core::ids::GidGenerator;
use crate::core::package::{ActiveTransfer, CurrentPart, PendingFragment, RuntimePackage, TransferTable};
use crate::models::download::{DownloadJob, PartKind};
use crate::models::media::Protocol;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// Part already on disk; nothing was sent to the accelerator.
    Complete,
    /// Transfers issued; completion arrives as notifications.
    Pending,
    Failed(String),
}

pub struct FetchContext<'a> {
    pub accelerator: &'a dyn Accelerator,
    pub gids: &'a mut GidGenerator,
    pub transfers: &'a mut TransferTable,
    pub max_parallel: usize,
}

/// Starts fetching one part of `job`, resuming whatever the file stats and
/// the files on disk agree on.
pub async fn fetch_part(
    cx: &mut FetchContext<'_>,
    pkg: &mut RuntimePackage,
    job: &DownloadJob,
    kind: PartKind,
) -> FetchResult {
    let itag = job.part_itag(kind).to_string();
    let format_id = job.part_format_id(kind).to_string();
    let Some(format) = job.formats.get(&format_id) else {
        return FetchResult::Failed(format!("format {} not found", format_id));
    };

    let part = CurrentPart {
        kind,
        path: fragments::part_path(job, &itag),
        fragments_dir: fragments::fragments_dir(job, &itag),
        fragment_count: format.fragments.len(),
        protocol: format.protocol,
        itag,
        format_id,
    };
    pkg.current = Some(part.clone());
    pkg.remaining.clear();
    pkg.in_flight = 0;

    let whole_id = fragments::file_id(kind, None);
    if let Some(size) = pkg.file_stats.verified_size(&whole_id, &part.path).await {
        tracing::debug!("[fetch] {} of job {} already on disk ({} bytes)", whole_id, job.id, size);
        pkg.bytes_loaded += size;
        return FetchResult::Complete;
    }

    let Some(url) = format.url.as_deref() else {
        return FetchResult::Failed(format!("format {} has no url", part.format_id));
    };

    match part.protocol {
        Protocol::Direct => {
            let transfer = ActiveTransfer {
                job_id: job.id,
                file_id: whole_id,
                url: url.to_string(),
                dir: job.save_to.clone(),
                filename: fragments::part_filename(job, &part.itag),
                fragment: None,
            };
            match issue_transfer(cx, pkg, transfer).await {
                Ok(_) => FetchResult::Pending,
                Err(e) => FetchResult::Failed(e.to_string()),
            }
        }
        Protocol::Segmented => {
            for (index, fragment) in format.fragments.iter().enumerate() {
                let file_id = fragments::file_id(kind, Some(index));
                let path = fragments::fragment_path(job, &part.itag, index);
                if let Some(size) = pkg.file_stats.verified_size(&file_id, &path).await {
                    pkg.bytes_loaded += size;
                    continue;
                }
                pkg.remaining.push_back(PendingFragment {
                    index,
                    file_id,
                    url: fragments::fragment_url(url, &fragment.path),
                    filename: fragments::fragment_filename(job, &part.itag, index),
                });
            }
            tracing::debug!(
                "[fetch] job {} part {}: {} of {} fragments queued",
                job.id,
                part.itag,
                pkg.remaining.len(),
                part.fragment_count
            );
            match schedule_fragments(cx, pkg).await {
                Ok(()) => FetchResult::Pending,
                Err(e) => FetchResult::Failed(e.to_string()),
            }
        }
        Protocol::Unsupported => {
            FetchResult::Failed(format!("unsupported protocol for format {}", part.format_id))
        }
    }
}

/// Issues queued fragments until the parallelism ceiling is reached.
pub async fn schedule_fragments(
    cx: &mut FetchContext<'_>,
    pkg: &mut RuntimePackage,
) -> anyhow::Result<()> {
    let Some(dir) = pkg.current.as_ref().map(|p| p.fragments_dir.clone()) else {
        return Ok(());
    };

    while !pkg.stopped && pkg.in_flight < cx.max_parallel.max(1) {
        let Some(next) = pkg.remaining.pop_front() else {
            break;
        };
        let transfer = ActiveTransfer {
            job_id: pkg.job_id,
            file_id: next.file_id.clone(),
            url: next.url.clone(),
            dir: dir.clone(),
            filename: next.filename.clone(),
            fragment: Some(next.index),
        };
        if let Err(e) = issue_transfer(cx, pkg, transfer).await {
            pkg.remaining.push_front(next);
            return Err(e);
        }
        pkg.in_flight += 1;
    }
    Ok(())
}

/// Hands one transfer to the accelerator under a fresh gid and tracks it.
pub async fn issue_transfer(
    cx: &mut FetchContext<'_>,
    pkg: &mut RuntimePackage,
    transfer: ActiveTransfer,
) -> anyhow::Result<String> {
    let request = TransferRequest {
        url: transfer.url.clone(),
        dir: transfer.dir.clone(),
        filename: transfer.filename.clone(),
        gid: cx.gids.next_gid(),
        single_connection: transfer.fragment.is_some(),
    };
    let gid = cx.accelerator.add_transfer(&request).await?;
    tracing::debug!(
        download_id = transfer.job_id,
        gid = %gid,
        file_id = %transfer.file_id,
        "[fetch] transfer issued"
    );
    pkg.gids.insert(gid.clone());
    cx.transfers.insert(gid.clone(), transfer);
    Ok(gid)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub job_id: i64,
    pub kind: PartKind,
    pub prefix: String,
    /// Fragment files in ascending index order.
    pub fragments: Vec<PathBuf>,
    pub fragments_dir: PathBuf,
    pub target: PathBuf,
    pub required: u64,
}

pub fn merge_plan(job: &DownloadJob, pkg: &RuntimePackage, safety_margin: u64) -> Option<MergePlan> {
    let part = pkg.current.as_ref()?;
    let fragment_bytes: u64 = (0..part.fragment_count)
        .filter_map(|i| pkg.file_stats.get(&fragments::file_id(part.kind, Some(i))))
        .sum();
    Some(MergePlan {
        job_id: job.id,
        kind: part.kind,
        prefix: part.kind.prefix().to_string(),
        fragments: (0..part.fragment_count)
            .map(|i| fragments::fragment_path(job, &part.itag, i))
            .collect(),
        fragments_dir: part.fragments_dir.clone(),
        target: part.path.clone(),
        required: fragment_bytes + safety_margin,
    })
}

/// Concatenates the fragments into the part file. Free space is checked
/// before anything on disk is touched.
pub async fn merge_fragments(
    plan: &MergePlan,
    space: &dyn SpaceProbe,
    cancel: &CancellationToken,
) -> Result<u64, MergeError> {
    if !disk::has_space(space, &plan.target, plan.required) {
        return Err(MergeError::NoSpace {
            required: plan.required,
        });
    }
    if cancel.is_cancelled() {
        return Err(MergeError::Stopped);
    }

    if tokio::fs::try_exists(&plan.target).await.unwrap_or(false) {
        tokio::fs::remove_file(&plan.target).await?;
    }

    let mut output = tokio::fs::File::create(&plan.target).await?;
    let mut written = 0u64;
    for path in &plan.fragments {
        if cancel.is_cancelled() {
            drop(output);
            let _ = tokio::fs::remove_file(&plan.target).await;
            return Err(MergeError::Stopped);
        }
        let mut input = tokio::fs::File::open(path).await?;
        written += tokio::io::copy(&mut input, &mut output).await?;
    }
    output.flush().await?;

    tracing::debug!(
        "[merge] {} fragments into {} ({} bytes)",
        plan.fragments.len(),
        plan.target.display(),
        written
    );
    Ok(written)
}

pub async fn remove_fragment_files(plan: &MergePlan) {
    for path in &plan.fragments {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!("[merge] failed to delete {}: {}", path.display(), e);
        }
    }
    if let Err(e) = tokio::fs::remove_dir(&plan.fragments_dir).await {
        tracing::warn!(
            "[merge] failed to delete {}: {}",
            plan.fragments_dir.display(),
            e
        );
    }
}

/// Deletes the transfer's `.aria2` control file when it is empty. Returns
/// whether one was removed.
pub async fn clear_empty_control_file(transfer: &ActiveTransfer) -> bool {
    let control = transfer.control_file();
    match tokio::fs::metadata(&control).await {
        Ok(meta) if meta.len() == 0 => match tokio::fs::remove_file(&control).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("[fetch] failed to delete {}: {}", control.display(), e);
                false
            }
        },
        _ => false,
    }
}
