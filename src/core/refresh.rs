//! Re-resolving a job's metadata to get fresh delivery URLs for the variant
//! it already has, either because a link expired mid-download or because the
//! user asked for it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::errors::ResolveError;
use crate::core::temp_files;
use crate::core::variants;
use crate::core::ytdlp::{ResolveOptions, Resolver};
use crate::models::download::{DownloadJob, PartKind};
use crate::models::media::{Chapter, Format, Protocol, SelectedVariant, Variant, NO_VARIANT};
use crate::models::settings::AdvancedSettings;
use crate::storage::DownloadStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOrigin {
    /// A transfer reported an expired link while the job was downloading.
    Expired,
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshPolicy {
    pub resolve: ResolveOptions,
    pub variant_attempts: u32,
    pub variant_delay: Duration,
}

impl RefreshPolicy {
    pub fn for_origin(origin: RefreshOrigin, advanced: &AdvancedSettings) -> Self {
        let resolve = match origin {
            RefreshOrigin::Expired => ResolveOptions {
                retries: None,
                timeout: None,
            },
            RefreshOrigin::User => ResolveOptions {
                retries: Some(advanced.resolver_retries),
                timeout: Some(Duration::from_secs(advanced.resolver_timeout_secs)),
            },
        };
        Self {
            resolve,
            variant_attempts: advanced.refresh_variant_attempts.max(1),
            variant_delay: Duration::from_millis(advanced.refresh_variant_delay_ms),
        }
    }
}

/// Fresh metadata for a job, ready to be applied with [`apply_refresh`].
#[derive(Debug, Clone)]
pub struct RefreshedJob {
    pub title: String,
    pub duration: String,
    pub channel_id: String,
    pub channel_title: String,
    pub upload_date: String,
    pub missing_formats: bool,
    pub variants: Vec<Variant>,
    pub formats: HashMap<String, Format>,
    pub chapters: Option<Vec<Chapter>>,
    pub selected: SelectedVariant,
    pub filesize: u64,
    pub enabled: bool,
    /// Parts whose source changed; their partial files must go.
    pub stale_parts: Vec<PartKind>,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Updated(Box<RefreshedJob>),
    Failed(String),
    Cancelled,
}

fn part_format_id(
    prev_format_id: &str,
    prev_protocol: Protocol,
    candidate: &str,
    formats: &HashMap<String, Format>,
) -> Option<String> {
    let format = formats.get(candidate)?;
    if format.protocol == prev_protocol {
        return Some(candidate.to_string());
    }
    if prev_protocol != Protocol::Segmented {
        return None;
    }
    let dash = format!("{}-dash", prev_format_id.replace("-dash", ""));
    formats.contains_key(&dash).then_some(dash)
}

/// Finds the variant pairing the same itags as `prev`. When a part's
/// protocol changed, only a switch back to its segmented `-dash` twin is
/// accepted.
pub fn match_variant(
    prev: &SelectedVariant,
    variants: &[Variant],
    formats: &HashMap<String, Format>,
) -> Option<SelectedVariant> {
    let variant = variants
        .iter()
        .find(|v| v.v_format_id == prev.v_itag && v.a_format_id == prev.a_itag)?;

    let v_format_id = part_format_id(&prev.v_itag, prev.v_protocol, &variant.v_format_id, formats)?;
    let a_format_id = part_format_id(&prev.a_itag, prev.a_protocol, &variant.a_format_id, formats)?;
    variants::select_variant_with(variant, formats, &v_format_id, &a_format_id)
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Re-resolves `job`'s video and looks for its variant among the new
/// formats. If the variant is gone after every attempt the job keeps its old
/// selection marked as unavailable and is disabled.
pub async fn refresh_job(
    resolver: &dyn Resolver,
    job: &DownloadJob,
    policy: &RefreshPolicy,
    cancel: &CancellationToken,
) -> RefreshOutcome {
    let mut attempts_left = policy.variant_attempts;

    loop {
        let resolved = match resolver.video_info(&job.video_id, policy.resolve, cancel).await {
            Ok(resolved) => resolved,
            Err(ResolveError::Cancelled) => return RefreshOutcome::Cancelled,
            Err(e) => {
                tracing::error!(
                    download_id = job.id,
                    "[refresh] failed to resolve {}: {}",
                    job.video_id,
                    e
                );
                return RefreshOutcome::Failed(e.to_string());
            }
        };

        let info = &resolved.info;
        let formats = variants::process_formats(&info.formats);
        let new_variants = variants::generate_variants(&info.formats);
        let matched = match_variant(&job.selected_variant, &new_variants, &formats);

        attempts_left = attempts_left.saturating_sub(1);
        if matched.is_none() && attempts_left > 0 {
            tracing::debug!(
                download_id = job.id,
                "[refresh] previous variant not found, {} attempts left",
                attempts_left
            );
            if !pause(policy.variant_delay, cancel).await {
                return RefreshOutcome::Cancelled;
            }
            continue;
        }

        let (selected, filesize, enabled, mut stale_parts) = match matched {
            Some(selected) => {
                let filesize = new_variants
                    .iter()
                    .find(|v| v.id == selected.id)
                    .map(|v| v.filesize)
                    .unwrap_or(job.filesize);
                let mut stale = Vec::new();
                if selected.video_lmt != job.selected_variant.video_lmt {
                    stale.push(PartKind::Video);
                }
                if selected.audio_lmt != job.selected_variant.audio_lmt {
                    stale.push(PartKind::Audio);
                }
                (selected, filesize, job.enabled, stale)
            }
            None => {
                tracing::warn!(download_id = job.id, "[refresh] previous variant is not available");
                let mut selected = job.selected_variant.clone();
                selected.id = NO_VARIANT;
                (selected, job.filesize, false, Vec::new())
            }
        };

        for kind in temp_files::superseded_parts(&job.selected_variant, &selected) {
            if !stale_parts.contains(&kind) {
                stale_parts.push(kind);
            }
        }

        return RefreshOutcome::Updated(Box::new(RefreshedJob {
            title: info.title.clone(),
            duration: info.duration_string.clone(),
            channel_id: info.channel_id.clone(),
            channel_title: info.channel.clone(),
            upload_date: variants::format_upload_date(&info.upload_date),
            missing_formats: resolved.missing_formats,
            chapters: variants::process_chapters(info.chapters.as_deref()),
            variants: new_variants,
            formats,
            selected,
            filesize,
            enabled,
            stale_parts,
        }));
    }
}

/// Purges the stale parts (named after the job's current selection), moves
/// the refreshed fields into `job` and persists it.
pub async fn apply_refresh(
    job: &mut DownloadJob,
    refreshed: RefreshedJob,
    store: &dyn DownloadStore,
) -> anyhow::Result<()> {
    for kind in &refreshed.stale_parts {
        temp_files::purge_temp_files(job, Some(*kind), store).await?;
    }

    job.title = refreshed.title;
    job.duration = refreshed.duration;
    job.channel_id = refreshed.channel_id;
    job.channel_title = refreshed.channel_title;
    job.upload_date = refreshed.upload_date;
    job.missing_formats = refreshed.missing_formats;
    job.variants = refreshed.variants;
    job.formats = refreshed.formats;
    job.chapters = refreshed.chapters;
    job.selected_variant = refreshed.selected;
    job.filesize = refreshed.filesize;
    job.enabled = refreshed.enabled;

    store.update_download(job).await?;
    tracing::info!(
        download_id = job.id,
        "[refresh] {} refreshed, variant {}",
        job.video_id,
        job.selected_variant.id
    );
    Ok(())
}

/// Switches `job` to its variant `variant_id`. Parts the new selection
/// supersedes are purged with their file rows; the container falls back to
/// the first one the new codecs allow.
pub async fn override_variant(
    job: &mut DownloadJob,
    variant_id: i32,
    store: &dyn DownloadStore,
) -> anyhow::Result<()> {
    let Some(variant) = job.variants.iter().find(|v| v.id == variant_id).cloned() else {
        anyhow::bail!("download {} has no variant {}", job.id, variant_id);
    };
    let Some(selected) = variants::select_variant(&variant, &job.formats) else {
        anyhow::bail!("formats of variant {} are missing", variant_id);
    };
    let containers = variants::container_options(&variant.v_codec, &variant.a_codec);
    let Some(fallback) = containers.first().copied() else {
        anyhow::bail!("no container for {}+{}", variant.v_codec, variant.a_codec);
    };

    temp_files::purge_superseded(job, &selected, store).await?;

    if !containers.contains(&job.container.as_str()) {
        job.container = fallback.to_string();
        job.filename = Path::new(&job.filename)
            .with_extension(fallback)
            .to_string_lossy()
            .into_owned();
    }
    job.selected_variant = selected;
    job.filesize = variant.filesize;

    store.update_download(job).await?;
    tracing::info!(
        download_id = job.id,
        "[refresh] variant {} selected for {}",
        variant_id,
        job.video_id
    );
    Ok(())
}
