use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tubedl_core::fs_paths::{AppPaths, DesktopPaths};

use crate::core::aria2::{self, Accelerator, Aria2Client};
use crate::core::disk::{SpaceProbe, SysinfoSpace};
use crate::core::events::{ChannelEmitter, EngineEvent, LoggingEmitter};
use crate::core::ffmpeg::FfmpegMuxer;
use crate::core::orchestrator::{EngineContext, Orchestrator};
use crate::core::queue::{self, RunQueue};
use crate::core::variants;
use crate::core::ytdlp::{ResolveOptions, Resolver, YtDlp};
use crate::models::settings::EngineSettings;
use crate::storage::config;
use crate::storage::sqlite::SqliteStore;
use crate::storage::DownloadStore;

pub mod core;
pub mod models;
pub mod storage;

const DATABASE_FILE: &str = "tubedl.db";

async fn add_video(
    video_id: &str,
    resolver: &dyn Resolver,
    store: &dyn DownloadStore,
    settings: &EngineSettings,
    save_to: &Path,
) -> anyhow::Result<i64> {
    let options = ResolveOptions {
        retries: Some(settings.advanced.resolver_retries),
        timeout: Some(Duration::from_secs(settings.advanced.resolver_timeout_secs)),
    };
    let resolved = resolver
        .video_info(video_id, options, &CancellationToken::new())
        .await?;
    let job = variants::new_job(
        video_id,
        &resolved,
        save_to,
        &settings.download.filename_template,
    )?;
    let (id, priority) = store.add_download(&job).await?;
    tracing::info!(download_id = id, "[queue] added {} at priority {}", job.filename, priority);
    Ok(id)
}

/// Headless runner: queues `video_ids`, then downloads every enabled job in
/// priority order until the queue is drained or ctrl-c is pressed.
pub async fn run(video_ids: Vec<String>) -> anyhow::Result<()> {
    let paths = DesktopPaths;
    let data_dir = paths.data_dir();
    tokio::fs::create_dir_all(&data_dir).await?;

    let settings = config::load_settings(&config::settings_path(&data_dir));
    let store: Arc<dyn DownloadStore> =
        Arc::new(SqliteStore::open(&data_dir.join(DATABASE_FILE)).await?);

    let mut aria2_process = aria2::spawn_aria2(&settings.tools)?;
    let (client, accelerator_events) =
        Aria2Client::connect(&settings.tools, settings.download.normalized_max_connections()).await?;
    let accelerator: Arc<dyn Accelerator> = Arc::new(client);
    tracing::info!("[aria2] connected, version {}", accelerator.version().await?);

    let space: Arc<dyn SpaceProbe> = Arc::new(SysinfoSpace);
    let resolver: Arc<dyn Resolver> = Arc::new(YtDlp::new(
        settings.tools.ytdlp_binary.clone(),
        Duration::from_millis(settings.advanced.resolver_retry_delay_ms),
    ));
    let muxer = Arc::new(FfmpegMuxer::new(
        settings.tools.ffmpeg_binary.clone(),
        space.clone(),
        settings.advanced.mux_space_factor,
    ));

    let save_to = settings
        .download
        .default_save_dir
        .clone()
        .unwrap_or_else(|| paths.downloads_dir());
    for video_id in &video_ids {
        if let Err(e) = add_video(video_id, resolver.as_ref(), store.as_ref(), &settings, &save_to).await {
            tracing::error!("[queue] could not add {}: {}", video_id, e);
        }
    }

    let (emitter, mut events) = ChannelEmitter::new();
    let ctx = EngineContext {
        accelerator,
        muxer,
        resolver,
        space,
        store: store.clone(),
        emitter: LoggingEmitter::new(emitter),
        settings,
    };
    let engine = Orchestrator::spawn(ctx, accelerator_events);

    let mut run_queue = RunQueue::new(1);
    queue::try_start_next(&mut run_queue, store.as_ref(), &engine).await?;

    let mut fatal = None;
    while !run_queue.is_idle() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("[queue] interrupted, stopping downloads");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    EngineEvent::Completed { id, .. }
                    | EngineEvent::Stopped { id }
                    | EngineEvent::Error { id, .. } => {
                        run_queue.mark_finished(id);
                        queue::try_start_next(&mut run_queue, store.as_ref(), &engine).await?;
                    }
                    EngineEvent::Fatal { message } => {
                        fatal = Some(message);
                        break;
                    }
                    EngineEvent::Progress { .. } | EngineEvent::RefreshFinished { .. } => {}
                }
            }
        }
    }

    engine.shutdown().await;
    if let Err(e) = aria2_process.kill().await {
        tracing::warn!("[aria2] failed to stop process: {}", e);
    }
    match fatal {
        Some(message) => anyhow::bail!("engine stopped: {}", message),
        None => Ok(()),
    }
}
