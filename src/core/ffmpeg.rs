use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::disk::{self, SpaceProbe};
use crate::core::errors::MuxError;
use crate::core::process;
use crate::models::media::Chapter;

/// ffmpeg exits with -ENOSPC when the disk fills up; unix truncates it to 228.
const NO_SPACE_EXIT_CODES: [i32; 2] = [-28, 228];

#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
    pub chapters: Option<Vec<Chapter>>,
    pub metadata_path: PathBuf,
}

#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, request: &MuxRequest, cancel: CancellationToken) -> Result<(), MuxError>;
}

pub fn chapters_metadata(chapters: &[Chapter]) -> String {
    let mut out = String::from(";FFMETADATA1");
    for chapter in chapters {
        out.push_str(&format!(
            "\n[CHAPTER]\nTIMEBASE=1/1000\nSTART={}\nEND={}\ntitle={}",
            (chapter.start_time * 1000.0).round() as i64,
            (chapter.end_time * 1000.0).round() as i64,
            chapter.title
        ));
    }
    out
}

pub fn mux_args(video: &Path, audio: &Path, output: &Path, metadata: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-i".to_string(),
        audio.to_string_lossy().to_string(),
    ];
    if let Some(metadata) = metadata {
        args.push("-i".to_string());
        args.push(metadata.to_string_lossy().to_string());
        args.push("-map_metadata".to_string());
        args.push("2".to_string());
    }
    args.extend([
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

pub fn classify_exit(code: Option<i32>) -> Result<(), MuxError> {
    match code {
        Some(0) => Ok(()),
        Some(c) if NO_SPACE_EXIT_CODES.contains(&c) => Err(MuxError::NoSpace),
        Some(c) => Err(MuxError::Failed(format!("exit code {}", c))),
        None => Err(MuxError::Failed("terminated by signal".to_string())),
    }
}

pub struct FfmpegMuxer {
    binary: String,
    space: Arc<dyn SpaceProbe>,
    space_factor: f64,
}

impl FfmpegMuxer {
    pub fn new(binary: String, space: Arc<dyn SpaceProbe>, space_factor: f64) -> Self {
        Self {
            binary,
            space,
            space_factor,
        }
    }

    async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<(), MuxError> {
        let mut child = process::command(&self.binary)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MuxError::Failed(format!("failed to start ffmpeg: {}", e)))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| MuxError::Failed(e.to_string()))?;
                classify_exit(status.code())
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(MuxError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, request: &MuxRequest, cancel: CancellationToken) -> Result<(), MuxError> {
        let video_len = file_len(&request.video).await?;
        let audio_len = file_len(&request.audio).await?;
        let streams = video_len + audio_len;

        let required = (streams as f64 * self.space_factor) as u64;
        if !disk::has_space(self.space.as_ref(), &request.output, required) {
            tracing::error!("[mux] not enough space for {}", request.output.display());
            return Err(MuxError::NoSpace);
        }

        let metadata = match &request.chapters {
            Some(chapters) if !chapters.is_empty() => {
                tokio::fs::write(&request.metadata_path, chapters_metadata(chapters))
                    .await
                    .map_err(|e| MuxError::Failed(format!("failed to write chapters: {}", e)))?;
                Some(request.metadata_path.as_path())
            }
            _ => None,
        };

        let args = mux_args(&request.video, &request.audio, &request.output, metadata);
        self.run(&args, &cancel).await?;

        let muxed = tokio::fs::metadata(&request.output)
            .await
            .map_err(|_| MuxError::Failed("output file missing".to_string()))?
            .len();
        if streams > 0 {
            tracing::info!(
                "[mux] size ratio {:.2}% for {}",
                muxed as f64 / streams as f64 * 100.0,
                request.output.display()
            );
        }

        Ok(())
    }
}

/// Deletes the streams and the chapter file of a mux whose result has been
/// recorded. The chapter file only exists when the video has chapters.
pub async fn remove_inputs(request: &MuxRequest) {
    for input in [&request.video, &request.audio, &request.metadata_path] {
        match tokio::fs::remove_file(input).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("[mux] failed to delete {}: {}", input.display(), e),
        }
    }
}

async fn file_len(path: &Path) -> Result<u64, MuxError> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| MuxError::Failed(format!("{}: {}", path.display(), e)))
}
