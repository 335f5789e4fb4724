use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::errors::ResolveError;
use crate::core::process;
use crate::models::media::{ChannelInfo, PlaylistInfo, VideoInfo};

const MISSING_FORMATS_WARNING: &str = "Some formats may be missing";

/// How hard to try resolving a video. `retries: None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveOptions {
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ResolvedVideo {
    pub info: VideoInfo,
    pub missing_formats: bool,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn video_info(
        &self,
        video_id: &str,
        options: ResolveOptions,
        cancel: &CancellationToken,
    ) -> Result<ResolvedVideo, ResolveError>;

    async fn playlist_info(
        &self,
        playlist_id: &str,
        count: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<PlaylistInfo, ResolveError>;

    async fn channel_info(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> Result<ChannelInfo, ResolveError>;
}

pub fn video_args(video_id: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--compat-options".to_string(),
        "manifest-filesize-approx".to_string(),
        format!("https://youtube.com/watch?v={}", video_id),
    ]
}

pub fn playlist_args(playlist_id: &str, count: Option<u32>) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--flat-playlist".to_string(),
        "--extractor-args".to_string(),
        "youtubetab:approximate_date".to_string(),
        "-I".to_string(),
        format!(":{}", count.map(|c| c.to_string()).unwrap_or_default()),
        format!("https://youtube.com/playlist?list={}", playlist_id),
    ]
}

pub fn channel_args(handle: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--flat-playlist".to_string(),
        "-I".to_string(),
        "0:0".to_string(),
        format!("https://youtube.com/{}/featured", handle),
    ]
}

pub fn classify_video_stderr(stderr: &str) -> Option<ResolveError> {
    let diagnostic = stderr.trim().to_string();
    if stderr.contains("This live event will begin in a few moments.")
        || stderr.contains("Video unavailable")
    {
        return Some(ResolveError::Unavailable(diagnostic));
    }
    if stderr.contains("Private video.") {
        return Some(ResolveError::Private(diagnostic));
    }
    if stderr.contains("This video is available to this channel's members") {
        return Some(ResolveError::MembersOnly(diagnostic));
    }
    if stderr.contains("This live event will begin in ") || stderr.contains("Premieres in ") {
        return Some(ResolveError::Upcoming(diagnostic));
    }
    if stderr.contains("Sign in to confirm you're not a bot") {
        return Some(ResolveError::BotCheck(diagnostic));
    }
    None
}

fn classify_playlist_stderr(stderr: &str) -> Option<ResolveError> {
    stderr
        .contains("does not exist")
        .then(|| ResolveError::NotFound(stderr.trim().to_string()))
}

fn classify_channel_stderr(stderr: &str) -> Option<ResolveError> {
    stderr
        .contains("Not Found")
        .then(|| ResolveError::NotFound(stderr.trim().to_string()))
}

/// Number of recent uploads to re-check for a channel last polled
/// `days_since_update` days ago.
pub fn refetch_count(
    days_since_update: f64,
    incomplete: usize,
    multiplier: f64,
    floor: usize,
) -> usize {
    let window = (days_since_update.max(0.0) * multiplier) as usize;
    window.max(floor) + incomplete
}

enum Attempt {
    Finished {
        success: bool,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(String),
}

pub struct YtDlp {
    binary: String,
    retry_delay: Duration,
}

impl YtDlp {
    pub fn new(binary: String, retry_delay: Duration) -> Self {
        Self {
            binary,
            retry_delay,
        }
    }

    async fn run_once(
        &self,
        args: &[String],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Attempt, ResolveError> {
        let output = process::command(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let result = match timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                r = tokio::time::timeout(limit, output) => match r {
                    Ok(r) => r,
                    Err(_) => return Ok(Attempt::TimedOut),
                },
            },
            None => tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                r = output => r,
            },
        };

        Ok(match result {
            Ok(out) => Attempt::Finished {
                success: out.status.success(),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            },
            Err(e) => Attempt::SpawnFailed(e.to_string()),
        })
    }

    /// Runs yt-dlp until it exits cleanly, a classified failure shows up in
    /// stderr, or the attempts run out. Returns stdout and stderr.
    async fn run_with_retries(
        &self,
        label: &str,
        args: Vec<String>,
        retries: Option<u32>,
        timeout: Option<Duration>,
        classify: fn(&str) -> Option<ResolveError>,
        cancel: &CancellationToken,
    ) -> Result<(String, String), ResolveError> {
        let mut left = retries;
        loop {
            let last = match self.run_once(&args, timeout, cancel).await? {
                Attempt::Finished {
                    success: true,
                    stdout,
                    stderr,
                } => return Ok((stdout, stderr)),
                Attempt::Finished { stderr, .. } => {
                    if let Some(err) = classify(&stderr) {
                        return Err(err);
                    }
                    ResolveError::Exhausted(stderr.trim().to_string())
                }
                Attempt::TimedOut => {
                    tracing::error!("[resolver] {} timed out", label);
                    ResolveError::Timeout
                }
                Attempt::SpawnFailed(e) => {
                    tracing::error!("[resolver] failed to run {}: {}", self.binary, e);
                    ResolveError::Exhausted(e)
                }
            };

            if let Some(n) = left.as_mut() {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    return Err(last);
                }
            }
            tracing::warn!(
                "[resolver] {} failed, retrying ({} left)",
                label,
                left.map(|n| n.to_string()).unwrap_or_else(|| "unlimited".to_string())
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[async_trait]
impl Resolver for YtDlp {
    async fn video_info(
        &self,
        video_id: &str,
        options: ResolveOptions,
        cancel: &CancellationToken,
    ) -> Result<ResolvedVideo, ResolveError> {
        let (stdout, stderr) = self
            .run_with_retries(
                &format!("video {}", video_id),
                video_args(video_id),
                options.retries,
                options.timeout,
                classify_video_stderr,
                cancel,
            )
            .await?;

        let missing_formats = stderr.contains(MISSING_FORMATS_WARNING);
        if missing_formats {
            tracing::warn!("[resolver] some formats may be missing for {}", video_id);
        }

        let info: VideoInfo =
            serde_json::from_str(&stdout).map_err(|e| ResolveError::Parse(e.to_string()))?;
        Ok(ResolvedVideo {
            info,
            missing_formats,
        })
    }

    async fn playlist_info(
        &self,
        playlist_id: &str,
        count: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<PlaylistInfo, ResolveError> {
        let (stdout, _) = self
            .run_with_retries(
                &format!("playlist {}", playlist_id),
                playlist_args(playlist_id, count),
                Some(3),
                None,
                classify_playlist_stderr,
                cancel,
            )
            .await?;
        serde_json::from_str(&stdout).map_err(|e| ResolveError::Parse(e.to_string()))
    }

    async fn channel_info(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> Result<ChannelInfo, ResolveError> {
        let (stdout, _) = self
            .run_with_retries(
                &format!("channel {}", handle),
                channel_args(handle),
                Some(3),
                None,
                classify_channel_stderr,
                cancel,
            )
            .await?;
        serde_json::from_str(&stdout).map_err(|e| ResolveError::Parse(e.to_string()))
    }
}
