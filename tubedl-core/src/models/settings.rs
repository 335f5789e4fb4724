use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ALLOWED_MAX_CONNECTIONS: [u32; 5] = [1, 2, 4, 8, 16];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    #[serde(default)]
    pub default_save_dir: Option<PathBuf>,
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_aria2_binary")]
    pub aria2_binary: String,
    #[serde(default = "default_aria2_port")]
    pub aria2_port: u16,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    #[serde(default = "default_ytdlp_binary")]
    pub ytdlp_binary: String,
}

/// Timings and thresholds of the engine. The defaults are the tuned values;
/// tests shrink the delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_persist_every_ticks")]
    pub persist_every_ticks: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_refresh_variant_attempts")]
    pub refresh_variant_attempts: u32,
    #[serde(default = "default_refresh_variant_delay_ms")]
    pub refresh_variant_delay_ms: u64,
    #[serde(default = "default_resolver_retries")]
    pub resolver_retries: u32,
    #[serde(default = "default_resolver_retry_delay_ms")]
    pub resolver_retry_delay_ms: u64,
    #[serde(default = "default_resolver_timeout_secs")]
    pub resolver_timeout_secs: u64,
    #[serde(default = "default_merge_safety_margin")]
    pub merge_safety_margin: u64,
    #[serde(default = "default_mux_space_factor")]
    pub mux_space_factor: f64,
    #[serde(default = "default_refetch_multiplier")]
    pub refetch_multiplier: f64,
    #[serde(default = "default_refetch_floor")]
    pub refetch_floor: u32,
}

fn default_schema_version() -> u32 {
    1
}

fn default_filename_template() -> String {
    "*TITLE*".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_aria2_binary() -> String {
    if cfg!(target_os = "windows") {
        "aria2c.exe".to_string()
    } else {
        "aria2c".to_string()
    }
}

fn default_aria2_port() -> u16 {
    6888
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_delay_ms() -> u64 {
    1000
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_ytdlp_binary() -> String {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe".to_string()
    } else {
        "yt-dlp".to_string()
    }
}

fn default_progress_interval_ms() -> u64 {
    2000
}

fn default_persist_every_ticks() -> u32 {
    30
}

fn default_retry_delay_ms() -> u64 {
    10_000
}

fn default_refresh_variant_attempts() -> u32 {
    3
}

fn default_refresh_variant_delay_ms() -> u64 {
    1000
}

fn default_resolver_retries() -> u32 {
    3
}

fn default_resolver_retry_delay_ms() -> u64 {
    3000
}

fn default_resolver_timeout_secs() -> u64 {
    20
}

fn default_merge_safety_margin() -> u64 {
    1024 * 1024
}

fn default_mux_space_factor() -> f64 {
    1.05
}

fn default_refetch_multiplier() -> f64 {
    1.5
}

fn default_refetch_floor() -> u32 {
    10
}

impl DownloadSettings {
    /// Snaps the configured value to the closest allowed connection count.
    pub fn normalized_max_connections(&self) -> u32 {
        ALLOWED_MAX_CONNECTIONS
            .iter()
            .copied()
            .min_by_key(|allowed| (i64::from(*allowed) - i64::from(self.max_connections)).abs())
            .unwrap_or(4)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            download: DownloadSettings::default(),
            tools: ToolSettings::default(),
            advanced: AdvancedSettings::default(),
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            default_save_dir: None,
            filename_template: default_filename_template(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            aria2_binary: default_aria2_binary(),
            aria2_port: default_aria2_port(),
            connect_attempts: default_connect_attempts(),
            connect_delay_ms: default_connect_delay_ms(),
            ffmpeg_binary: default_ffmpeg_binary(),
            ytdlp_binary: default_ytdlp_binary(),
        }
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            persist_every_ticks: default_persist_every_ticks(),
            retry_delay_ms: default_retry_delay_ms(),
            refresh_variant_attempts: default_refresh_variant_attempts(),
            refresh_variant_delay_ms: default_refresh_variant_delay_ms(),
            resolver_retries: default_resolver_retries(),
            resolver_retry_delay_ms: default_resolver_retry_delay_ms(),
            resolver_timeout_secs: default_resolver_timeout_secs(),
            merge_safety_margin: default_merge_safety_margin(),
            mux_space_factor: default_mux_space_factor(),
            refetch_multiplier: default_refetch_multiplier(),
            refetch_floor: default_refetch_floor(),
        }
    }
}
