use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "https")]
    Direct,
    #[serde(rename = "http_dash_segments")]
    Segmented,
    #[serde(other, rename = "unsupported")]
    Unsupported,
}

impl Protocol {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "https" => Protocol::Direct,
            "http_dash_segments" => Protocol::Segmented,
            _ => Protocol::Unsupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub path: String,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Delivery descriptor of one format id, kept per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub protocol: Protocol,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub throttled: bool,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: i32,
    pub v_format_id: String,
    pub v_codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub vbr: f64,
    pub a_format_id: String,
    pub a_codec: String,
    pub abr: f64,
    pub filesize: u64,
    pub is_approx_filesize: bool,
}

/// Snapshot of the chosen variant. `id == -1` means no compatible variant is
/// currently available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedVariant {
    pub id: i32,
    pub v_format_id: String,
    pub a_format_id: String,
    pub v_itag: String,
    pub a_itag: String,
    pub v_protocol: Protocol,
    pub a_protocol: Protocol,
    pub v_throttled: bool,
    pub a_throttled: bool,
    pub video_lmt: String,
    pub audio_lmt: String,
    pub description: String,
    pub is_approx_filesize: bool,
    pub v_codec: String,
    pub a_codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub abr: f64,
}

pub const NO_VARIANT: i32 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_time: f64,
    pub end_time: f64,
}

// yt-dlp `-J` output, only the fields the engine reads.

#[derive(Debug, Clone, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    #[serde(default)]
    pub duration_string: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub upload_date: String,
    #[serde(default)]
    pub live_status: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    #[serde(default)]
    pub chapters: Option<Vec<RawChapter>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFormat {
    pub format_id: String,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub vbr: Option<f64>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub fragment_base_url: Option<String>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub fragments: Option<Vec<Fragment>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChapter {
    #[serde(default)]
    pub title: String,
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub availability: Option<String>,
    #[serde(default)]
    pub playlist_count: Option<u32>,
    #[serde(default)]
    pub entries: Vec<PlaylistEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub uploader_id: Option<String>,
}
