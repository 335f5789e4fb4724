use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

pub const DEFAULT_TEMPLATE: &str = "*TITLE*";

static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

/// Values a filename template can refer to.
#[derive(Debug, Clone, Default)]
pub struct FilenameFields<'a> {
    pub video_id: &'a str,
    pub title: &'a str,
    pub channel: &'a str,
    /// `YYYY-MM-DD`
    pub upload_date: &'a str,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: &'a str,
    pub audio_codec: &'a str,
    pub audio_bitrate: f64,
    pub container: &'a str,
}

pub fn generate_filename(template: &str, fields: &FilenameFields<'_>) -> String {
    let mut date = fields.upload_date.splitn(3, '-');
    let year = date.next().unwrap_or_default();
    let month = date.next().unwrap_or_default();
    let day = date.next().unwrap_or_default();

    let name = template
        .replace("*TITLE*", fields.title)
        .replace("*VIDEO_ID*", fields.video_id)
        .replace("*CHANNEL*", fields.channel)
        .replace("*UPYEAR*", year)
        .replace("*UPMONTH*", month)
        .replace("*UPDAY*", day)
        .replace("*W*", &fields.width.to_string())
        .replace("*H*", &fields.height.to_string())
        .replace("*FPS*", &fields.fps.to_string())
        .replace("*VIDEO_CODEC*", fields.video_codec)
        .replace("*AUDIO_CODEC*", fields.audio_codec)
        .replace("*AUDIO_BITRATE*", &fields.audio_bitrate.to_string());

    sanitize(&format!("{}.{}", name, fields.container))
}

pub fn sanitize(name: &str) -> String {
    let name: String = name.nfc().collect();
    let options = sanitize_filename::Options {
        replacement: "_",
        ..Default::default()
    };
    let name = sanitize_filename::sanitize_with_options(name, options);
    SPACES_RE.replace_all(&name, " ").to_string()
}
