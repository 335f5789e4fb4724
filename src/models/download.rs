use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::models::media::{Chapter, Format, Protocol, SelectedVariant, Variant, NO_VARIANT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartKind {
    Video,
    Audio,
}

impl PartKind {
    pub fn prefix(self) -> &'static str {
        match self {
            PartKind::Video => "v",
            PartKind::Audio => "a",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobPhase {
    #[default]
    Idle,
    FetchingVideo,
    FetchingAudio,
    Muxing,
    Completed,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: i64,
    pub video_id: String,
    pub uuid: String,
    pub priority: i64,
    pub title: String,
    pub selected_variant: SelectedVariant,
    pub variants: Vec<Variant>,
    pub formats: HashMap<String, Format>,
    pub chapters: Option<Vec<Chapter>>,
    pub duration: String,
    pub filename: String,
    pub container: String,
    pub save_to: PathBuf,
    pub upload_date: String,
    pub channel_id: String,
    pub channel_title: String,
    pub filesize: u64,
    pub missing_formats: bool,
    pub enabled: bool,
    pub completed: bool,
    pub bytes_loaded: u64,
    pub error: Option<String>,
    #[serde(skip)]
    pub downloading: bool,
    #[serde(skip)]
    pub refreshing: bool,
    #[serde(skip)]
    pub phase: JobPhase,
    #[serde(skip)]
    pub speed: u64,
    #[serde(skip)]
    pub connections: u32,
}

impl DownloadJob {
    pub fn part_format_id(&self, kind: PartKind) -> &str {
        match kind {
            PartKind::Video => &self.selected_variant.v_format_id,
            PartKind::Audio => &self.selected_variant.a_format_id,
        }
    }

    /// Format id without the `-dash` suffix; part files are named after it.
    pub fn part_itag(&self, kind: PartKind) -> &str {
        match kind {
            PartKind::Video => &self.selected_variant.v_itag,
            PartKind::Audio => &self.selected_variant.a_itag,
        }
    }

    pub fn part_protocol(&self, kind: PartKind) -> Protocol {
        match kind {
            PartKind::Video => self.selected_variant.v_protocol,
            PartKind::Audio => self.selected_variant.a_protocol,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.save_to.join(&self.filename)
    }

    pub fn has_variant(&self) -> bool {
        self.selected_variant.id != NO_VARIANT
    }

    pub fn set_downloading(&mut self) {
        self.refreshing = false;
        self.completed = false;
        self.downloading = true;
        self.error = None;
        self.phase = JobPhase::FetchingVideo;
    }

    pub fn set_refreshing(&mut self, refreshing: bool) {
        if refreshing {
            self.downloading = false;
            self.error = None;
        }
        self.refreshing = refreshing;
    }

    pub fn set_fetching(&mut self, kind: PartKind) {
        self.phase = match kind {
            PartKind::Video => JobPhase::FetchingVideo,
            PartKind::Audio => JobPhase::FetchingAudio,
        };
    }

    pub fn set_muxing(&mut self) {
        self.phase = JobPhase::Muxing;
        self.speed = 0;
        self.connections = 0;
    }

    pub fn set_completed(&mut self, bytes_loaded: u64) {
        self.set_stopped();
        self.completed = true;
        self.enabled = false;
        self.bytes_loaded = bytes_loaded;
        self.phase = JobPhase::Completed;
    }

    pub fn set_failed(&mut self, message: &str, disable: bool) {
        self.set_stopped();
        self.error = Some(message.to_string());
        if disable {
            self.enabled = false;
        }
        self.phase = JobPhase::Error;
    }

    pub fn set_stopped(&mut self) {
        self.downloading = false;
        self.refreshing = false;
        self.speed = 0;
        self.connections = 0;
        self.phase = JobPhase::Stopped;
    }

    pub fn active_flag_count(&self) -> usize {
        [self.downloading, self.refreshing, self.completed]
            .iter()
            .filter(|f| **f)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    pub download_id: i64,
    pub file_id: String,
    pub filesize: u64,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_prefixes() {
        assert_eq!(PartKind::Video.prefix(), "v");
        assert_eq!(PartKind::Audio.prefix(), "a");
    }

    #[test]
    fn transitions_keep_at_most_one_active_flag() {
        let mut job = fixtures::job(std::path::Path::new("/tmp"));
        job.set_downloading();
        assert_eq!(job.active_flag_count(), 1);
        job.set_refreshing(true);
        assert_eq!(job.active_flag_count(), 1);
        assert!(job.refreshing);
        job.set_refreshing(false);
        assert_eq!(job.active_flag_count(), 0);
        job.set_downloading();
        job.set_completed(10);
        assert_eq!(job.active_flag_count(), 1);
        assert!(job.completed && !job.enabled);
        job.set_downloading();
        assert_eq!(job.active_flag_count(), 1);
        assert!(!job.completed);
    }

    #[test]
    fn failed_with_disable_clears_enabled() {
        let mut job = fixtures::job(std::path::Path::new("/tmp"));
        job.set_downloading();
        job.set_failed("No Space", true);
        assert!(!job.enabled);
        assert!(!job.downloading);
        assert_eq!(job.error.as_deref(), Some("No Space"));
        assert_eq!(job.phase, JobPhase::Error);
    }

    #[test]
    fn refreshing_clears_previous_error() {
        let mut job = fixtures::job(std::path::Path::new("/tmp"));
        job.set_failed("Unknown Error", false);
        job.set_refreshing(true);
        assert!(job.error.is_none());
    }

    #[test]
    fn itag_and_format_id_can_differ() {
        let mut job = fixtures::job(std::path::Path::new("/tmp"));
        job.selected_variant.v_format_id = "137-dash".to_string();
        assert_eq!(job.part_format_id(PartKind::Video), "137-dash");
        assert_eq!(job.part_itag(PartKind::Video), "137");
    }
}
