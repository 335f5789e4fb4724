//! Turning resolver output into formats, ranked variants and new jobs.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use anyhow::bail;

use crate::core::errors::ResolveError;
use crate::core::filename::{self, FilenameFields};
use crate::core::ids;
use crate::core::ytdlp::ResolvedVideo;
use crate::models::download::{DownloadJob, JobPhase};
use crate::models::media::{
    Chapter, Format, Protocol, RawChapter, RawFormat, SelectedVariant, Variant,
};

const VIDEO_CODECS: [&str; 3] = ["av01", "vp9", "avc1"];
const AUDIO_CODECS: [&str; 2] = ["opus", "mp4a"];

const CONTAINERS: [(&str, &[&str], &[&str]); 3] = [
    ("mp4", &["vp9", "avc1", "av01"], &["mp4a", "opus"]),
    ("mkv", &["vp9", "avc1"], &["mp4a", "opus"]),
    ("webm", &["vp9"], &["opus"]),
];

fn is_non_default_language(format_id: &str, note: Option<&str>) -> bool {
    format_id.contains('-') && note.is_some_and(|n| !n.contains("(default)"))
}

fn normalize_vcodec(codec: &str) -> &str {
    if codec.starts_with("vp09") {
        "vp9"
    } else {
        codec
    }
}

fn codec_family(codec: &str) -> String {
    codec.split('.').next().unwrap_or(codec).to_string()
}

pub fn process_formats(raw: &[RawFormat]) -> HashMap<String, Format> {
    let mut formats = HashMap::new();
    for format in raw {
        let bare_id = format.format_id.replace("-dash", "").replace("-drc", "");
        if is_non_default_language(&bare_id, format.format_note.as_deref()) {
            tracing::debug!("[resolver] ignoring non-default language {}", format.format_id);
            continue;
        }

        let throttled = format
            .format_note
            .as_deref()
            .is_some_and(|n| n.contains("THROTTLED"));

        let mut protocol = Protocol::parse(&format.protocol);
        if protocol == Protocol::Segmented && format.fragment_base_url.is_none() {
            tracing::warn!(
                "[resolver] {} is segmented without a base url, using https",
                format.format_id
            );
            protocol = Protocol::Direct;
        }

        let entry = match protocol {
            Protocol::Direct => Format {
                protocol,
                url: format.url.clone(),
                throttled,
                fragments: Vec::new(),
            },
            Protocol::Segmented => Format {
                protocol,
                url: format.fragment_base_url.clone(),
                throttled,
                fragments: format.fragments.clone().unwrap_or_default(),
            },
            Protocol::Unsupported => Format {
                protocol,
                url: None,
                throttled,
                fragments: Vec::new(),
            },
        };
        formats.insert(format.format_id.clone(), entry);
    }
    formats
}

fn compare_variants(a: &Variant, b: &Variant) -> Ordering {
    let rank = |list: &[&str], codec: &str| list.iter().position(|c| *c == codec);
    b.height
        .cmp(&a.height)
        .then_with(|| b.fps.partial_cmp(&a.fps).unwrap_or(Ordering::Equal))
        .then_with(|| b.abr.partial_cmp(&a.abr).unwrap_or(Ordering::Equal))
        .then_with(|| rank(&VIDEO_CODECS, &a.v_codec).cmp(&rank(&VIDEO_CODECS, &b.v_codec)))
        .then_with(|| rank(&AUDIO_CODECS, &a.a_codec).cmp(&rank(&AUDIO_CODECS, &b.a_codec)))
}

/// Video-only x audio-only pairings the muxer can handle, best first.
pub fn generate_variants(raw: &[RawFormat]) -> Vec<Variant> {
    let mut video_only = Vec::new();
    let mut audio_only = Vec::new();

    for format in raw {
        let protocol = Protocol::parse(&format.protocol);
        if protocol == Protocol::Unsupported {
            continue;
        }
        if format.format_id.contains("-dash") || format.format_id.contains("-drc") {
            continue;
        }
        if is_non_default_language(&format.format_id, format.format_note.as_deref()) {
            continue;
        }
        if format.filesize.or(format.filesize_approx).is_none() {
            tracing::warn!("[resolver] no filesize for format {}", format.format_id);
            continue;
        }

        let vcodec = format.vcodec.as_deref().filter(|c| *c != "none");
        let acodec = format.acodec.as_deref().filter(|c| *c != "none");
        match (vcodec, acodec) {
            (Some(v), None) => video_only.push((format, codec_family(normalize_vcodec(v)))),
            (None, Some(a)) => audio_only.push((format, codec_family(a))),
            _ => {}
        }
    }

    let mut variants = Vec::new();
    for (video, vcodec) in &video_only {
        if !["vp9", "avc1", "av01"].contains(&vcodec.as_str()) {
            continue;
        }
        for (audio, acodec) in &audio_only {
            if !AUDIO_CODECS.contains(&acodec.as_str()) {
                continue;
            }
            let v_size = video.filesize.or(video.filesize_approx).unwrap_or(0);
            let a_size = audio.filesize.or(audio.filesize_approx).unwrap_or(0);
            variants.push(Variant {
                id: 0,
                v_format_id: video.format_id.clone(),
                v_codec: vcodec.clone(),
                width: video.width.unwrap_or(0),
                height: video.height.unwrap_or(0),
                fps: video.fps.unwrap_or(0.0),
                vbr: video.vbr.unwrap_or(0.0),
                a_format_id: audio.format_id.clone(),
                a_codec: acodec.clone(),
                abr: audio.abr.unwrap_or(0.0),
                filesize: v_size + a_size,
                is_approx_filesize: video.filesize.is_none() || audio.filesize.is_none(),
            });
        }
    }

    variants.sort_by(compare_variants);
    for (i, variant) in variants.iter_mut().enumerate() {
        variant.id = i as i32;
    }
    variants
}

pub fn process_chapters(raw: Option<&[RawChapter]>) -> Option<Vec<Chapter>> {
    let chapters: Vec<Chapter> = raw?
        .iter()
        .filter(|c| !c.title.is_empty() && c.start_time >= 0.0 && c.end_time >= 0.0)
        .map(|c| Chapter {
            title: c.title.clone(),
            start_time: c.start_time,
            end_time: c.end_time,
        })
        .collect();
    (!chapters.is_empty()).then_some(chapters)
}

pub fn container_options(vcodec: &str, acodec: &str) -> Vec<&'static str> {
    CONTAINERS
        .iter()
        .filter(|(_, v, a)| v.contains(&vcodec) && a.contains(&acodec))
        .map(|(name, _, _)| *name)
        .collect()
}

/// `/lmt/{value}` path segment, else the `lmt` query parameter.
pub fn extract_lmt(raw_url: Option<&str>) -> String {
    let Some(parsed) = raw_url.and_then(|u| url::Url::parse(u).ok()) else {
        return String::new();
    };
    if let Some(mut segments) = parsed.path_segments() {
        while let Some(segment) = segments.next() {
            if segment == "lmt" {
                return segments.next().unwrap_or_default().to_string();
            }
        }
    }
    parsed
        .query_pairs()
        .find(|(k, _)| k == "lmt")
        .map(|(_, v)| v.to_string())
        .unwrap_or_default()
}

pub fn variant_description(variant: &Variant, video: &Format, audio: &Format) -> String {
    let marks = |f: &Format| {
        format!(
            "{}{}",
            if f.throttled { "!" } else { "" },
            if f.protocol == Protocol::Segmented { "?" } else { "" }
        )
    };
    format!(
        "{}{}  {}p{}  {}{}@{}",
        marks(video),
        variant.v_codec,
        variant.height,
        variant.fps,
        marks(audio),
        variant.a_codec,
        variant.abr.round()
    )
}

/// Snapshot of `variant` using the formats with ids `v_format_id` and
/// `a_format_id`, which may be the `-dash` twins of the variant's own.
pub fn select_variant_with(
    variant: &Variant,
    formats: &HashMap<String, Format>,
    v_format_id: &str,
    a_format_id: &str,
) -> Option<SelectedVariant> {
    let video = formats.get(v_format_id)?;
    let audio = formats.get(a_format_id)?;
    Some(SelectedVariant {
        id: variant.id,
        v_format_id: v_format_id.to_string(),
        a_format_id: a_format_id.to_string(),
        v_itag: variant.v_format_id.replace("-dash", ""),
        a_itag: variant.a_format_id.replace("-dash", ""),
        v_protocol: video.protocol,
        a_protocol: audio.protocol,
        v_throttled: video.throttled,
        a_throttled: audio.throttled,
        video_lmt: extract_lmt(video.url.as_deref()),
        audio_lmt: extract_lmt(audio.url.as_deref()),
        description: variant_description(variant, video, audio),
        is_approx_filesize: variant.is_approx_filesize,
        v_codec: variant.v_codec.clone(),
        a_codec: variant.a_codec.clone(),
        width: variant.width,
        height: variant.height,
        fps: variant.fps,
        abr: variant.abr,
    })
}

pub fn select_variant(variant: &Variant, formats: &HashMap<String, Format>) -> Option<SelectedVariant> {
    select_variant_with(variant, formats, &variant.v_format_id, &variant.a_format_id)
}

/// `20091025` -> `2009-10-25`
pub fn format_upload_date(raw: &str) -> String {
    chrono::NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 6] = [
        (1 << 60, "EB"),
        (1 << 50, "PB"),
        (1 << 40, "TB"),
        (1 << 30, "GB"),
        (1 << 20, "MB"),
        (1 << 10, "KB"),
    ];
    if bytes == 0 {
        return "0".to_string();
    }
    for (size, suffix) in UNITS {
        if bytes >= size {
            let value = format!("{:.2}", bytes as f64 / size as f64);
            let value = value.trim_end_matches('0').trim_end_matches('.');
            return format!("{} {}", value, suffix);
        }
    }
    format!("{} B", bytes)
}

/// Builds a new job for `video_id` with the best variant selected.
pub fn new_job(
    video_id: &str,
    resolved: &ResolvedVideo,
    save_to: &Path,
    template: &str,
) -> anyhow::Result<DownloadJob> {
    let info = &resolved.info;
    if info.live_status != "not_live" && info.live_status != "was_live" {
        return Err(ResolveError::Live(info.live_status.clone()).into());
    }

    let formats = process_formats(&info.formats);
    let variants = generate_variants(&info.formats);
    let chapters = process_chapters(info.chapters.as_deref());

    let Some(best) = variants.first() else {
        bail!("no compatible variant for {}", video_id);
    };
    let Some(selected) = select_variant(best, &formats) else {
        bail!("formats of the best variant are missing for {}", video_id);
    };
    let Some(container) = container_options(&best.v_codec, &best.a_codec).first().copied() else {
        bail!("no container for {}+{}", best.v_codec, best.a_codec);
    };

    let upload_date = format_upload_date(&info.upload_date);
    let filename = filename::generate_filename(
        template,
        &FilenameFields {
            video_id,
            title: &info.title,
            channel: &info.channel,
            upload_date: &upload_date,
            width: best.width,
            height: best.height,
            fps: best.fps,
            video_codec: &best.v_codec,
            audio_codec: &best.a_codec,
            audio_bitrate: best.abr,
            container,
        },
    );

    Ok(DownloadJob {
        id: 0,
        video_id: video_id.to_string(),
        uuid: ids::new_instance_id(),
        priority: 0,
        title: info.title.clone(),
        filesize: best.filesize,
        selected_variant: selected,
        variants: variants.clone(),
        formats,
        chapters,
        duration: info.duration_string.clone(),
        filename,
        container: container.to_string(),
        save_to: save_to.to_path_buf(),
        upload_date,
        channel_id: info.channel_id.clone(),
        channel_title: info.channel.clone(),
        missing_formats: resolved.missing_formats,
        enabled: true,
        completed: false,
        bytes_loaded: 0,
        error: None,
        downloading: false,
        refreshing: false,
        phase: JobPhase::Idle,
        speed: 0,
        connections: 0,
    })
}
