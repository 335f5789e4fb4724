use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::core::fragments::FileStats;
use crate::models::download::PartKind;
use crate::models::media::Protocol;

/// Part currently being fetched for a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPart {
    pub kind: PartKind,
    pub itag: String,
    pub format_id: String,
    pub protocol: Protocol,
    pub path: PathBuf,
    pub fragments_dir: PathBuf,
    pub fragment_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingFragment {
    pub index: usize,
    pub file_id: String,
    pub url: String,
    pub filename: String,
}

/// Per-tick accumulators filled from `tellActive`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickAccumulator {
    pub speed: u64,
    pub connections: u32,
    pub loaded: u64,
}

/// In-memory bookkeeping of one running job. Never persisted.
#[derive(Debug)]
pub struct RuntimePackage {
    pub job_id: i64,
    pub current: Option<CurrentPart>,
    /// Bytes of parts and fragments confirmed complete.
    pub bytes_loaded: u64,
    pub remaining: VecDeque<PendingFragment>,
    /// Fragments issued or waiting for a retry, not yet complete.
    pub in_flight: usize,
    pub gids: HashSet<String>,
    pub cancel: CancellationToken,
    pub stopped: bool,
    pub merging: bool,
    pub file_stats: FileStats,
    pub tick: TickAccumulator,
}

impl RuntimePackage {
    pub fn new(job_id: i64, file_stats: FileStats) -> Self {
        Self {
            job_id,
            current: None,
            bytes_loaded: 0,
            remaining: VecDeque::new(),
            in_flight: 0,
            gids: HashSet::new(),
            cancel: CancellationToken::new(),
            stopped: false,
            merging: false,
            file_stats,
            tick: TickAccumulator::default(),
        }
    }

    pub fn is_segmented(&self) -> bool {
        matches!(
            self.current,
            Some(CurrentPart {
                protocol: Protocol::Segmented,
                ..
            })
        )
    }

    pub fn ready_to_merge(&self) -> bool {
        self.is_segmented()
            && !self.stopped
            && !self.merging
            && self.remaining.is_empty()
            && self.in_flight == 0
    }
}

/// A transfer the accelerator currently owns, keyed by gid.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTransfer {
    pub job_id: i64,
    pub file_id: String,
    pub url: String,
    pub dir: PathBuf,
    pub filename: String,
    /// Fragment index; `None` for a whole direct part.
    pub fragment: Option<usize>,
}

impl ActiveTransfer {
    pub fn local_path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    pub fn control_file(&self) -> PathBuf {
        self.dir.join(format!("{}.aria2", self.filename))
    }
}

pub type TransferTable = HashMap<String, ActiveTransfer>;
