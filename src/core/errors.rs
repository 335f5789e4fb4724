use thiserror::Error;

/// Failures of the metadata resolver, each with the tool's diagnostic text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Unavailable")]
    Unavailable(String),
    #[error("Private")]
    Private(String),
    #[error("Members only")]
    MembersOnly(String),
    #[error("Upcoming")]
    Upcoming(String),
    #[error("Bot check")]
    BotCheck(String),
    #[error("Not found")]
    NotFound(String),
    #[error("Is Live ({0})")]
    Live(String),
    #[error("resolver timed out")]
    Timeout,
    #[error("resolver failed after retries: {0}")]
    Exhausted(String),
    #[error("resolver output could not be parsed: {0}")]
    Parse(String),
    #[error("cancelled")]
    Cancelled,
}

impl ResolveError {
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ResolveError::Unavailable(d)
            | ResolveError::Private(d)
            | ResolveError::MembersOnly(d)
            | ResolveError::Upcoming(d)
            | ResolveError::BotCheck(d)
            | ResolveError::NotFound(d)
            | ResolveError::Exhausted(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    Expired,
    Transient,
    /// "Download aborted." is transient only when an empty `.aria2` control
    /// file can be removed first; otherwise it is treated as unknown.
    Aborted,
    DiskFull,
    Unknown,
}

const RETRYABLE_CODES: [&str; 8] = ["1", "2", "6", "19", "22", "23", "24", "29"];

/// Maps an aria2 exit code (as reported by `tellStatus`) to a transfer error
/// class. This is the only place that knows aria2's numeric codes.
pub fn classify_transfer_error(code: &str, message: &str) -> TransferErrorKind {
    if (code == "22" && message.contains("status=403")) || code == "3" {
        return TransferErrorKind::Expired;
    }
    if code == "1" && message == "Download aborted." {
        return TransferErrorKind::Aborted;
    }
    if RETRYABLE_CODES.contains(&code) {
        return TransferErrorKind::Transient;
    }
    if code == "9" {
        return TransferErrorKind::DiskFull;
    }
    TransferErrorKind::Unknown
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("not enough space, {required} bytes required")]
    NoSpace { required: u64 },
    #[error("merge stopped")]
    Stopped,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MuxError {
    #[error("No Space")]
    NoSpace,
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
}

impl MuxError {
    /// Message shown on the job.
    pub fn job_message(&self) -> String {
        match self {
            MuxError::Failed(reason) if reason.is_empty() => "Mux Failed".to_string(),
            other => format!("Mux Failed ({})", other),
        }
    }
}
