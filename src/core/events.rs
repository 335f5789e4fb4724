pub use tubedl_core::core::events::*;

/// Logs every engine event before handing it to the wrapped emitter.
#[derive(Clone)]
pub struct LoggingEmitter<E> {
    inner: E,
}

impl<E: EventEmitter> LoggingEmitter<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: EventEmitter> EventEmitter for LoggingEmitter<E> {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::Completed { id, bytes_loaded } => {
                tracing::info!(download_id = id, "[engine] completed, {} bytes", bytes_loaded)
            }
            EngineEvent::Stopped { id } => tracing::info!(download_id = id, "[engine] stopped"),
            EngineEvent::Error { id, message } => {
                tracing::warn!(download_id = id, "[engine] failed: {}", message)
            }
            EngineEvent::Progress { total_speed, jobs } => {
                tracing::trace!("[engine] {} jobs at {} B/s", jobs.len(), total_speed)
            }
            EngineEvent::RefreshFinished { id, success } => {
                tracing::info!(download_id = id, "[engine] refresh finished, success={}", success)
            }
            EngineEvent::Fatal { message } => tracing::error!("[engine] fatal: {}", message),
        }
        self.inner.emit(event);
    }
}
