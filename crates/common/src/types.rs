use serde::Serialize;
use thiserror::Error;

/// Final status reported to the task callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAIL")]
    Fail,
}

/// Millisecond epoch timestamps for one task's lifecycle.
///
/// `started_at` is stamped when the task is dequeued, `completed_at` when it
/// settles. Both stay `None` until then.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskTiming {
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl TaskTiming {
    pub fn new() -> Self {
        Self {
            created_at: epoch_millis(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(epoch_millis());
    }

    pub fn mark_completed(&mut self) {
        self.completed_at = Some(epoch_millis());
    }

    /// Queue wait in milliseconds, if the task was dispatched.
    pub fn pending_millis(&self) -> Option<u64> {
        self.started_at.map(|s| s.saturating_sub(self.created_at))
    }

    /// Execution time in milliseconds, if the task settled.
    pub fn processing_millis(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => Some(c.saturating_sub(s)),
            _ => None,
        }
    }
}

/// Current time as milliseconds since the unix epoch.
pub fn epoch_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Classified task failure, surfaced to callers in the FAIL payload.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Script exceeded the configured hard deadline.
    #[error("TimeOut in script")]
    Timeout,

    /// Script failed the pre-flight syntax check and never touched a session.
    #[error("Syntax error in script: {0}")]
    ScriptSyntax(String),

    /// Script threw or rejected while running in the browser.
    #[error("Fail in script calling: {0}")]
    ScriptRuntime(String),

    /// Session or driver level failure not attributable to the script.
    /// `retryable` marks the "browser not running" subtype that triggers
    /// relaunch + requeue instead of a caller-visible failure.
    #[error("Browser infrastructure error: {message}")]
    Infrastructure { message: String, retryable: bool },

    /// Process-level shutdown while the task was still queued.
    #[error("Fatal worker error, task abandoned")]
    Fatal,
}

impl TaskError {
    /// Machine-readable kind for payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ScriptSyntax(_) => "SCRIPT_SYNTAX_ERROR",
            Self::ScriptRuntime(_) => "SCRIPT_RUNTIME_ERROR",
            Self::Infrastructure { .. } => "INFRASTRUCTURE_ERROR",
            Self::Fatal => "FATAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure { retryable: true, .. })
    }
}

/// Error-string signatures that mean the shared browser process is gone.
///
/// The driver reports a dead browser indirectly: commands fail with a closed
/// websocket or a missing target rather than a dedicated error type.
pub fn is_browser_gone_error(msg: &str) -> bool {
    msg.contains("connection is closed")
        || msg.contains("Browser closed")
        || msg.contains("No such process")
        || msg.contains("failed to connect to browser")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_orders_timestamps() {
        let mut timing = TaskTiming::new();
        assert!(timing.started_at.is_none());
        assert!(timing.pending_millis().is_none());

        timing.mark_started();
        timing.mark_completed();

        let started = timing.started_at.unwrap();
        let completed = timing.completed_at.unwrap();
        assert!(timing.created_at <= started);
        assert!(started <= completed);
        assert!(timing.processing_millis().is_some());
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(TaskError::Timeout.kind(), "TIMEOUT");
        assert_eq!(
            TaskError::ScriptSyntax("bad".into()).kind(),
            "SCRIPT_SYNTAX_ERROR"
        );
        assert_eq!(
            TaskError::ScriptRuntime("boom".into()).kind(),
            "SCRIPT_RUNTIME_ERROR"
        );
        assert!(TaskError::Infrastructure {
            message: "ws closed".into(),
            retryable: true
        }
        .is_retryable());
        assert!(!TaskError::Timeout.is_retryable());
    }

    #[test]
    fn browser_gone_signatures() {
        assert!(is_browser_gone_error("the connection is closed"));
        assert!(is_browser_gone_error("Browser closed before response"));
        assert!(!is_browser_gone_error("net::ERR_NAME_NOT_RESOLVED"));
    }
}
