//! Error taxonomy for process and stream lifecycle failures.
//!
//! Library code returns `MediaError`; binaries wrap it in `anyhow` with context.
//! Every variant carries a stable `code()` so callers can log or match on a
//! short identifier without parsing messages.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

/// Errors raised by supervisors, grabbers and frame pipes.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The supervised process exited before it became ready.
    #[error("process '{command}' exited before becoming ready ({status})")]
    Startup { command: String, status: String },

    /// The readiness predicate never succeeded within its deadline.
    #[error("process '{command}' did not become ready within {timeout:?}")]
    ReadinessTimeout { command: String, timeout: Duration },

    /// A capture source could not be opened.
    #[error("unable to open stream {source_id}: {reason}")]
    StreamOpen { source_id: String, reason: String },

    /// The background capture thread did not stop in time.
    #[error("unable to close stream {source_id} within {timeout:?}")]
    CloseTimeout { source_id: String, timeout: Duration },

    /// Source metadata could not be determined.
    #[error("unable to probe {source_id}: {reason}")]
    Probe { source_id: String, reason: String },

    /// Write to an encoder whose input channel is closed or broken.
    #[error("encoder input for {destination} is closed")]
    PipeClosed {
        destination: String,
        #[source]
        cause: io::Error,
    },

    /// An external program could not be spawned at all.
    #[error("failed to spawn '{program}'")]
    Spawn {
        program: String,
        #[source]
        cause: io::Error,
    },

    /// An external program ran to completion but reported failure.
    #[error("'{program}' exited with {status}")]
    ProcessFailed { program: String, status: ExitStatus },

    /// A pixel buffer did not match its declared shape.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MediaError {
    /// Stable short identifier for logs and exit reporting.
    pub fn code(&self) -> &'static str {
        match self {
            MediaError::Startup { .. } => "startup",
            MediaError::ReadinessTimeout { .. } => "readiness_timeout",
            MediaError::StreamOpen { .. } => "stream_open",
            MediaError::CloseTimeout { .. } => "close_timeout",
            MediaError::Probe { .. } => "probe",
            MediaError::PipeClosed { .. } => "pipe_closed",
            MediaError::Spawn { .. } => "spawn",
            MediaError::ProcessFailed { .. } => "process_failed",
            MediaError::InvalidFrame(_) => "invalid_frame",
            MediaError::Io(_) => "io",
        }
    }

    pub(crate) fn probe(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        MediaError::Probe {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn stream_open(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        MediaError::StreamOpen {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = MediaError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = MediaError::ReadinessTimeout {
            command: "mediamtx".to_string(),
            timeout: Duration::from_millis(100),
        };
        assert_eq!(err.code(), "readiness_timeout");
        assert!(err.to_string().contains("mediamtx"));

        let err = MediaError::probe("missing.mp4", "no video stream");
        assert_eq!(err.code(), "probe");
        assert_eq!(err.to_string(), "unable to probe missing.mp4: no video stream");
    }

    #[test]
    fn pipe_closed_keeps_io_cause() {
        let err = MediaError::PipeClosed {
            destination: "out.mp4".to_string(),
            cause: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        let cause = std::error::Error::source(&err).expect("io cause");
        assert!(cause.to_string().to_lowercase().contains("pipe"));
    }
}
