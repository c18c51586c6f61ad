use std::io;

use thiserror::Error;

/// Failure of a port allocation request. Always returned to the caller as a
/// value; pool exhaustion is an ordinary outcome, not an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortPoolError {
    #[error("a live server port already exists for this service description")]
    UniqueServerPortAlreadyExists,
    #[error("the client port pool has no free slots")]
    ClientPortListFull,
    #[error("the server port pool has no free slots")]
    ServerPortListFull,
}

/// Top-level library error.
#[derive(Debug, Error)]
pub enum PortmemError {
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("segment does not carry a compatible broker layout")]
    IncompatibleSegment,
    #[error("identifier of {len} bytes exceeds the limit of {max} bytes")]
    NameTooLong { len: usize, max: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Pool(#[from] PortPoolError),
}

/// Classified faults reported to the error sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// An application tried to register a second server for a service
    /// description that already has a live one.
    ServerPortNotUnique,
    /// A pool slot was found in a state the protocol cannot produce.
    PortPoolCorrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Misbehaving or misconfigured application; the broker keeps running.
    Moderate,
    Severe,
    /// Invariant corruption; the process must not continue.
    Fatal,
}

/// Where the broker reports policy violations. The sink decides how reports
/// are persisted or propagated; the broker only classifies them.
pub trait ErrorSink {
    fn report(&self, fault: Fault, severity: Severity);
}

/// Default sink: structured log records. Fatal faults abort the process.
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, fault: Fault, severity: Severity) {
        match severity {
            Severity::Moderate => tracing::warn!(?fault, "policy violation"),
            Severity::Severe => tracing::error!(?fault, "severe fault"),
            Severity::Fatal => {
                tracing::error!(?fault, "fatal fault, aborting");
                std::process::abort();
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct RecordingSink {
    reports: std::sync::Mutex<Vec<(Fault, Severity)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn new() -> RecordingSink {
        RecordingSink {
            reports: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn reports(&self) -> Vec<(Fault, Severity)> {
        self.reports.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl ErrorSink for RecordingSink {
    fn report(&self, fault: Fault, severity: Severity) {
        self.reports.lock().unwrap().push((fault, severity));
    }
}
