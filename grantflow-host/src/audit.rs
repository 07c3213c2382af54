//! Audit trail of negotiation sessions
//!
//! Each session step becomes an [`AuditEvent`] handed to an [`AuditSink`].
//! Capability sets are recorded as a count plus a content hash rather than a
//! full list.

use grantflow_api::{Capability, CapabilitySet, SessionPhase, UserChoice};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::policy::Classification;

/// Audit event representing one step of a negotiation
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// RFC 3339 timestamp of the event
    pub timestamp: String,
    /// Type of event
    pub event_type: AuditEventType,
    /// Session the event belongs to
    pub session: u64,
    /// Capability concerned (if the event is about a single one)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    /// Additional details
    pub details: AuditDetails,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, session: u64, details: AuditDetails) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event_type,
            session,
            capability: None,
            details,
        }
    }

    /// Attach the capability the event is about
    pub fn with_capability(mut self, capability: &Capability) -> Self {
        self.capability = Some(capability.clone());
        self
    }
}

/// Type of audit event
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    NegotiationStarted,
    /// Refused before any classification (busy surface, bad request)
    NegotiationRejected,
    CapabilityClassified,
    RationaleAnswered,
    SettingsPromptAnswered,
    SettingsOpened,
    CapabilitiesPrompted,
    CapabilityGranted,
    CapabilityDenied,
    NegotiationResolved,
    /// Torn down or aborted without an outcome
    NegotiationAbandoned,
}

/// Details about the audit event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditDetails {
    Request {
        capabilities_hash: String,
        count: usize,
    },
    Classification {
        classification: Classification,
    },
    Dialog {
        choice: UserChoice,
        capabilities_hash: String,
    },
    Decision {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Resolution {
        granted: usize,
        denied: usize,
        deferred: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Lifecycle {
        phase: SessionPhase,
    },
}

/// Error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("audit event could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for audit events
///
/// Recording happens on the session's task, so implementations should
/// return quickly. A failed record is logged by the session and otherwise
/// ignored.
///
/// # Example
///
/// ```rust
/// use grantflow_host::audit::{AuditError, AuditEvent, AuditSink};
///
/// struct StderrAuditSink;
///
/// impl AuditSink for StderrAuditSink {
///     fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
///         eprintln!("[session {}] {:?}", event.session, event.event_type);
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Push buffered events to their destination
    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

// ============================================================================
// Stock sinks
// ============================================================================

/// Appends one JSON object per line to a file
///
/// Lines are written through as they complete, so a log stays readable even
/// if the process dies while the user is in the settings surface.
pub struct FileAuditSink {
    path: PathBuf,
    file: Mutex<LineWriter<File>>,
}

impl FileAuditSink {
    /// Open (or create) the log, creating parent directories as needed
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(&line)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditSink").field("path", &self.path).finish()
    }
}

/// Number of events [`MemoryAuditSink::new`] keeps
pub const DEFAULT_MEMORY_CAPACITY: usize = 512;

/// Keeps the most recent events in memory; the oldest are dropped first
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::bounded(DEFAULT_MEMORY_CAPACITY)
    }

    /// Keep at most `capacity` events
    pub fn bounded(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.select(|_| true)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.select(|e| e.event_type == event_type)
    }

    pub fn find_by_session(&self, session: u64) -> Vec<AuditEvent> {
        self.select(|e| e.session == session)
    }

    fn select(&self, keep: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEvent> {
        self.lock().iter().filter(|&e| keep(e)).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("events", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Discards every event
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Forwards each event to several sinks
///
/// Every sink sees every event even when an earlier one fails; the first
/// failure is returned.
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(self, sink: impl AuditSink + 'static) -> Self {
        self.with_shared(Arc::new(sink))
    }

    /// Add a sink the caller keeps a handle to
    pub fn with_shared(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn each(&self, op: impl Fn(&dyn AuditSink) -> Result<(), AuditError>) -> Result<(), AuditError> {
        self.sinks
            .iter()
            .map(|sink| op(sink.as_ref()))
            .fold(Ok(()), |first, result| first.and(result))
    }
}

impl AuditSink for CompositeAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.each(|sink| sink.record(event.clone()))
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.each(|sink| sink.flush())
    }
}

impl fmt::Debug for CompositeAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeAuditSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

pub fn negotiation_started(session: u64, requested: &CapabilitySet) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::NegotiationStarted,
        session,
        AuditDetails::Request {
            capabilities_hash: requested.compute_hash(),
            count: requested.len(),
        },
    )
}

pub fn negotiation_rejected(session: u64, reason: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::NegotiationRejected,
        session,
        AuditDetails::Decision {
            reason: Some(reason.to_string()),
        },
    )
}

pub fn capability_classified(
    session: u64,
    capability: &Capability,
    classification: Classification,
) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::CapabilityClassified,
        session,
        AuditDetails::Classification { classification },
    )
    .with_capability(capability)
}

pub fn dialog_answered(
    session: u64,
    event_type: AuditEventType,
    choice: UserChoice,
    capabilities: &CapabilitySet,
) -> AuditEvent {
    AuditEvent::new(
        event_type,
        session,
        AuditDetails::Dialog {
            choice,
            capabilities_hash: capabilities.compute_hash(),
        },
    )
}

pub fn capabilities_prompted(session: u64, capabilities: &CapabilitySet) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::CapabilitiesPrompted,
        session,
        AuditDetails::Request {
            capabilities_hash: capabilities.compute_hash(),
            count: capabilities.len(),
        },
    )
}

pub fn capability_granted(session: u64, capability: &Capability) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::CapabilityGranted,
        session,
        AuditDetails::Decision { reason: None },
    )
    .with_capability(capability)
}

pub fn capability_denied(session: u64, capability: &Capability, reason: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::CapabilityDenied,
        session,
        AuditDetails::Decision {
            reason: Some(reason.to_string()),
        },
    )
    .with_capability(capability)
}

pub fn negotiation_resolved(
    session: u64,
    granted: usize,
    denied: usize,
    deferred: usize,
    error: Option<String>,
) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::NegotiationResolved,
        session,
        AuditDetails::Resolution {
            granted,
            denied,
            deferred,
            error,
        },
    )
}

pub fn negotiation_abandoned(session: u64, phase: SessionPhase) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::NegotiationAbandoned,
        session,
        AuditDetails::Lifecycle { phase },
    )
}
