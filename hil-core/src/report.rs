//! Pipeline event stream.
//!
//! The orchestrator never returns causal detail to its caller; everything
//! that happened during a run is told to a [`Reporter`] as a sequence of
//! typed events.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Which part of the pipeline an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Build,
    Download,
    Test,
    Infrastructure,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Build => "build",
            EventType::Download => "download",
            EventType::Test => "test",
            EventType::Infrastructure => "infrastructure",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Passed,
    Failed,
    Complete,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Passed => "passed",
            EventKind::Failed => "failed",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
        }
    }

    /// Kinds that close a stage opened with [`EventKind::Start`].
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Passed | EventKind::Failed | EventKind::Complete
        )
    }
}

/// Event sink the orchestrator reports to.
pub trait Reporter: Send + Sync {
    fn event(&self, event_type: EventType, kind: EventKind, detail: Option<&str>);
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.event_type.as_str(), self.kind.as_str())?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Reporter that keeps every event in memory and mirrors it to `tracing`.
///
/// Cloning shares the underlying log, so one clone can be handed to the
/// pipeline while another is kept to inspect the events afterwards.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
    instance: Option<String>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every traced event with the given instance.
    pub fn for_instance(instance: impl Into<String>) -> Self {
        EventLog {
            events: Arc::default(),
            instance: Some(instance.into()),
        }
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stages that were started but never closed by a terminal event.
    pub fn dangling(&self) -> Vec<EventType> {
        let mut open: Vec<EventType> = Vec::new();
        for event in self.events() {
            if event.kind == EventKind::Start {
                open.push(event.event_type);
            } else if event.kind.is_terminal() {
                if let Some(pos) = open.iter().position(|t| *t == event.event_type) {
                    open.remove(pos);
                }
            }
        }
        open
    }
}

impl Reporter for EventLog {
    fn event(&self, event_type: EventType, kind: EventKind, detail: Option<&str>) {
        let instance = self.instance.as_deref().unwrap_or("-");
        match kind {
            EventKind::Failed | EventKind::Error => tracing::warn!(
                instance,
                event = event_type.as_str(),
                kind = kind.as_str(),
                detail = detail.unwrap_or(""),
                "Pipeline event"
            ),
            _ => tracing::info!(
                instance,
                event = event_type.as_str(),
                kind = kind.as_str(),
                detail = detail.unwrap_or(""),
                "Pipeline event"
            ),
        }

        let event = Event {
            event_type,
            kind,
            detail: detail.map(str::to_string),
        };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
