//! Run lifecycle notifications.
//!
//! Subscribers register per [`EventKind`] and are called synchronously, in
//! subscription order, from the task driving the run. A subscriber error
//! aborts the run and propagates to the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Subscriber callback: receives the experiment name and the event.
pub type Handler = Arc<dyn Fn(&str, &RunEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    RunReady,
    Output,
    RunFailed,
    RunComplete,
    FileCombined,
    Combined,
    RunFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::RunReady,
        EventKind::Output,
        EventKind::RunFailed,
        EventKind::RunComplete,
        EventKind::FileCombined,
        EventKind::Combined,
        EventKind::RunFinished,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::RunReady => "run:ready",
            EventKind::Output => "run:output",
            EventKind::RunFailed => "run:failed",
            EventKind::RunComplete => "run:complete",
            EventKind::FileCombined => "run:file_combined",
            EventKind::Combined => "run:combined",
            EventKind::RunFinished => "run:finished",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Staging done, the model is about to launch.
    Ready { run: u32 },
    /// One line of model stdout/stderr.
    Output { line: String },
    Failed { run: u32 },
    Complete { run: u32 },
    /// One diagnostics file consolidated into the output directory.
    FileCombined { run: u32, file: PathBuf },
    /// All restart fragments consolidated.
    Combined { run: u32 },
    Finished { run: u32 },
}

impl RunEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RunEvent::Ready { .. } => EventKind::RunReady,
            RunEvent::Output { .. } => EventKind::Output,
            RunEvent::Failed { .. } => EventKind::RunFailed,
            RunEvent::Complete { .. } => EventKind::RunComplete,
            RunEvent::FileCombined { .. } => EventKind::FileCombined,
            RunEvent::Combined { .. } => EventKind::Combined,
            RunEvent::Finished { .. } => EventKind::RunFinished,
        }
    }
}

#[derive(Default, Clone)]
pub struct EventBus {
    handlers: BTreeMap<EventKind, Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `kind`. Returns the stored handler.
    pub fn on<F>(&mut self, kind: EventKind, callback: F) -> Handler
    where
        F: Fn(&str, &RunEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(callback);
        self.handlers.entry(kind).or_default().push(Arc::clone(&handler));
        handler
    }

    /// Deliver `event` to its subscribers. Returns whether any ran.
    pub fn emit(&self, experiment: &str, event: &RunEvent) -> anyhow::Result<bool> {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return Ok(false);
        };
        for handler in handlers {
            handler(experiment, event)?;
        }
        Ok(!handlers.is_empty())
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(k, v)| (k.name(), v.len()))
            .collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}
