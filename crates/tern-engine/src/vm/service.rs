//! Service events
//!
//! Reload outcomes are published as service events on an in-VM event log.
//! Tooling (an IDE, a test harness) drains the log to observe reload success
//! or failure; the engine reports at most one error and exactly one success
//! per reload.

/// Kind of a service event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEventKind {
    /// A reload finished (successfully or not)
    IsolateReload,
}

/// A published service event
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// What happened
    pub kind: ServiceEventKind,
    /// The error message, when the event reports a failure
    pub error: Option<String>,
}

impl ServiceEvent {
    /// A successful-reload event
    pub fn reload_success() -> Self {
        Self {
            kind: ServiceEventKind::IsolateReload,
            error: None,
        }
    }

    /// A failed-reload event carrying the error message
    pub fn reload_error(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceEventKind::IsolateReload,
            error: Some(message.into()),
        }
    }

    /// Whether this event reports an error
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The in-VM service event log
#[derive(Debug, Default)]
pub struct ServiceEventLog {
    events: Vec<ServiceEvent>,
}

impl ServiceEventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event
    pub fn handle_event(&mut self, event: ServiceEvent) {
        self.events.push(event);
    }

    /// All published events, oldest first
    pub fn events(&self) -> &[ServiceEvent] {
        &self.events
    }

    /// The most recent event, if any
    pub fn last(&self) -> Option<&ServiceEvent> {
        self.events.last()
    }

    /// Drop all events
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_ordering() {
        let mut log = ServiceEventLog::new();
        log.handle_event(ServiceEvent::reload_error("bad"));
        log.handle_event(ServiceEvent::reload_success());

        assert_eq!(log.events().len(), 2);
        assert!(log.events()[0].is_error());
        assert!(!log.last().unwrap().is_error());
    }
}
