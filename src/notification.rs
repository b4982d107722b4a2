use crate::model::{AssignmentId, EmployeeId, RosterId};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

/// Nature d'une modification d'affectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Confirmed,
    Declined,
    Cancelled,
    Reassigned,
    TimeRecorded,
}

/// Événements émis par le moteur. Le canal et la mise en forme appartiennent au notifieur.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulingEvent {
    RosterPublished {
        roster: RosterId,
        employees: Vec<EmployeeId>,
    },
    AssignmentChanged {
        assignment: AssignmentId,
        change: ChangeKind,
    },
    SwapRequested {
        assignment: AssignmentId,
        from: EmployeeId,
        to: EmployeeId,
    },
    SwapResolved {
        assignment: AssignmentId,
        approved: bool,
    },
    ShiftReminder {
        assignment: AssignmentId,
        lead_days: u32,
    },
}

/// Consommateur des événements de planification.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &SchedulingEvent);
}

/// Ignore tout.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &SchedulingEvent) {}
}

/// Conserve les événements en mémoire.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<SchedulingEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<SchedulingEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take(&self) -> Vec<SchedulingEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &SchedulingEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Trace chaque événement via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &SchedulingEvent) {
        tracing::info!(?event, "scheduling event");
    }
}

/// Écrit un objet JSON par ligne (sortie du CLI).
pub struct JsonLinesNotifier {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesNotifier {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn write_event(&self, event: &SchedulingEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event).context("encoding event")?;
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(out, "{line}").context("writing event")?;
        out.flush()?;
        Ok(())
    }
}

impl Notifier for JsonLinesNotifier {
    fn notify(&self, event: &SchedulingEvent) {
        if let Err(err) = self.write_event(event) {
            tracing::warn!(error = %err, "dropping scheduling event");
        }
    }
}
