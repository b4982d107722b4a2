use super::{RosterDraft, SchedError, Scheduler};
use crate::auth::{Caller, Capability};
use crate::model::{
    EmployeeId, OrganizationId, Registry, RosterId, RosterStatus, ShiftRoster,
};
use crate::notification::SchedulingEvent;
use chrono::{Duration, NaiveDate};

impl Scheduler {
    /// Ouvre un planning en brouillon. Sans motif explicite, celui de la
    /// configuration s'applique.
    pub fn create_roster(&self, caller: &Caller, draft: RosterDraft) -> Result<ShiftRoster, SchedError> {
        self.authorizer.authorize(caller, Capability::Scheduler)?;
        if draft.name.trim().is_empty() {
            return Err(SchedError::Validation("roster name cannot be empty".into()));
        }
        if draft.end_date < draft.start_date {
            return Err(SchedError::Validation(format!(
                "roster ends ({}) before it starts ({})",
                draft.end_date, draft.start_date
            )));
        }

        let roster = ShiftRoster {
            id: RosterId::random(),
            organization: draft.organization,
            department: draft.department,
            name: draft.name,
            start_date: draft.start_date,
            end_date: draft.end_date,
            status: RosterStatus::Draft,
            rotation_pattern: draft
                .rotation_pattern
                .unwrap_or(self.config.default_rotation),
            auto_assign: draft.auto_assign,
            notification: draft.notification,
            submitted_at: None,
            approved_at: None,
            approved_by: None,
            published_at: None,
            published_by: None,
            archived_at: None,
            created_at: self.clock.now(),
        };
        self.store.transaction(|reg| {
            reg.rosters.push(roster.clone());
            Ok(())
        })?;
        tracing::debug!(roster = %roster.id, name = %roster.name, "roster created");
        Ok(roster)
    }

    /// Brouillon -> en attente. Un planning vide ne part pas en validation.
    pub fn submit_for_approval(&self, caller: &Caller, id: &RosterId) -> Result<ShiftRoster, SchedError> {
        self.authorizer.authorize(caller, Capability::Scheduler)?;
        let now = self.clock.now();
        self.store.transaction(|reg| {
            let live = reg.assignments_for_roster(id).filter(|a| a.is_live()).count();
            let roster = find_roster_mut(reg, id)?;
            advance(roster, RosterStatus::PendingApproval, "submit")?;
            if live == 0 {
                return Err(SchedError::Validation(format!(
                    "roster {} has no assignment to submit",
                    roster.name
                )));
            }
            roster.submitted_at = Some(now);
            Ok(roster.clone())
        })
    }

    pub fn approve(&self, caller: &Caller, id: &RosterId) -> Result<ShiftRoster, SchedError> {
        self.authorizer.authorize(caller, Capability::Approver)?;
        let now = self.clock.now();
        let roster = self.store.transaction(|reg| {
            let roster = find_roster_mut(reg, id)?;
            advance(roster, RosterStatus::Approved, "approve")?;
            roster.approved_at = Some(now);
            roster.approved_by = Some(caller.user.clone());
            Ok(roster.clone())
        })?;
        tracing::debug!(roster = %id, approver = %caller.user, "roster approved");
        Ok(roster)
    }

    /// Publie un planning approuvé. La liste des salariés notifiés est lue
    /// dans la même transaction que le changement de statut.
    pub fn publish(&self, caller: &Caller, id: &RosterId) -> Result<ShiftRoster, SchedError> {
        self.authorizer.authorize(caller, Capability::Scheduler)?;
        let now = self.clock.now();
        let (roster, employees) = self.store.transaction(|reg| {
            let employees = roster_employees(reg, id);
            let roster = find_roster_mut(reg, id)?;
            advance(roster, RosterStatus::Published, "publish")?;
            roster.published_at = Some(now);
            roster.published_by = Some(caller.user.clone());
            Ok((roster.clone(), employees))
        })?;

        tracing::info!(roster = %id, employees = employees.len(), "roster published");
        if roster.notification.notify_on_publish {
            self.emit(SchedulingEvent::RosterPublished {
                roster: roster.id.clone(),
                employees,
            });
        }
        Ok(roster)
    }

    /// Archivage depuis tout état non terminal ; un planning archivé
    /// n'est plus publié.
    pub fn archive(&self, caller: &Caller, id: &RosterId) -> Result<ShiftRoster, SchedError> {
        self.authorizer.authorize(caller, Capability::Scheduler)?;
        let now = self.clock.now();
        self.store.transaction(|reg| {
            let roster = find_roster_mut(reg, id)?;
            advance(roster, RosterStatus::Archived, "archive")?;
            roster.published_at = None;
            roster.published_by = None;
            roster.archived_at = Some(now);
            Ok(roster.clone())
        })
    }

    pub fn get_roster(&self, id: &RosterId) -> Result<ShiftRoster, SchedError> {
        self.store.read(|reg| {
            reg.find_roster(id)
                .cloned()
                .ok_or_else(|| SchedError::not_found("roster", id))
        })
    }

    /// Plannings d'une organisation, par date de début.
    pub fn list_rosters(&self, organization: &OrganizationId) -> Vec<ShiftRoster> {
        let mut out: Vec<ShiftRoster> = self.store.read(|reg| {
            reg.rosters
                .iter()
                .filter(|r| &r.organization == organization)
                .cloned()
                .collect()
        });
        out.sort_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.name.cmp(&b.name)));
        out
    }

    /// Émet et renvoie les rappels dus à la date `today`.
    pub fn due_reminders(&self, today: NaiveDate) -> Vec<SchedulingEvent> {
        let default_lead = self.config.reminder_lead_days;
        let events = self.store.read(|reg| reminders(reg, today, default_lead));
        tracing::debug!(%today, count = events.len(), "reminders due");
        self.emit_all(events.iter().cloned());
        events
    }
}

fn find_roster_mut<'a>(reg: &'a mut Registry, id: &RosterId) -> Result<&'a mut ShiftRoster, SchedError> {
    reg.find_roster_mut(id)
        .ok_or_else(|| SchedError::not_found("roster", id))
}

fn advance(roster: &mut ShiftRoster, next: RosterStatus, action: &'static str) -> Result<(), SchedError> {
    if !roster.status.can_transition_to(next) {
        return Err(SchedError::invalid_state(roster.status, action));
    }
    roster.status = next;
    Ok(())
}

/// Salariés portant au moins une affectation vivante du planning, une fois chacun.
fn roster_employees(reg: &Registry, id: &RosterId) -> Vec<EmployeeId> {
    let mut out: Vec<EmployeeId> = reg
        .assignments_for_roster(id)
        .filter(|a| a.is_live())
        .map(|a| a.employee.clone())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn reminders(reg: &Registry, today: NaiveDate, default_lead: u32) -> Vec<SchedulingEvent> {
    let mut due: Vec<(NaiveDate, &EmployeeId, SchedulingEvent)> = Vec::new();
    for a in reg.assignments.iter().filter(|a| a.is_live() && a.date > today) {
        let lead = match &a.roster {
            None => default_lead,
            Some(roster_id) => match reg.find_roster(roster_id) {
                Some(r) if r.is_published() => r.notification.reminder_days.unwrap_or(default_lead),
                _ => continue,
            },
        };
        if lead > 0 && a.date == today + Duration::days(i64::from(lead)) {
            due.push((
                a.date,
                &a.employee,
                SchedulingEvent::ShiftReminder {
                    assignment: a.id.clone(),
                    lead_days: lead,
                },
            ));
        }
    }
    due.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    due.into_iter().map(|(_, _, event)| event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::model::{RotationPattern, ShiftId};
    use crate::notification::RecordingNotifier;
    use crate::scheduler::ShiftSpec;
    use chrono::{NaiveTime, TimeZone, Utc};
    use std::sync::Arc;

    fn publication_consistent(roster: &ShiftRoster) -> bool {
        roster.is_published() == roster.published_at.is_some()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn planner() -> Caller {
        Caller::new("planner").with_capability(Capability::Scheduler)
    }

    fn approver() -> Caller {
        Caller::new("boss").with_capability(Capability::Approver)
    }

    struct Fixture {
        s: Scheduler,
        events: Arc<RecordingNotifier>,
        shift: ShiftId,
        org: OrganizationId,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 5, 20, 9, 0, 0).unwrap()));
        let s = Scheduler::new(EngineConfig::default())
            .with_notifier(events.clone())
            .with_clock(clock);
        let org = OrganizationId::new("org");
        let admin = Caller::new("admin").with_capability(Capability::SchedulerAdmin);
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        let shift = s
            .create_shift(&admin, ShiftSpec::new(org.clone(), "Morning", t(8), t(16)))
            .unwrap();
        Fixture { s, events, shift, org }
    }

    #[test]
    fn roster_defaults_and_validation() {
        let f = fixture();
        let r = f
            .s
            .create_roster(&planner(), RosterDraft::new(f.org.clone(), "June", day(1), day(30)))
            .unwrap();
        assert_eq!(r.status, RosterStatus::Draft);
        assert_eq!(r.rotation_pattern, RotationPattern::Weekly);

        let err = f
            .s
            .create_roster(&planner(), RosterDraft::new(f.org.clone(), "Bad", day(10), day(9)))
            .unwrap_err();
        assert!(matches!(err, SchedError::Validation(_)));
    }

    #[test]
    fn empty_roster_cannot_be_submitted() {
        let f = fixture();
        let r = f
            .s
            .create_roster(&planner(), RosterDraft::new(f.org.clone(), "June", day(1), day(30)))
            .unwrap();
        assert!(matches!(
            f.s.submit_for_approval(&planner(), &r.id),
            Err(SchedError::Validation(_))
        ));
        assert_eq!(f.s.get_roster(&r.id).unwrap().status, RosterStatus::Draft);
    }

    #[test]
    fn full_lifecycle_keeps_publication_consistent() {
        let f = fixture();
        let r = f
            .s
            .create_roster(&planner(), RosterDraft::new(f.org.clone(), "June", day(1), day(30)))
            .unwrap();
        for (who, d) in [("alice", 2), ("bob", 2), ("alice", 3)] {
            f.s.create_assignment(&planner(), &EmployeeId::new(who), &f.shift, day(d), Some(&r.id))
                .unwrap();
        }
        assert!(f.events.take().is_empty(), "draft rosters stay silent");

        assert!(matches!(
            f.s.publish(&planner(), &r.id),
            Err(SchedError::InvalidState { .. })
        ));
        let r1 = f.s.submit_for_approval(&planner(), &r.id).unwrap();
        assert!(publication_consistent(&r1));
        assert!(matches!(
            f.s.approve(&planner(), &r.id),
            Err(SchedError::Forbidden(_))
        ));
        f.s.approve(&approver(), &r.id).unwrap();
        let published = f.s.publish(&planner(), &r.id).unwrap();
        assert!(publication_consistent(&published));
        assert_eq!(published.published_by.as_ref().map(|u| u.as_str()), Some("planner"));

        assert_eq!(
            f.events.take(),
            vec![SchedulingEvent::RosterPublished {
                roster: r.id.clone(),
                employees: vec![EmployeeId::new("alice"), EmployeeId::new("bob")],
            }]
        );

        let archived = f.s.archive(&planner(), &r.id).unwrap();
        assert!(publication_consistent(&archived));
        assert!(archived.archived_at.is_some());
        assert!(matches!(
            f.s.archive(&planner(), &r.id),
            Err(SchedError::InvalidState { .. })
        ));
    }

    #[test]
    fn publish_respects_notification_policy() {
        let f = fixture();
        let mut draft = RosterDraft::new(f.org.clone(), "Quiet", day(1), day(7));
        draft.notification.notify_on_publish = false;
        let r = f.s.create_roster(&planner(), draft).unwrap();
        f.s.create_assignment(&planner(), &EmployeeId::new("alice"), &f.shift, day(2), Some(&r.id))
            .unwrap();
        f.s.submit_for_approval(&planner(), &r.id).unwrap();
        f.s.approve(&approver(), &r.id).unwrap();
        f.s.publish(&planner(), &r.id).unwrap();
        assert!(f.events.events().is_empty());
    }

    #[test]
    fn reminders_use_roster_lead_or_default() {
        let f = fixture();
        let mut draft = RosterDraft::new(f.org.clone(), "June", day(1), day(30));
        draft.notification.reminder_days = Some(3);
        let r = f.s.create_roster(&planner(), draft).unwrap();
        let in_roster = f
            .s
            .create_assignment(&planner(), &EmployeeId::new("alice"), &f.shift, day(4), Some(&r.id))
            .unwrap();
        let loose = f
            .s
            .create_assignment(&planner(), &EmployeeId::new("bob"), &f.shift, day(2), None)
            .unwrap();
        f.events.take();

        // brouillon : pas de rappel pour le planning
        assert_eq!(
            f.s.due_reminders(day(1)),
            vec![SchedulingEvent::ShiftReminder {
                assignment: loose.id.clone(),
                lead_days: 1,
            }]
        );

        f.s.submit_for_approval(&planner(), &r.id).unwrap();
        f.s.approve(&approver(), &r.id).unwrap();
        f.s.publish(&planner(), &r.id).unwrap();
        f.events.take();

        let due = f.s.due_reminders(day(1));
        assert_eq!(
            due,
            vec![
                SchedulingEvent::ShiftReminder {
                    assignment: loose.id.clone(),
                    lead_days: 1,
                },
                SchedulingEvent::ShiftReminder {
                    assignment: in_roster.id.clone(),
                    lead_days: 3,
                },
            ]
        );
        assert_eq!(f.events.take(), due);
    }
}
