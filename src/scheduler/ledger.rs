use super::util::SlotKey;
use super::{SchedError, Scheduler};
use crate::auth::{Caller, Capability};
use crate::model::{
    AssignmentId, AssignmentStatus, EmployeeId, LocationSnapshot, Registry, RosterId,
    RosterStatus, ShiftAssignment, ShiftId,
};
use crate::notification::{ChangeKind, SchedulingEvent};
use chrono::{DateTime, NaiveDate, Utc};

impl Scheduler {
    /// Affecte un salarié à un poste pour une date. Échoue en `Conflict` si
    /// le salarié tient déjà une affectation vivante ce jour-là.
    pub fn create_assignment(
        &self,
        caller: &Caller,
        employee: &EmployeeId,
        shift: &ShiftId,
        date: NaiveDate,
        roster: Option<&RosterId>,
    ) -> Result<ShiftAssignment, SchedError> {
        self.authorizer.authorize(caller, Capability::Scheduler)?;
        let _scope = self.locks.acquire([(employee.clone(), date)]);
        let now = self.clock.now();

        let (created, event) = self.store.transaction(|reg| {
            let created = insert_assignment(reg, employee, shift, date, roster, now)?;
            let event = change_event(reg, &created, ChangeKind::Created);
            Ok((created, event))
        })?;

        tracing::debug!(assignment = %created.id, %employee, %date, "assignment created");
        self.emit_all(event);
        Ok(created)
    }

    /// assigned -> confirmed, par le salarié lui-même. Sans effet si déjà confirmé.
    pub fn confirm(&self, caller: &Caller, id: &AssignmentId) -> Result<ShiftAssignment, SchedError> {
        let _scope = self.lock_assignment(id)?;
        let now = self.clock.now();

        let (assignment, event) = self.store.transaction(|reg| {
            let updated = {
                let a = find_assignment_mut(reg, id)?;
                ensure_owner(caller, a)?;
                match a.status {
                    AssignmentStatus::Confirmed => return Ok((a.clone(), None)),
                    // un échange en cours se tranche par resolve_swap
                    AssignmentStatus::Assigned => {}
                    other => return Err(SchedError::invalid_state(other, "confirm")),
                }
                transition(a, AssignmentStatus::Confirmed, "confirm", now)?;
                a.clone()
            };
            let event = change_event(reg, &updated, ChangeKind::Confirmed);
            Ok((updated, event))
        })?;

        self.emit_all(event);
        Ok(assignment)
    }

    /// assigned/confirmed -> declined ; libère la journée du salarié.
    pub fn decline(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        reason: Option<&str>,
    ) -> Result<ShiftAssignment, SchedError> {
        let _scope = self.lock_assignment(id)?;
        let now = self.clock.now();

        let (assignment, event) = self.store.transaction(|reg| {
            let updated = {
                let a = find_assignment_mut(reg, id)?;
                ensure_owner(caller, a)?;
                if a.status == AssignmentStatus::Declined {
                    return Ok((a.clone(), None));
                }
                transition(a, AssignmentStatus::Declined, "decline", now)?;
                a.decline_reason = reason.map(str::to_owned);
                a.clone()
            };
            let event = change_event(reg, &updated, ChangeKind::Declined);
            Ok((updated, event))
        })?;

        tracing::debug!(assignment = %id, "assignment declined");
        self.emit_all(event);
        Ok(assignment)
    }

    /// Annulation administrative depuis tout statut non terminal.
    pub fn cancel(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        reason: Option<&str>,
    ) -> Result<ShiftAssignment, SchedError> {
        self.authorizer.authorize(caller, Capability::Approver)?;
        let _scope = self.lock_assignment(id)?;
        let now = self.clock.now();

        let (assignment, event) = self.store.transaction(|reg| {
            let updated = {
                let a = find_assignment_mut(reg, id)?;
                transition(a, AssignmentStatus::Cancelled, "cancel", now)?;
                a.clear_swap();
                a.cancel_reason = reason.map(str::to_owned);
                a.clone()
            };
            let event = change_event(reg, &updated, ChangeKind::Cancelled);
            Ok((updated, event))
        })?;

        tracing::debug!(assignment = %id, "assignment cancelled");
        self.emit_all(event);
        Ok(assignment)
    }

    /// Saisie des heures réelles, une fois l'heure de début prévue passée.
    /// Les heures supplémentaires restent à 0 si le poste ne les autorise pas.
    pub fn record_actual_time(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        break_minutes: u32,
    ) -> Result<ShiftAssignment, SchedError> {
        if end <= start {
            return Err(SchedError::Validation(
                "actual end must be after actual start".into(),
            ));
        }
        let worked = (end - start).num_minutes();
        if i64::from(break_minutes) > worked {
            return Err(SchedError::Validation(
                "actual break exceeds time worked".into(),
            ));
        }

        let _scope = self.lock_assignment(id)?;
        let now = self.clock.now();

        let (assignment, event) = self.store.transaction(|reg| {
            let (shift_id, employee, date) = {
                let a = find_assignment(reg, id)?;
                (a.shift.clone(), a.employee.clone(), a.date)
            };
            if !caller.is_employee(&employee) {
                self.authorizer.authorize(caller, Capability::Scheduler)?;
            }
            let shift = reg
                .find_shift(&shift_id)
                .ok_or_else(|| SchedError::not_found("shift", &shift_id))?;
            if now < shift.starts_at(date) {
                return Err(SchedError::invalid_state("not started", "record actual time"));
            }
            let scheduled = i64::from(shift.scheduled_work_minutes());
            let actual = worked - i64::from(break_minutes);
            let overtime = if shift.overtime_allowed {
                (actual - scheduled).max(0) as u32
            } else {
                0
            };

            let updated = {
                let a = find_assignment_mut(reg, id)?;
                if !matches!(
                    a.status,
                    AssignmentStatus::Assigned | AssignmentStatus::Confirmed
                ) {
                    return Err(SchedError::invalid_state(a.status, "record actual time"));
                }
                a.actual_start = Some(start);
                a.actual_end = Some(end);
                a.actual_break_minutes = Some(break_minutes);
                a.overtime_minutes = overtime;
                a.updated_at = now;
                a.clone()
            };
            let event = change_event(reg, &updated, ChangeKind::TimeRecorded);
            Ok((updated, event))
        })?;

        self.emit_all(event);
        Ok(assignment)
    }

    pub fn record_check_in(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        location: LocationSnapshot,
    ) -> Result<ShiftAssignment, SchedError> {
        self.record_location(caller, id, |a| a.check_in = Some(location))
    }

    pub fn record_check_out(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        location: LocationSnapshot,
    ) -> Result<ShiftAssignment, SchedError> {
        self.record_location(caller, id, |a| a.check_out = Some(location))
    }

    fn record_location<F>(&self, caller: &Caller, id: &AssignmentId, set: F) -> Result<ShiftAssignment, SchedError>
    where
        F: FnOnce(&mut ShiftAssignment),
    {
        let _scope = self.lock_assignment(id)?;
        let now = self.clock.now();
        self.store.transaction(|reg| {
            let a = find_assignment_mut(reg, id)?;
            ensure_owner(caller, a)?;
            if a.status.is_terminal() {
                return Err(SchedError::invalid_state(a.status, "record location"));
            }
            set(a);
            a.updated_at = now;
            Ok(a.clone())
        })
    }

    /// Évaluation de 1 à 5 par un planificateur.
    pub fn rate_performance(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        rating: u8,
        notes: Option<&str>,
    ) -> Result<ShiftAssignment, SchedError> {
        self.authorizer.authorize(caller, Capability::Scheduler)?;
        if !(1..=5).contains(&rating) {
            return Err(SchedError::Validation(format!(
                "rating {rating} outside 1-5"
            )));
        }
        let _scope = self.lock_assignment(id)?;
        let now = self.clock.now();
        self.store.transaction(|reg| {
            let a = find_assignment_mut(reg, id)?;
            a.performance_rating = Some(rating);
            if let Some(notes) = notes {
                a.notes = Some(notes.to_owned());
            }
            a.updated_at = now;
            Ok(a.clone())
        })
    }

    pub fn get_assignment(&self, id: &AssignmentId) -> Result<ShiftAssignment, SchedError> {
        self.store.read(|reg| find_assignment(reg, id).cloned())
    }

    /// Affectations d'un salarié, triées par date.
    pub fn assignments_for(&self, employee: &EmployeeId) -> Vec<ShiftAssignment> {
        let mut out: Vec<ShiftAssignment> = self.store.read(|reg| {
            reg.assignments
                .iter()
                .filter(|a| &a.employee == employee)
                .cloned()
                .collect()
        });
        out.sort_by_key(|a| a.date);
        out
    }

    pub fn assignments_for_roster(&self, roster: &RosterId) -> Vec<ShiftAssignment> {
        let mut out: Vec<ShiftAssignment> =
            self.store.read(|reg| reg.assignments_for_roster(roster).cloned().collect());
        out.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.employee.cmp(&b.employee)));
        out
    }

    pub(super) fn lock_assignment(&self, id: &AssignmentId) -> Result<super::KeyScope<'_>, SchedError> {
        self.lock_slots(|reg| {
            let a = find_assignment(reg, id)?;
            Ok(vec![(a.employee.clone(), a.date)] as Vec<SlotKey>)
        })
    }
}

/// Point d'écriture unique des nouvelles affectations : tout créateur
/// (saisie manuelle, rotation, échange) passe par ici.
pub(super) fn insert_assignment(
    reg: &mut Registry,
    employee: &EmployeeId,
    shift_id: &ShiftId,
    date: NaiveDate,
    roster: Option<&RosterId>,
    now: DateTime<Utc>,
) -> Result<ShiftAssignment, SchedError> {
    let shift = reg
        .find_shift(shift_id)
        .ok_or_else(|| SchedError::not_found("shift", shift_id))?;
    if !shift.active {
        return Err(SchedError::invalid_state("inactive", "assign to shift"));
    }
    if !shift.applies_on(date) {
        return Err(SchedError::Validation(format!(
            "shift {} does not run on {}",
            shift.name,
            date.format("%A %Y-%m-%d")
        )));
    }
    let organization = shift.organization.clone();

    if let Some(roster_id) = roster {
        let r = reg
            .find_roster(roster_id)
            .ok_or_else(|| SchedError::not_found("roster", roster_id))?;
        if r.status == RosterStatus::Archived {
            return Err(SchedError::invalid_state(r.status, "assign into roster"));
        }
        if r.organization != organization {
            return Err(SchedError::Validation(format!(
                "roster {roster_id} belongs to another organization"
            )));
        }
        if !r.contains(date) {
            return Err(SchedError::Validation(format!(
                "{date} is outside roster {} ({}..{})",
                r.name, r.start_date, r.end_date
            )));
        }
    }

    ensure_free(reg, employee, date, &[])?;

    let assignment = ShiftAssignment::new(
        organization,
        roster.cloned(),
        shift_id.clone(),
        employee.clone(),
        date,
        now,
    );
    reg.assignments.push(assignment.clone());
    Ok(assignment)
}

/// Contrôle d'unicité (salarié, date), affectations `exclude` mises à part.
pub(super) fn ensure_free(
    reg: &Registry,
    employee: &EmployeeId,
    date: NaiveDate,
    exclude: &[&AssignmentId],
) -> Result<(), SchedError> {
    match reg.live_assignments_on(employee, date, exclude).next() {
        Some(existing) => Err(SchedError::Conflict(format!(
            "{employee} already holds assignment {} on {date}",
            existing.id
        ))),
        None => Ok(()),
    }
}

pub(super) fn transition(
    a: &mut ShiftAssignment,
    next: AssignmentStatus,
    action: &'static str,
    now: DateTime<Utc>,
) -> Result<(), SchedError> {
    if !a.status.can_transition_to(next) {
        return Err(SchedError::invalid_state(a.status, action));
    }
    a.status = next;
    a.updated_at = now;
    Ok(())
}

/// Événement de modification : affectations hors planning, ou planning
/// publié avec `notify_on_change`. Les brouillons restent silencieux.
pub(super) fn change_event(
    reg: &Registry,
    a: &ShiftAssignment,
    change: ChangeKind,
) -> Option<SchedulingEvent> {
    let notify = match &a.roster {
        None => true,
        Some(roster_id) => reg
            .find_roster(roster_id)
            .map(|r| r.is_published() && r.notification.notify_on_change)
            .unwrap_or(false),
    };
    notify.then(|| SchedulingEvent::AssignmentChanged {
        assignment: a.id.clone(),
        change,
    })
}

pub(super) fn find_assignment<'a>(
    reg: &'a Registry,
    id: &AssignmentId,
) -> Result<&'a ShiftAssignment, SchedError> {
    reg.find_assignment(id)
        .ok_or_else(|| SchedError::not_found("assignment", id))
}

pub(super) fn find_assignment_mut<'a>(
    reg: &'a mut Registry,
    id: &AssignmentId,
) -> Result<&'a mut ShiftAssignment, SchedError> {
    reg.find_assignment_mut(id)
        .ok_or_else(|| SchedError::not_found("assignment", id))
}

fn ensure_owner(caller: &Caller, a: &ShiftAssignment) -> Result<(), SchedError> {
    if caller.is_employee(&a.employee) {
        return Ok(());
    }
    Err(SchedError::Forbidden(format!(
        "{} cannot act on assignment {} held by {}",
        caller.user, a.id, a.employee
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::config::EngineConfig;
    use crate::model::OrganizationId;
    use crate::notification::RecordingNotifier;
    use crate::scheduler::ShiftSpec;
    use chrono::{NaiveTime, TimeZone};
    use std::sync::Arc;

    struct Fixture {
        s: Scheduler,
        clock: Arc<FixedClock>,
        shift: ShiftId,
        notifier: Arc<RecordingNotifier>,
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn planner() -> Caller {
        Caller::new("planner")
            .with_capability(Capability::Scheduler)
            .with_capability(Capability::Approver)
    }

    fn fixture(overtime_allowed: bool) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 5, 20, 9, 0, 0).unwrap(),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let s = Scheduler::new(EngineConfig::default())
            .with_clock(clock.clone())
            .with_notifier(notifier.clone());
        let admin = Caller::new("admin").with_capability(Capability::SchedulerAdmin);
        let mut spec = ShiftSpec::new(
            OrganizationId::new("org"),
            "Morning",
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
        );
        spec.break_minutes = 30;
        spec.overtime_allowed = overtime_allowed;
        let shift = s.create_shift(&admin, spec).unwrap();
        Fixture {
            s,
            clock,
            shift,
            notifier,
        }
    }

    #[test]
    fn confirm_is_owner_only_and_idempotent() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();

        let err = f
            .s
            .confirm(&Caller::employee(&EmployeeId::new("bob")), &a.id)
            .unwrap_err();
        assert!(matches!(err, SchedError::Forbidden(_)));

        let once = f.s.confirm(&Caller::employee(&alice), &a.id).unwrap();
        let twice = f.s.confirm(&Caller::employee(&alice), &a.id).unwrap();
        assert_eq!(once.status, AssignmentStatus::Confirmed);
        assert_eq!(once, twice);
    }

    #[test]
    fn decline_frees_the_date() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();
        let declined = f
            .s
            .decline(&Caller::employee(&alice), &a.id, Some("sick"))
            .unwrap();
        assert_eq!(declined.decline_reason.as_deref(), Some("sick"));
        let again = f.s.decline(&Caller::employee(&alice), &a.id, None).unwrap();
        assert_eq!(again.status, AssignmentStatus::Declined);

        assert!(f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .is_ok());
    }

    #[test]
    fn cannot_confirm_cancelled() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();
        f.s.cancel(&planner(), &a.id, Some("closed")).unwrap();
        let err = f.s.confirm(&Caller::employee(&alice), &a.id).unwrap_err();
        match err {
            SchedError::InvalidState { current, .. } => assert_eq!(current, "cancelled"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(f.s.cancel(&planner(), &a.id, None).is_err());
    }

    #[test]
    fn actual_time_before_start_is_rejected() {
        let f = fixture(true);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 2, 17, 0, 0).unwrap();
        let err = f
            .s
            .record_actual_time(&Caller::employee(&alice), &a.id, start, end, 30)
            .unwrap_err();
        assert!(matches!(err, SchedError::InvalidState { .. }));

        f.clock
            .set(Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap());
        let recorded = f
            .s
            .record_actual_time(&Caller::employee(&alice), &a.id, start, end, 30)
            .unwrap();
        // 9h - 30 min vs 8h - 30 min
        assert_eq!(recorded.overtime_minutes, 60);
    }

    #[test]
    fn overtime_forced_to_zero_when_not_allowed() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();
        f.clock
            .set(Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap());
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 2, 20, 0, 0).unwrap();
        let recorded = f
            .s
            .record_actual_time(&planner(), &a.id, start, end, 0)
            .unwrap();
        assert_eq!(recorded.overtime_minutes, 0);
        assert_eq!(recorded.actual_end, Some(end));
    }

    #[test]
    fn rosterless_changes_are_notified() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();
        assert_eq!(
            f.notifier.take(),
            vec![SchedulingEvent::AssignmentChanged {
                assignment: a.id,
                change: ChangeKind::Created
            }]
        );
    }

    #[test]
    fn rating_must_be_in_range() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();
        assert!(f.s.rate_performance(&planner(), &a.id, 6, None).is_err());
        let rated = f
            .s
            .rate_performance(&planner(), &a.id, 4, Some("solid"))
            .unwrap();
        assert_eq!(rated.performance_rating, Some(4));

        let unknown = AssignmentId::new("missing");
        assert!(matches!(
            f.s.rate_performance(&planner(), &unknown, 3, None),
            Err(SchedError::NotFound { .. })
        ));
    }

    #[test]
    fn rating_waits_for_the_slot_lock() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();

        let scope = f.s.lock_assignment(&a.id).unwrap();
        std::thread::scope(|t| {
            let rater = t.spawn(|| f.s.rate_performance(&planner(), &a.id, 5, None));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(f.s.get_assignment(&a.id).unwrap().performance_rating, None);
            drop(scope);
            let rated = rater.join().unwrap().unwrap();
            assert_eq!(rated.performance_rating, Some(5));
        });
    }

    #[test]
    fn check_in_is_stored_for_the_owner_only() {
        let f = fixture(false);
        let alice = EmployeeId::new("alice");
        let a = f
            .s
            .create_assignment(&planner(), &alice, &f.shift, day(2), None)
            .unwrap();
        let here = LocationSnapshot {
            latitude: 48.85,
            longitude: 2.35,
            accuracy_meters: Some(12.0),
            recorded_at: f.clock.now(),
        };
        assert!(matches!(
            f.s.record_check_in(&Caller::employee(&EmployeeId::new("bob")), &a.id, here.clone()),
            Err(SchedError::Forbidden(_))
        ));
        let checked = f
            .s
            .record_check_in(&Caller::employee(&alice), &a.id, here.clone())
            .unwrap();
        assert_eq!(checked.check_in, Some(here));
        assert_eq!(checked.check_out, None);
    }
}
