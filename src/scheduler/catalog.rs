use super::{SchedError, Scheduler, ShiftSpec, ShiftUpdate};
use crate::auth::{Caller, Capability};
use crate::model::{OrganizationId, Registry, Shift, ShiftId, MINUTES_PER_DAY};

impl Scheduler {
    /// Crée un modèle de poste après validation des bornes.
    pub fn create_shift(&self, caller: &Caller, spec: ShiftSpec) -> Result<ShiftId, SchedError> {
        self.authorizer.authorize(caller, Capability::SchedulerAdmin)?;
        let shift = Shift {
            id: ShiftId::random(),
            organization: spec.organization,
            name: spec.name,
            description: spec.description,
            color: spec.color,
            start_time: spec.start_time,
            end_time: spec.end_time,
            break_minutes: spec.break_minutes,
            applicable_days: spec.applicable_days,
            overtime_allowed: spec.overtime_allowed,
            overtime_multiplier: spec.overtime_multiplier,
            grace_period_minutes: spec.grace_period_minutes,
            minimum_staff: spec.minimum_staff,
            maximum_staff: spec.maximum_staff,
            active: true,
            created_at: self.clock.now(),
        };
        validate_template(&shift)?;

        let id = shift.id.clone();
        self.store.transaction(|reg| {
            reg.shifts.push(shift);
            Ok(())
        })?;
        tracing::debug!(shift = %id, "shift template created");
        Ok(id)
    }

    /// Les champs horaires et d'effectif sont figés dès qu'une affectation
    /// référence le poste ; nom, description et couleur restent libres.
    pub fn update_shift(
        &self,
        caller: &Caller,
        id: &ShiftId,
        update: ShiftUpdate,
    ) -> Result<Shift, SchedError> {
        self.authorizer.authorize(caller, Capability::SchedulerAdmin)?;
        self.store.transaction(|reg| {
            let in_use = reg.assignments.iter().any(|a| &a.shift == id);
            if in_use && update.touches_schedule() {
                return Err(SchedError::Conflict(format!(
                    "shift {id} is referenced by assignments; only name, description and color may change"
                )));
            }
            let shift = find_shift_mut(reg, id)?;
            apply_update(shift, update);
            validate_template(shift)?;
            Ok(shift.clone())
        })
    }

    /// Retrait logique. Refusé tant qu'une affectation vivante, datée
    /// d'aujourd'hui ou plus tard, référence le poste.
    pub fn deactivate_shift(&self, caller: &Caller, id: &ShiftId) -> Result<(), SchedError> {
        self.authorizer.authorize(caller, Capability::SchedulerAdmin)?;
        let today = self.clock.today();
        self.store.transaction(|reg| {
            let pending = reg
                .assignments
                .iter()
                .filter(|a| &a.shift == id && a.is_live() && a.date >= today)
                .count();
            if pending > 0 {
                return Err(SchedError::Conflict(format!(
                    "shift {id} still has {pending} upcoming assignment(s)"
                )));
            }
            find_shift_mut(reg, id)?.active = false;
            Ok(())
        })?;
        tracing::debug!(shift = %id, "shift template deactivated");
        Ok(())
    }

    pub fn reactivate_shift(&self, caller: &Caller, id: &ShiftId) -> Result<(), SchedError> {
        self.authorizer.authorize(caller, Capability::SchedulerAdmin)?;
        self.store.transaction(|reg| {
            find_shift_mut(reg, id)?.active = true;
            Ok(())
        })
    }

    pub fn get_shift(&self, id: &ShiftId) -> Result<Shift, SchedError> {
        self.store.read(|reg| {
            reg.find_shift(id)
                .cloned()
                .ok_or_else(|| SchedError::not_found("shift", id))
        })
    }

    /// Modèles d'une organisation, dans l'ordre de création.
    pub fn list_shifts(&self, organization: &OrganizationId, include_inactive: bool) -> Vec<Shift> {
        self.store.read(|reg| {
            reg.shifts
                .iter()
                .filter(|s| &s.organization == organization && (include_inactive || s.active))
                .cloned()
                .collect()
        })
    }
}

fn find_shift_mut<'a>(reg: &'a mut Registry, id: &ShiftId) -> Result<&'a mut Shift, SchedError> {
    reg.find_shift_mut(id)
        .ok_or_else(|| SchedError::not_found("shift", id))
}

fn apply_update(shift: &mut Shift, update: ShiftUpdate) {
    if let Some(name) = update.name {
        shift.name = name;
    }
    if let Some(description) = update.description {
        shift.description = Some(description);
    }
    if let Some(color) = update.color {
        shift.color = Some(color);
    }
    if let Some(start) = update.start_time {
        shift.start_time = start;
    }
    if let Some(end) = update.end_time {
        shift.end_time = end;
    }
    if let Some(minutes) = update.break_minutes {
        shift.break_minutes = minutes;
    }
    if let Some(days) = update.applicable_days {
        shift.applicable_days = days;
    }
    if let Some(allowed) = update.overtime_allowed {
        shift.overtime_allowed = allowed;
    }
    if let Some(multiplier) = update.overtime_multiplier {
        shift.overtime_multiplier = multiplier;
    }
    if let Some(grace) = update.grace_period_minutes {
        shift.grace_period_minutes = grace;
    }
    if let Some(min) = update.minimum_staff {
        shift.minimum_staff = min;
    }
    if let Some(max) = update.maximum_staff {
        shift.maximum_staff = max;
    }
}

fn validate_template(shift: &Shift) -> Result<(), SchedError> {
    let invalid = |msg: String| Err(SchedError::Validation(msg));

    if shift.name.trim().is_empty() {
        return invalid("shift name cannot be empty".into());
    }
    // début == fin : poste de 24h
    let span = shift.duration_minutes().checked_add(shift.break_minutes);
    if span.map_or(true, |m| m > MINUTES_PER_DAY) {
        return invalid(format!(
            "duration ({} min) plus break ({} min) exceeds 24h",
            shift.duration_minutes(),
            shift.break_minutes
        ));
    }
    if shift.applicable_days.is_empty() {
        return invalid("shift must apply to at least one weekday".into());
    }
    if let Some(day) = shift.applicable_days.iter().find(|d| **d > 6) {
        return invalid(format!("weekday {day} out of range 0-6"));
    }
    if shift.minimum_staff < 1 {
        return invalid("minimum_staff must be >= 1".into());
    }
    if let Some(max) = shift.maximum_staff {
        if max < shift.minimum_staff {
            return invalid(format!(
                "maximum_staff ({max}) below minimum_staff ({})",
                shift.minimum_staff
            ));
        }
    }
    if !(1.0..=3.0).contains(&shift.overtime_multiplier) {
        return invalid(format!(
            "overtime multiplier {} outside 1.0-3.0",
            shift.overtime_multiplier
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::model::{AssignmentId, EmployeeId};
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use std::sync::Arc;

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn admin() -> Caller {
        Caller::new("admin").with_capability(Capability::SchedulerAdmin)
    }

    fn spec(start: u32, end: u32) -> ShiftSpec {
        ShiftSpec::new(OrganizationId::new("org"), "Morning", t(start), t(end))
    }

    #[test]
    fn night_shift_is_derived() {
        let s = Scheduler::new(EngineConfig::default());
        let id = s.create_shift(&admin(), spec(22, 6)).unwrap();
        let shift = s.get_shift(&id).unwrap();
        assert!(shift.is_night_shift());
        assert_eq!(shift.duration_minutes(), 480);
    }

    #[test]
    fn rejects_inconsistent_templates() {
        let s = Scheduler::new(EngineConfig::default());

        let mut too_long = spec(8, 7);
        too_long.break_minutes = 120;
        assert!(matches!(
            s.create_shift(&admin(), too_long),
            Err(SchedError::Validation(_))
        ));

        let mut staffing = spec(8, 16);
        staffing.minimum_staff = 3;
        staffing.maximum_staff = Some(2);
        assert!(matches!(
            s.create_shift(&admin(), staffing),
            Err(SchedError::Validation(_))
        ));

        let mut zero = spec(8, 16);
        zero.minimum_staff = 0;
        assert!(matches!(
            s.create_shift(&admin(), zero),
            Err(SchedError::Validation(_))
        ));

        let mut multiplier = spec(8, 16);
        multiplier.overtime_multiplier = 3.5;
        assert!(matches!(
            s.create_shift(&admin(), multiplier),
            Err(SchedError::Validation(_))
        ));

        let mut huge_break = spec(8, 16);
        huge_break.break_minutes = u32::MAX - 100;
        assert!(matches!(
            s.create_shift(&admin(), huge_break),
            Err(SchedError::Validation(_))
        ));

        let mut full_day_with_break = spec(8, 8);
        full_day_with_break.break_minutes = 1;
        assert!(matches!(
            s.create_shift(&admin(), full_day_with_break),
            Err(SchedError::Validation(_))
        ));
    }

    #[test]
    fn equal_bounds_make_a_full_day_shift() {
        let s = Scheduler::new(EngineConfig::default());
        let id = s.create_shift(&admin(), spec(8, 8)).unwrap();
        let shift = s.get_shift(&id).unwrap();
        assert_eq!(shift.duration_minutes(), MINUTES_PER_DAY);
        assert!(!shift.is_night_shift());
    }

    fn guarded_fixture() -> (Scheduler, ShiftId, Vec<AssignmentId>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap(),
        ));
        let s = Scheduler::new(EngineConfig::default()).with_clock(clock);
        let id = s.create_shift(&admin(), spec(8, 16)).unwrap();
        let planner = Caller::new("planner").with_capability(Capability::Scheduler);
        let alice = EmployeeId::new("alice");
        let past = s
            .create_assignment(&planner, &alice, &id, date(3), None)
            .unwrap();
        let upcoming = s
            .create_assignment(&planner, &alice, &id, date(17), None)
            .unwrap();
        (s, id, vec![past.id, upcoming.id])
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    #[test]
    fn deactivation_waits_for_upcoming_assignments() {
        let (s, id, assignments) = guarded_fixture();
        assert!(matches!(
            s.deactivate_shift(&admin(), &id),
            Err(SchedError::Conflict(_))
        ));
        assert!(s.get_shift(&id).unwrap().active);

        let approver = Caller::new("approver").with_capability(Capability::Approver);
        s.cancel(&approver, &assignments[1], Some("closed")).unwrap();

        // il ne reste qu'une affectation passée
        s.deactivate_shift(&admin(), &id).unwrap();
        assert!(!s.get_shift(&id).unwrap().active);
        assert!(s.list_shifts(&OrganizationId::new("org"), false).is_empty());
        assert_eq!(s.list_shifts(&OrganizationId::new("org"), true).len(), 1);
    }

    #[test]
    fn shift_in_use_keeps_its_schedule() {
        let (s, id, _) = guarded_fixture();

        let retime = ShiftUpdate {
            end_time: Some(t(17)),
            ..ShiftUpdate::default()
        };
        assert!(matches!(
            s.update_shift(&admin(), &id, retime),
            Err(SchedError::Conflict(_))
        ));
        let restaff = ShiftUpdate {
            minimum_staff: Some(2),
            ..ShiftUpdate::default()
        };
        assert!(matches!(
            s.update_shift(&admin(), &id, restaff),
            Err(SchedError::Conflict(_))
        ));

        let renamed = s
            .update_shift(
                &admin(),
                &id,
                ShiftUpdate {
                    name: Some("Early".into()),
                    description: Some("opening team".into()),
                    color: Some("#ffaa00".into()),
                    ..ShiftUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.name, "Early");
        assert_eq!(renamed.color.as_deref(), Some("#ffaa00"));
        assert_eq!(renamed.duration_minutes(), 480);
    }

    #[test]
    fn create_requires_admin() {
        let s = Scheduler::new(EngineConfig::default());
        let err = s
            .create_shift(&Caller::new("someone"), spec(8, 16))
            .unwrap_err();
        assert!(matches!(err, SchedError::Forbidden(_)));
    }

    #[test]
    fn unused_template_can_be_retimed() {
        let s = Scheduler::new(EngineConfig::default());
        let id = s.create_shift(&admin(), spec(8, 16)).unwrap();
        let updated = s
            .update_shift(
                &admin(),
                &id,
                ShiftUpdate {
                    end_time: Some(t(17)),
                    ..ShiftUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.duration_minutes(), 540);
    }
}
