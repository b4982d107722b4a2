use super::ledger::{
    change_event, ensure_free, find_assignment, find_assignment_mut, transition,
};
use super::util::SlotKey;
use super::{SchedError, Scheduler};
use crate::auth::{Caller, Capability};
use crate::config::SwapDatePolicy;
use crate::model::{
    AssignmentId, AssignmentStatus, EmployeeId, Registry, ShiftAssignment, UserId,
};
use crate::notification::{ChangeKind, SchedulingEvent};
use chrono::{DateTime, Utc};

impl Scheduler {
    /// Première phase : l'initiateur propose son affectation `id` au
    /// salarié `target`, qui doit tenir une affectation compatible.
    pub fn request_swap(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        target: &EmployeeId,
        target_assignment: Option<&AssignmentId>,
    ) -> Result<ShiftAssignment, SchedError> {
        let policy = self.config.swap_policy;
        let _scope = self.lock_slots(|reg| {
            let a = find_assignment(reg, id)?;
            let b = counterpart_for(reg, a, target, target_assignment, policy)?;
            Ok(vec![(a.employee.clone(), a.date), (target.clone(), b.date)])
        })?;
        let now = self.clock.now();

        let requested = self.store.transaction(|reg| {
            let a = find_assignment(reg, id)?;
            if !caller.is_employee(&a.employee) {
                return Err(SchedError::Forbidden(format!(
                    "only {} may offer assignment {id}",
                    a.employee
                )));
            }
            if &a.employee == target {
                return Err(SchedError::Validation("cannot swap with oneself".into()));
            }
            if !matches!(
                a.status,
                AssignmentStatus::Assigned | AssignmentStatus::Confirmed
            ) {
                return Err(SchedError::invalid_state(a.status, "request swap"));
            }

            let b = counterpart_for(reg, a, target, target_assignment, policy)?;
            if !matches!(
                b.status,
                AssignmentStatus::Assigned | AssignmentStatus::Confirmed
            ) {
                return Err(SchedError::invalid_state(b.status, "be offered a swap"));
            }
            if a.shift == b.shift && a.date == b.date {
                return Err(SchedError::Validation(
                    "both assignments cover the same shift and date".into(),
                ));
            }
            for side in [&a.id, &b.id] {
                if let Some(pending) = pending_swap_on(reg, side) {
                    return Err(SchedError::Conflict(format!(
                        "assignment {side} is already part of pending swap {pending}"
                    )));
                }
            }
            let counterpart = b.id.clone();

            let a = find_assignment_mut(reg, id)?;
            let previous = a.status;
            transition(a, AssignmentStatus::SwapRequested, "request swap", now)?;
            a.previous_status = Some(previous);
            a.swap_requested_with = Some(target.clone());
            a.swap_counterpart = Some(counterpart);
            a.swap_requested_at = Some(now);
            a.decline_reason = None;
            Ok(a.clone())
        })?;

        tracing::debug!(assignment = %id, from = %requested.employee, to = %target, "swap requested");
        self.emit(SchedulingEvent::SwapRequested {
            assignment: requested.id.clone(),
            from: requested.employee.clone(),
            to: target.clone(),
        });
        Ok(requested)
    }

    /// Seconde phase, par un valideur. Une approbation échange les deux
    /// salariés d'un seul tenant, ou ne change rien.
    pub fn resolve_swap(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        approve: bool,
        reason: Option<&str>,
    ) -> Result<ShiftAssignment, SchedError> {
        self.authorizer.authorize(caller, Capability::Approver)?;
        if !approve {
            return self.reject_swap(id, reason, |_| Ok(()));
        }

        let _scope = self.lock_slots(|reg| swap_keys(reg, id))?;
        let now = self.clock.now();

        let (resolved, events) = self.store.transaction(|reg| {
            let (a, b) = exchange(reg, id, &caller.user, now)?;
            let mut events: Vec<SchedulingEvent> =
                change_event(reg, &a, ChangeKind::Reassigned).into_iter().collect();
            if let Some(b) = &b {
                events.extend(change_event(reg, b, ChangeKind::Reassigned));
            }
            Ok((a, events))
        })?;

        tracing::info!(assignment = %id, approver = %caller.user, "swap approved");
        self.emit(SchedulingEvent::SwapResolved {
            assignment: resolved.id.clone(),
            approved: true,
        });
        self.emit_all(events);
        Ok(resolved)
    }

    /// Refus par le salarié sollicité.
    pub fn decline_swap(
        &self,
        caller: &Caller,
        id: &AssignmentId,
        reason: Option<&str>,
    ) -> Result<ShiftAssignment, SchedError> {
        self.reject_swap(id, reason, |a| {
            match &a.swap_requested_with {
                Some(target) if caller.is_employee(target) => Ok(()),
                _ => Err(SchedError::Forbidden(format!(
                    "{} is not the target of swap {}",
                    caller.user, a.id
                ))),
            }
        })
    }

    /// Retrait de la demande par son initiateur.
    pub fn withdraw_swap(&self, caller: &Caller, id: &AssignmentId) -> Result<ShiftAssignment, SchedError> {
        self.reject_swap(id, None, |a| {
            if caller.is_employee(&a.employee) {
                Ok(())
            } else {
                Err(SchedError::Forbidden(format!(
                    "{} did not request swap {}",
                    caller.user, a.id
                )))
            }
        })
    }

    fn reject_swap<F>(
        &self,
        id: &AssignmentId,
        reason: Option<&str>,
        allowed: F,
    ) -> Result<ShiftAssignment, SchedError>
    where
        F: FnOnce(&ShiftAssignment) -> Result<(), SchedError>,
    {
        let _scope = self.lock_assignment(id)?;
        let now = self.clock.now();

        let reverted = self.store.transaction(|reg| {
            let a = find_assignment_mut(reg, id)?;
            if a.status != AssignmentStatus::SwapRequested {
                return Err(SchedError::invalid_state(a.status, "resolve swap"));
            }
            allowed(a)?;
            let previous = a.previous_status.unwrap_or(AssignmentStatus::Assigned);
            transition(a, previous, "revert swap", now)?;
            a.clear_swap();
            a.decline_reason = reason.map(str::to_owned);
            Ok(a.clone())
        })?;

        tracing::warn!(assignment = %id, reason = reason.unwrap_or("-"), "swap rejected");
        self.emit(SchedulingEvent::SwapResolved {
            assignment: reverted.id.clone(),
            approved: false,
        });
        Ok(reverted)
    }
}

/// Affectation B visée : désignée explicitement, sinon celle du salarié
/// cible le même jour que A.
fn counterpart_for<'a>(
    reg: &'a Registry,
    a: &ShiftAssignment,
    target: &EmployeeId,
    explicit: Option<&AssignmentId>,
    policy: SwapDatePolicy,
) -> Result<&'a ShiftAssignment, SchedError> {
    let b = match explicit {
        Some(b_id) => {
            let b = find_assignment(reg, b_id)?;
            if &b.employee != target {
                return Err(SchedError::Validation(format!(
                    "assignment {b_id} is not held by {target}"
                )));
            }
            b
        }
        None => reg
            .assignments
            .iter()
            .find(|x| x.is_live() && &x.employee == target && x.date == a.date)
            .ok_or_else(|| {
                SchedError::Validation(format!("{target} has no assignment on {}", a.date))
            })?,
    };
    if policy == SwapDatePolicy::SameDateOnly && b.date != a.date {
        return Err(SchedError::Validation(format!(
            "cross-date swaps are disabled ({} vs {})",
            a.date, b.date
        )));
    }
    Ok(b)
}

fn pending_swap_on<'a>(reg: &'a Registry, id: &AssignmentId) -> Option<&'a AssignmentId> {
    reg.assignments
        .iter()
        .find(|x| {
            x.status == AssignmentStatus::SwapRequested
                && (&x.id == id || x.swap_counterpart.as_ref() == Some(id))
        })
        .map(|x| &x.id)
}

/// Clés touchées par l'échange : les deux salariés, sur les deux dates.
fn swap_keys(reg: &Registry, id: &AssignmentId) -> Result<Vec<SlotKey>, SchedError> {
    let a = find_assignment(reg, id)?;
    if a.status != AssignmentStatus::SwapRequested {
        return Err(SchedError::invalid_state(a.status, "resolve swap"));
    }
    let target = a
        .swap_requested_with
        .clone()
        .ok_or_else(|| SchedError::invalid_state("missing swap target", "resolve swap"))?;
    let mut keys = vec![(a.employee.clone(), a.date), (target.clone(), a.date)];
    if let Some(b) = a.swap_counterpart.as_ref().and_then(|b| reg.find_assignment(b)) {
        keys.push((b.employee.clone(), b.date));
        keys.push((target, b.date));
        keys.push((a.employee.clone(), b.date));
    }
    Ok(keys)
}

/// Échange A <-> B sur le brouillon de transaction. Si B n'est plus vivante,
/// A passe à la cible et l'initiateur reçoit une copie de B.
fn exchange(
    reg: &mut Registry,
    id: &AssignmentId,
    approver: &UserId,
    now: DateTime<Utc>,
) -> Result<(ShiftAssignment, Option<ShiftAssignment>), SchedError> {
    let a = find_assignment(reg, id)?.clone();
    if a.status != AssignmentStatus::SwapRequested {
        return Err(SchedError::invalid_state(a.status, "resolve swap"));
    }
    let target = a
        .swap_requested_with
        .clone()
        .ok_or_else(|| SchedError::invalid_state("missing swap target", "resolve swap"))?;
    let initiator = a.employee.clone();
    let b = a
        .swap_counterpart
        .as_ref()
        .and_then(|b| reg.find_assignment(b))
        .cloned();

    let stamp = |x: &mut ShiftAssignment| {
        x.swap_approved_by = Some(approver.clone());
        x.swap_approved_at = Some(now);
    };

    match b {
        Some(b) if b.is_live() => {
            if b.employee != target {
                return Err(SchedError::Conflict(format!(
                    "assignment {} no longer belongs to {target}",
                    b.id
                )));
            }
            if let Some(pending) = pending_swap_on(reg, &b.id).filter(|p| *p != &a.id) {
                return Err(SchedError::Conflict(format!(
                    "assignment {} is part of pending swap {pending}",
                    b.id
                )));
            }
            ensure_free(reg, &target, a.date, &[&a.id, &b.id])?;
            ensure_free(reg, &initiator, b.date, &[&a.id, &b.id])?;

            let new_a = {
                let x = find_assignment_mut(reg, &a.id)?;
                transition(x, AssignmentStatus::Confirmed, "approve swap", now)?;
                x.employee = target.clone();
                x.clear_swap();
                stamp(x);
                x.clone()
            };
            let new_b = {
                let x = find_assignment_mut(reg, &b.id)?;
                if x.status != AssignmentStatus::Confirmed {
                    transition(x, AssignmentStatus::Confirmed, "approve swap", now)?;
                }
                x.employee = initiator;
                x.updated_at = now;
                stamp(x);
                x.clone()
            };
            Ok((new_a, Some(new_b)))
        }
        prior => {
            ensure_free(reg, &target, a.date, &[&a.id])?;
            if let Some(prior) = &prior {
                ensure_free(reg, &initiator, prior.date, &[&a.id])?;
            }

            let new_a = {
                let x = find_assignment_mut(reg, &a.id)?;
                transition(x, AssignmentStatus::Confirmed, "approve swap", now)?;
                x.employee = target;
                x.clear_swap();
                stamp(x);
                x.clone()
            };
            let mirror = match prior {
                Some(prior) => {
                    let mut m = ShiftAssignment::new(
                        prior.organization,
                        prior.roster,
                        prior.shift,
                        initiator,
                        prior.date,
                        now,
                    );
                    m.status = AssignmentStatus::Confirmed;
                    stamp(&mut m);
                    reg.assignments.push(m.clone());
                    Some(m)
                }
                None => None,
            };
            Ok((new_a, mirror))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{OrganizationId, ShiftId};
    use crate::scheduler::ShiftSpec;
    use chrono::{NaiveDate, NaiveTime};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn planner() -> Caller {
        Caller::new("planner")
            .with_capability(Capability::Scheduler)
            .with_capability(Capability::Approver)
    }

    fn setup(config: EngineConfig) -> (Scheduler, ShiftId, ShiftId) {
        let s = Scheduler::new(config);
        let admin = Caller::new("admin").with_capability(Capability::SchedulerAdmin);
        let org = OrganizationId::new("org");
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        let morning = s
            .create_shift(&admin, ShiftSpec::new(org.clone(), "Morning", t(8), t(16)))
            .unwrap();
        let evening = s
            .create_shift(&admin, ShiftSpec::new(org, "Evening", t(16), t(23)))
            .unwrap();
        (s, morning, evening)
    }

    #[test]
    fn reject_restores_previous_status() {
        let (s, morning, evening) = setup(EngineConfig::default());
        let alice = EmployeeId::new("alice");
        let bob = EmployeeId::new("bob");
        let a = s
            .create_assignment(&planner(), &alice, &morning, day(2), None)
            .unwrap();
        s.create_assignment(&planner(), &bob, &evening, day(2), None)
            .unwrap();
        s.confirm(&Caller::employee(&alice), &a.id).unwrap();

        let requested = s
            .request_swap(&Caller::employee(&alice), &a.id, &bob, None)
            .unwrap();
        assert_eq!(requested.status, AssignmentStatus::SwapRequested);
        assert_eq!(requested.previous_status, Some(AssignmentStatus::Confirmed));

        let err = s
            .request_swap(&Caller::employee(&alice), &a.id, &bob, None)
            .unwrap_err();
        assert!(matches!(err, SchedError::InvalidState { .. }));

        let reverted = s
            .resolve_swap(&planner(), &a.id, false, Some("coverage"))
            .unwrap();
        assert_eq!(reverted.status, AssignmentStatus::Confirmed);
        assert_eq!(reverted.swap_requested_with, None);
        assert_eq!(reverted.decline_reason.as_deref(), Some("coverage"));
    }

    #[test]
    fn pending_swap_cannot_be_confirmed_around_the_approver() {
        let (s, morning, evening) = setup(EngineConfig::default());
        let alice = EmployeeId::new("alice");
        let bob = EmployeeId::new("bob");
        let a = s
            .create_assignment(&planner(), &alice, &morning, day(2), None)
            .unwrap();
        s.create_assignment(&planner(), &bob, &evening, day(2), None)
            .unwrap();
        s.request_swap(&Caller::employee(&alice), &a.id, &bob, None)
            .unwrap();

        match s.confirm(&Caller::employee(&alice), &a.id).unwrap_err() {
            SchedError::InvalidState { current, .. } => assert_eq!(current, "swap_requested"),
            other => panic!("unexpected {other:?}"),
        }
        let pending = s.get_assignment(&a.id).unwrap();
        assert_eq!(pending.status, AssignmentStatus::SwapRequested);
        assert_eq!(pending.swap_requested_with, Some(bob.clone()));

        let swapped = s.resolve_swap(&planner(), &a.id, true, None).unwrap();
        assert_eq!(swapped.employee, bob);
        assert_eq!(swapped.status, AssignmentStatus::Confirmed);
    }

    #[test]
    fn only_target_may_decline_and_only_initiator_may_withdraw() {
        let (s, morning, evening) = setup(EngineConfig::default());
        let alice = EmployeeId::new("alice");
        let bob = EmployeeId::new("bob");
        let a = s
            .create_assignment(&planner(), &alice, &morning, day(2), None)
            .unwrap();
        s.create_assignment(&planner(), &bob, &evening, day(2), None)
            .unwrap();
        s.request_swap(&Caller::employee(&alice), &a.id, &bob, None)
            .unwrap();

        assert!(matches!(
            s.decline_swap(&Caller::employee(&alice), &a.id, None),
            Err(SchedError::Forbidden(_))
        ));
        assert!(matches!(
            s.withdraw_swap(&Caller::employee(&bob), &a.id),
            Err(SchedError::Forbidden(_))
        ));
        let declined = s
            .decline_swap(&Caller::employee(&bob), &a.id, Some("busy"))
            .unwrap();
        assert_eq!(declined.status, AssignmentStatus::Assigned);
    }

    #[test]
    fn resolve_requires_approver() {
        let (s, morning, evening) = setup(EngineConfig::default());
        let alice = EmployeeId::new("alice");
        let bob = EmployeeId::new("bob");
        let a = s
            .create_assignment(&planner(), &alice, &morning, day(2), None)
            .unwrap();
        s.create_assignment(&planner(), &bob, &evening, day(2), None)
            .unwrap();
        s.request_swap(&Caller::employee(&alice), &a.id, &bob, None)
            .unwrap();
        assert!(matches!(
            s.resolve_swap(&Caller::employee(&bob), &a.id, true, None),
            Err(SchedError::Forbidden(_))
        ));
    }

    #[test]
    fn same_date_policy_rejects_cross_date_offer() {
        let (s, morning, evening) = setup(EngineConfig::default());
        let alice = EmployeeId::new("alice");
        let bob = EmployeeId::new("bob");
        let a = s
            .create_assignment(&planner(), &alice, &morning, day(2), None)
            .unwrap();
        let b = s
            .create_assignment(&planner(), &bob, &evening, day(3), None)
            .unwrap();
        assert!(matches!(
            s.request_swap(&Caller::employee(&alice), &a.id, &bob, None),
            Err(SchedError::Validation(_))
        ));
        assert!(matches!(
            s.request_swap(&Caller::employee(&alice), &a.id, &bob, Some(&b.id)),
            Err(SchedError::Validation(_))
        ));
    }

    #[test]
    fn terminal_counterpart_is_mirrored() {
        let (s, morning, evening) = setup(EngineConfig::default());
        let alice = EmployeeId::new("alice");
        let bob = EmployeeId::new("bob");
        let a = s
            .create_assignment(&planner(), &alice, &morning, day(2), None)
            .unwrap();
        let b = s
            .create_assignment(&planner(), &bob, &evening, day(2), None)
            .unwrap();
        s.request_swap(&Caller::employee(&alice), &a.id, &bob, None)
            .unwrap();
        s.decline(&Caller::employee(&bob), &b.id, None).unwrap();

        let resolved = s.resolve_swap(&planner(), &a.id, true, None).unwrap();
        assert_eq!(resolved.employee, bob);
        assert_eq!(resolved.status, AssignmentStatus::Confirmed);

        let mirrored: Vec<_> = s
            .assignments_for(&alice)
            .into_iter()
            .filter(|x| x.is_live())
            .collect();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].shift, evening);
        assert_eq!(mirrored[0].status, AssignmentStatus::Confirmed);
        assert!(s.snapshot().double_bookings().is_empty());
    }
}
