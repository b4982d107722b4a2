use super::ledger::insert_assignment;
use super::types::{Rotation, RotationSummary, SkippedCandidate, UnderstaffedSlot};
use super::{util, SchedError, Scheduler};
use crate::auth::{Caller, Capability};
use crate::config::UnderstaffedPolicy;
use crate::model::{EmployeeId, OrganizationId, Registry, RosterId, Shift};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::thread;

/// Paramètres figés d'une génération, partagés entre les workers.
struct RotationPlan {
    roster: RosterId,
    organization: OrganizationId,
    start: NaiveDate,
    rotation: Rotation,
    candidates: Vec<EmployeeId>,
}

impl RotationPlan {
    /// Indice de départ dans la liste des candidats pour le poste de rang `position`.
    fn start_index(&self, date: NaiveDate, position: usize, minimum_staff: u32) -> usize {
        let n = self.candidates.len();
        let offset = util::days_between(self.start, date);
        let cycle_day = match &self.rotation {
            Rotation::Weekly => offset.rem_euclid(7) as usize,
            Rotation::Biweekly => offset.rem_euclid(14) as usize,
            Rotation::Monthly => date.day0() as usize,
            Rotation::Custom(mapping) => return mapping(offset, position) % n,
        };
        (cycle_day + position * minimum_staff as usize) % n
    }
}

impl Scheduler {
    /// Remplit les créneaux du planning selon `rotation`. Les affectations
    /// existantes comptent dans l'effectif et ne sont jamais touchées.
    pub fn generate_rotation(
        &self,
        caller: &Caller,
        roster: &RosterId,
        rotation: Rotation,
        candidates: &[EmployeeId],
    ) -> Result<RotationSummary, SchedError> {
        self.authorizer.authorize(caller, Capability::Scheduler)?;
        let candidates = util::stable_candidates(candidates);
        if candidates.is_empty() {
            return Err(SchedError::Validation("rotation needs at least one candidate".into()));
        }

        let (plan, dates) = self.store.read(|reg| {
            let r = reg
                .find_roster(roster)
                .ok_or_else(|| SchedError::not_found("roster", roster))?;
            if !r.status.accepts_rotation() {
                return Err(SchedError::invalid_state(r.status, "generate rotation"));
            }
            let plan = RotationPlan {
                roster: r.id.clone(),
                organization: r.organization.clone(),
                start: r.start_date,
                rotation,
                candidates,
            };
            Ok((plan, r.dates()))
        })?;

        tracing::debug!(
            roster = %roster,
            pattern = %plan.rotation.pattern(),
            candidates = plan.candidates.len(),
            days = dates.len(),
            "generating rotation"
        );

        let summary = match self.config.understaffed {
            UnderstaffedPolicy::Abort => self.rotate_all_or_nothing(&plan, &dates)?,
            UnderstaffedPolicy::Warn => self.rotate_by_date(&plan, &dates)?,
        };

        for slot in &summary.understaffed {
            tracing::warn!(roster = %roster, %slot, "understaffed slot");
        }
        tracing::info!(roster = %roster, %summary, "rotation generated");
        Ok(summary)
    }

    /// Variante qui reprend le motif enregistré sur le planning.
    pub fn generate_roster_rotation(
        &self,
        caller: &Caller,
        roster: &RosterId,
        candidates: &[EmployeeId],
    ) -> Result<RotationSummary, SchedError> {
        let pattern = self.get_roster(roster)?.rotation_pattern;
        let rotation = Rotation::from_pattern(pattern).ok_or_else(|| {
            SchedError::Validation(format!(
                "roster {roster} uses a {pattern} rotation; supply the mapping explicitly"
            ))
        })?;
        self.generate_rotation(caller, roster, rotation, candidates)
    }

    /// Un seul brouillon pour toute la période, jeté au premier créneau
    /// en sous-effectif.
    fn rotate_all_or_nothing(
        &self,
        plan: &RotationPlan,
        dates: &[NaiveDate],
    ) -> Result<RotationSummary, SchedError> {
        let _scope = self.locks.acquire(
            dates
                .iter()
                .flat_map(|d| plan.candidates.iter().map(move |e| (e.clone(), *d))),
        );
        let now = self.clock.now();
        self.store.transaction(|reg| {
            let mut summary = RotationSummary::default();
            for date in dates {
                summary.absorb(plan_date(reg, plan, *date, now)?);
            }
            if summary.understaffed.is_empty() {
                Ok(summary)
            } else {
                for slot in &summary.understaffed {
                    tracing::warn!(roster = %plan.roster, %slot, "understaffed slot, rotation discarded");
                }
                Err(SchedError::Understaffed {
                    slots: summary.understaffed,
                })
            }
        })
    }

    /// Une transaction par date ; les dates se répartissent entre
    /// `rotation_workers` threads.
    fn rotate_by_date(
        &self,
        plan: &RotationPlan,
        dates: &[NaiveDate],
    ) -> Result<RotationSummary, SchedError> {
        let workers = self.config.rotation_workers.clamp(1, dates.len().max(1));
        let run = |date: NaiveDate| {
            let _scope = self
                .locks
                .acquire(plan.candidates.iter().map(|e| (e.clone(), date)));
            let now = self.clock.now();
            self.store.transaction(|reg| plan_date(reg, plan, date, now))
        };

        let mut per_date: Vec<(usize, Result<RotationSummary, SchedError>)> = if workers == 1 {
            dates.iter().map(|d| run(*d)).enumerate().collect()
        } else {
            thread::scope(|s| {
                let handles: Vec<_> = (0..workers)
                    .map(|w| {
                        let run = &run;
                        s.spawn(move || {
                            dates
                                .iter()
                                .enumerate()
                                .skip(w)
                                .step_by(workers)
                                .map(|(i, d)| (i, run(*d)))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .flat_map(|h| match h.join() {
                        Ok(done) => done,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                    .collect()
            })
        };
        per_date.sort_by_key(|(i, _)| *i);

        let mut summary = RotationSummary::default();
        for (_, outcome) in per_date {
            summary.absorb(outcome?);
        }
        Ok(summary)
    }
}

/// Remplit une date dans le brouillon `reg`. Un candidat déjà occupé ce
/// jour-là est écarté ; toute autre erreur interrompt la date.
fn plan_date(
    reg: &mut Registry,
    plan: &RotationPlan,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<RotationSummary, SchedError> {
    let roster = reg
        .find_roster(&plan.roster)
        .ok_or_else(|| SchedError::not_found("roster", &plan.roster))?;
    if !roster.status.accepts_rotation() {
        return Err(SchedError::invalid_state(roster.status, "generate rotation"));
    }

    let shifts: Vec<Shift> = reg
        .shifts
        .iter()
        .filter(|s| s.active && s.organization == plan.organization && s.applies_on(date))
        .cloned()
        .collect();

    let n = plan.candidates.len();
    let mut summary = RotationSummary::default();
    for (position, shift) in shifts.iter().enumerate() {
        let existing = reg.staffed_count(&shift.id, date);
        let ceiling = shift.maximum_staff.unwrap_or(u32::MAX).min(shift.minimum_staff);
        let mut staffed = existing;
        let start = plan.start_index(date, position, shift.minimum_staff);

        for k in 0..n {
            if staffed >= ceiling {
                break;
            }
            let employee = &plan.candidates[(start + k) % n];
            match insert_assignment(reg, employee, &shift.id, date, Some(&plan.roster), now) {
                Ok(created) => {
                    staffed += 1;
                    summary.created.push(created.id);
                }
                Err(SchedError::Conflict(reason)) => summary.skipped.push(SkippedCandidate {
                    employee: employee.clone(),
                    date,
                    shift: shift.id.clone(),
                    reason,
                }),
                Err(e) => return Err(e),
            }
        }

        if staffed < shift.minimum_staff {
            summary.understaffed.push(UnderstaffedSlot {
                date,
                shift: shift.id.clone(),
                required: shift.minimum_staff,
                assigned: staffed,
            });
        }
    }
    Ok(summary)
}
