use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new<S: AsRef<str>>(s: S) -> Self {
                Self(s.as_ref().to_owned())
            }
            pub fn random() -> Self {
                Self(Uuid::new_v4().to_string())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifiant fort d'un salarié
    EmployeeId
);
string_id!(
    /// Identifiant d'un utilisateur agissant (planificateur, valideur…)
    UserId
);
string_id!(OrganizationId);
string_id!(DepartmentId);
string_id!(
    /// Identifiant d'un modèle de poste
    ShiftId
);
string_id!(RosterId);
string_id!(AssignmentId);

/// Modèle de poste réutilisable (fenêtre horaire sans date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shift {
    pub id: ShiftId,
    pub organization: OrganizationId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default)]
    pub break_minutes: u32,
    /// Jours applicables, 0 = dimanche … 6 = samedi.
    pub applicable_days: Vec<u8>,
    #[serde(default)]
    pub overtime_allowed: bool,
    pub overtime_multiplier: f64,
    #[serde(default)]
    pub grace_period_minutes: u32,
    pub minimum_staff: u32,
    #[serde(default)]
    pub maximum_staff: Option<u32>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Shift {
    /// Durée en minutes, en traversant minuit si besoin.
    pub fn duration_minutes(&self) -> u32 {
        window_minutes(self.start_time, self.end_time)
    }

    /// Vrai quand le poste traverse minuit.
    pub fn is_night_shift(&self) -> bool {
        self.end_time < self.start_time
    }

    /// Minutes travaillées prévues (pause déduite).
    pub fn scheduled_work_minutes(&self) -> u32 {
        self.duration_minutes().saturating_sub(self.break_minutes)
    }

    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.applicable_days.contains(&weekday_index(date))
    }

    pub fn starts_at(&self, date: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::new(date, self.start_time))
    }
}

/// Longueur d'une fenêtre horaire ; `end <= start` signifie le lendemain.
pub fn window_minutes(start: NaiveTime, end: NaiveTime) -> u32 {
    let s = start.num_seconds_from_midnight() / 60;
    let e = end.num_seconds_from_midnight() / 60;
    if e > s {
        e - s
    } else {
        MINUTES_PER_DAY - s + e
    }
}

pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterStatus {
    Draft,
    PendingApproval,
    Approved,
    Published,
    Archived,
}

impl RosterStatus {
    /// Table de transitions : progression monotone, archivage depuis tout état non terminal.
    pub fn can_transition_to(self, next: RosterStatus) -> bool {
        use RosterStatus::*;
        match (self, next) {
            (Archived, _) => false,
            (_, Archived) => true,
            (Draft, PendingApproval) | (PendingApproval, Approved) | (Approved, Published) => true,
            _ => false,
        }
    }

    /// Le générateur de rotation n'écrit plus après publication.
    pub fn accepts_rotation(self) -> bool {
        matches!(
            self,
            RosterStatus::Draft | RosterStatus::PendingApproval | RosterStatus::Approved
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RosterStatus::Draft => "draft",
            RosterStatus::PendingApproval => "pending_approval",
            RosterStatus::Approved => "approved",
            RosterStatus::Published => "published",
            RosterStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for RosterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPattern {
    Weekly,
    Biweekly,
    Monthly,
    Custom,
}

impl RotationPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            RotationPattern::Weekly => "weekly",
            RotationPattern::Biweekly => "biweekly",
            RotationPattern::Monthly => "monthly",
            RotationPattern::Custom => "custom",
        }
    }
}

impl fmt::Display for RotationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weekly" => Ok(RotationPattern::Weekly),
            "biweekly" => Ok(RotationPattern::Biweekly),
            "monthly" => Ok(RotationPattern::Monthly),
            "custom" => Ok(RotationPattern::Custom),
            other => Err(format!("unknown rotation pattern: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPolicy {
    pub notify_on_publish: bool,
    pub notify_on_change: bool,
    /// Délai de rappel en jours ; `None` = valeur par défaut de la config.
    #[serde(default)]
    pub reminder_days: Option<u32>,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            notify_on_publish: true,
            notify_on_change: true,
            reminder_days: None,
        }
    }
}

/// Planning : période bornée + circuit de validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftRoster {
    pub id: RosterId,
    pub organization: OrganizationId,
    #[serde(default)]
    pub department: Option<DepartmentId>,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: RosterStatus,
    pub rotation_pattern: RotationPattern,
    #[serde(default)]
    pub auto_assign: bool,
    #[serde(default)]
    pub notification: NotificationPolicy,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_by: Option<UserId>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_by: Option<UserId>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ShiftRoster {
    pub fn is_published(&self) -> bool {
        self.status == RosterStatus::Published
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    /// Jours de la période, bornes incluses.
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.start_date
            .iter_days()
            .take_while(|d| *d <= self.end_date)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Confirmed,
    Declined,
    SwapRequested,
    Cancelled,
}

impl AssignmentStatus {
    /// Statuts qui occupent la journée du salarié.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AssignmentStatus::Assigned | AssignmentStatus::Confirmed | AssignmentStatus::SwapRequested
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Assigned, Confirmed | Declined | Cancelled | SwapRequested)
                | (Confirmed, Declined | Cancelled | SwapRequested)
                | (SwapRequested, Assigned | Confirmed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Confirmed => "confirmed",
            AssignmentStatus::Declined => "declined",
            AssignmentStatus::SwapRequested => "swap_requested",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position relevée au pointage. Stockée telle quelle, jamais évaluée.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Affectation d'un salarié à un poste pour une date donnée.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftAssignment {
    pub id: AssignmentId,
    pub organization: OrganizationId,
    #[serde(default)]
    pub roster: Option<RosterId>,
    pub shift: ShiftId,
    pub employee: EmployeeId,
    pub date: NaiveDate,
    pub status: AssignmentStatus,
    /// Statut détenu au moment de la demande d'échange.
    #[serde(default)]
    pub previous_status: Option<AssignmentStatus>,
    #[serde(default)]
    pub swap_requested_with: Option<EmployeeId>,
    #[serde(default)]
    pub swap_counterpart: Option<AssignmentId>,
    #[serde(default)]
    pub swap_requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub swap_approved_by: Option<UserId>,
    #[serde(default)]
    pub swap_approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decline_reason: Option<String>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub actual_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_break_minutes: Option<u32>,
    #[serde(default)]
    pub overtime_minutes: u32,
    #[serde(default)]
    pub check_in: Option<LocationSnapshot>,
    #[serde(default)]
    pub check_out: Option<LocationSnapshot>,
    #[serde(default)]
    pub performance_rating: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShiftAssignment {
    pub fn new(
        organization: OrganizationId,
        roster: Option<RosterId>,
        shift: ShiftId,
        employee: EmployeeId,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AssignmentId::random(),
            organization,
            roster,
            shift,
            employee,
            date,
            status: AssignmentStatus::Assigned,
            previous_status: None,
            swap_requested_with: None,
            swap_counterpart: None,
            swap_requested_at: None,
            swap_approved_by: None,
            swap_approved_at: None,
            decline_reason: None,
            cancel_reason: None,
            actual_start: None,
            actual_end: None,
            actual_break_minutes: None,
            overtime_minutes: 0,
            check_in: None,
            check_out: None,
            performance_rating: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Efface l'appariement d'échange en cours (les tampons d'approbation restent).
    pub fn clear_swap(&mut self) {
        self.previous_status = None;
        self.swap_requested_with = None;
        self.swap_counterpart = None;
        self.swap_requested_at = None;
    }
}

/// Agrégat persisté : catalogue, plannings et affectations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub shifts: Vec<Shift>,
    #[serde(default)]
    pub rosters: Vec<ShiftRoster>,
    #[serde(default)]
    pub assignments: Vec<ShiftAssignment>,
}

impl Registry {
    pub fn find_shift<'a>(&'a self, id: &ShiftId) -> Option<&'a Shift> {
        self.shifts.iter().find(|s| &s.id == id)
    }
    pub fn find_shift_mut(&mut self, id: &ShiftId) -> Option<&mut Shift> {
        self.shifts.iter_mut().find(|s| &s.id == id)
    }
    pub fn find_roster<'a>(&'a self, id: &RosterId) -> Option<&'a ShiftRoster> {
        self.rosters.iter().find(|r| &r.id == id)
    }
    pub fn find_roster_mut(&mut self, id: &RosterId) -> Option<&mut ShiftRoster> {
        self.rosters.iter_mut().find(|r| &r.id == id)
    }
    pub fn find_assignment<'a>(&'a self, id: &AssignmentId) -> Option<&'a ShiftAssignment> {
        self.assignments.iter().find(|a| &a.id == id)
    }
    pub fn find_assignment_mut(&mut self, id: &AssignmentId) -> Option<&mut ShiftAssignment> {
        self.assignments.iter_mut().find(|a| &a.id == id)
    }

    /// Affectations vivantes d'un salarié à une date, hors `exclude`.
    pub fn live_assignments_on<'a>(
        &'a self,
        employee: &'a EmployeeId,
        date: NaiveDate,
        exclude: &'a [&'a AssignmentId],
    ) -> impl Iterator<Item = &'a ShiftAssignment> + 'a {
        self.assignments.iter().filter(move |a| {
            a.is_live() && &a.employee == employee && a.date == date && !exclude.contains(&&a.id)
        })
    }

    pub fn assignments_for_roster<'a>(
        &'a self,
        roster: &'a RosterId,
    ) -> impl Iterator<Item = &'a ShiftAssignment> + 'a {
        self.assignments
            .iter()
            .filter(move |a| a.roster.as_ref() == Some(roster))
    }

    /// Nombre d'affectations vivantes sur un créneau (date, poste).
    pub fn staffed_count(&self, shift: &ShiftId, date: NaiveDate) -> u32 {
        self.assignments
            .iter()
            .filter(|a| a.is_live() && &a.shift == shift && a.date == date)
            .count() as u32
    }

    /// Couples (salarié, date) portant plus d'une affectation vivante.
    pub fn double_bookings(&self) -> Vec<(EmployeeId, NaiveDate)> {
        let mut counts: HashMap<(&EmployeeId, NaiveDate), usize> = HashMap::new();
        for a in self.assignments.iter().filter(|a| a.is_live()) {
            *counts.entry((&a.employee, a.date)).or_default() += 1;
        }
        let mut out: Vec<(EmployeeId, NaiveDate)> = counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|((e, d), _)| (e.clone(), d))
            .collect();
        out.sort();
        out
    }
}
