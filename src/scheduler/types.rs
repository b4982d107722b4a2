use crate::model::{
    AssignmentId, DepartmentId, EmployeeId, NotificationPolicy, OrganizationId, RotationPattern,
    ShiftId,
};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: cannot {action} while {current}")]
    InvalidState { current: String, action: &'static str },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("rotation aborted: {} understaffed slot(s)", .slots.len())]
    Understaffed { slots: Vec<UnderstaffedSlot> },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedError {
    pub fn invalid_state<S: fmt::Display>(current: S, action: &'static str) -> Self {
        SchedError::InvalidState {
            current: current.to_string(),
            action,
        }
    }

    pub fn not_found<S: fmt::Display>(kind: &'static str, id: S) -> Self {
        SchedError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

fn all_days() -> Vec<u8> {
    (0..=6).collect()
}

fn default_multiplier() -> f64 {
    1.5
}

fn one() -> u32 {
    1
}

/// Paramètres de création d'un modèle de poste.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftSpec {
    pub organization: OrganizationId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default)]
    pub break_minutes: u32,
    #[serde(default = "all_days")]
    pub applicable_days: Vec<u8>,
    #[serde(default)]
    pub overtime_allowed: bool,
    #[serde(default = "default_multiplier")]
    pub overtime_multiplier: f64,
    #[serde(default)]
    pub grace_period_minutes: u32,
    #[serde(default = "one")]
    pub minimum_staff: u32,
    #[serde(default)]
    pub maximum_staff: Option<u32>,
}

impl ShiftSpec {
    /// Tous les jours, un salarié minimum, pas d'heures supplémentaires.
    pub fn new<S: Into<String>>(
        organization: OrganizationId,
        name: S,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Self {
        Self {
            organization,
            name: name.into(),
            description: None,
            color: None,
            start_time,
            end_time,
            break_minutes: 0,
            applicable_days: all_days(),
            overtime_allowed: false,
            overtime_multiplier: default_multiplier(),
            grace_period_minutes: 0,
            minimum_staff: 1,
            maximum_staff: None,
        }
    }
}

/// Modification partielle d'un modèle. Seuls nom, description et couleur
/// restent modifiables une fois le poste utilisé.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub break_minutes: Option<u32>,
    pub applicable_days: Option<Vec<u8>>,
    pub overtime_allowed: Option<bool>,
    pub overtime_multiplier: Option<f64>,
    pub grace_period_minutes: Option<u32>,
    pub minimum_staff: Option<u32>,
    pub maximum_staff: Option<Option<u32>>,
}

impl ShiftUpdate {
    pub fn touches_schedule(&self) -> bool {
        self.start_time.is_some()
            || self.end_time.is_some()
            || self.break_minutes.is_some()
            || self.applicable_days.is_some()
            || self.overtime_allowed.is_some()
            || self.overtime_multiplier.is_some()
            || self.grace_period_minutes.is_some()
            || self.minimum_staff.is_some()
            || self.maximum_staff.is_some()
    }
}

/// Paramètres de création d'un planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterDraft {
    pub organization: OrganizationId,
    #[serde(default)]
    pub department: Option<DepartmentId>,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// `None` = motif par défaut de la configuration.
    #[serde(default)]
    pub rotation_pattern: Option<RotationPattern>,
    #[serde(default)]
    pub auto_assign: bool,
    #[serde(default)]
    pub notification: NotificationPolicy,
}

impl RosterDraft {
    pub fn new<S: Into<String>>(
        organization: OrganizationId,
        name: S,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            organization,
            department: None,
            name: name.into(),
            start_date,
            end_date,
            rotation_pattern: None,
            auto_assign: false,
            notification: NotificationPolicy::default(),
        }
    }
}

/// (décalage en jours depuis le début du planning, rang du poste) -> indice de départ.
pub type CustomMapping = Arc<dyn Fn(i64, usize) -> usize + Send + Sync>;

/// Motif de rotation effectivement appliqué par le générateur.
#[derive(Clone)]
pub enum Rotation {
    Weekly,
    Biweekly,
    Monthly,
    Custom(CustomMapping),
}

impl Rotation {
    pub fn custom<F>(mapping: F) -> Self
    where
        F: Fn(i64, usize) -> usize + Send + Sync + 'static,
    {
        Rotation::Custom(Arc::new(mapping))
    }

    /// `None` pour `custom`, qui exige une fonction fournie par l'appelant.
    pub fn from_pattern(pattern: RotationPattern) -> Option<Self> {
        match pattern {
            RotationPattern::Weekly => Some(Rotation::Weekly),
            RotationPattern::Biweekly => Some(Rotation::Biweekly),
            RotationPattern::Monthly => Some(Rotation::Monthly),
            RotationPattern::Custom => None,
        }
    }

    pub fn pattern(&self) -> RotationPattern {
        match self {
            Rotation::Weekly => RotationPattern::Weekly,
            Rotation::Biweekly => RotationPattern::Biweekly,
            Rotation::Monthly => RotationPattern::Monthly,
            Rotation::Custom(_) => RotationPattern::Custom,
        }
    }
}

impl fmt::Debug for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rotation::{}", self.pattern())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub employee: EmployeeId,
    pub date: NaiveDate,
    pub shift: ShiftId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderstaffedSlot {
    pub date: NaiveDate,
    pub shift: ShiftId,
    pub required: u32,
    pub assigned: u32,
}

impl fmt::Display for UnderstaffedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}/{}",
            self.date, self.shift, self.assigned, self.required
        )
    }
}

/// Bilan d'une génération : succès, candidats écartés, créneaux en sous-effectif.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSummary {
    pub created: Vec<AssignmentId>,
    pub skipped: Vec<SkippedCandidate>,
    pub understaffed: Vec<UnderstaffedSlot>,
}

impl RotationSummary {
    pub fn is_fully_staffed(&self) -> bool {
        self.understaffed.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: RotationSummary) {
        self.created.extend(other.created);
        self.skipped.extend(other.skipped);
        self.understaffed.extend(other.understaffed);
    }
}

impl fmt::Display for RotationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} skipped, {} understaffed",
            self.created.len(),
            self.skipped.len(),
            self.understaffed.len()
        )
    }
}
