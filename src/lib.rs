#![forbid(unsafe_code)]
//! Roulement — moteur de planification des postes et d'affectation des équipes.
//!
//! - Catalogue de modèles de poste (fenêtre horaire, pause, effectifs).
//! - Registre d'affectations : un seul poste par salarié et par jour.
//! - Échanges en deux temps, validés d'un seul tenant.
//! - Circuit brouillon -> validation -> publication -> archivage.
//! - Génération de rotations hebdomadaires, bimensuelles, mensuelles ou sur mesure.
//! - Tout en UTC ; stockage JSON local, import/export CSV.

pub mod auth;
pub mod clock;
pub mod config;
pub mod io;
pub mod model;
pub mod notification;
pub mod scheduler;
pub mod storage;

pub use auth::{Authorizer, Caller, Capability, CapabilityAuthorizer};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EngineConfig, SwapDatePolicy, UnderstaffedPolicy};
pub use model::{
    AssignmentId, AssignmentStatus, EmployeeId, OrganizationId, Registry, RosterId, RosterStatus,
    RotationPattern, Shift, ShiftAssignment, ShiftId, ShiftRoster,
};
pub use notification::{
    ChangeKind, JsonLinesNotifier, LogNotifier, Notifier, RecordingNotifier, SchedulingEvent,
};
pub use scheduler::{
    Rotation, RotationSummary, RosterDraft, SchedError, Scheduler, ShiftSpec, ShiftUpdate,
};
pub use storage::{JsonStorage, MemoryStorage, Storage, Store};
