use crate::model::{EmployeeId, UserId};
use crate::scheduler::SchedError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Capacités exigées par les opérations mutantes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    SchedulerAdmin,
    Scheduler,
    Approver,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::SchedulerAdmin => "scheduler-admin",
            Capability::Scheduler => "scheduler",
            Capability::Approver => "approver",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduler-admin" | "admin" => Ok(Capability::SchedulerAdmin),
            "scheduler" => Ok(Capability::Scheduler),
            "approver" => Ok(Capability::Approver),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

/// Identité de l'appelant telle que fournie par la couche d'authentification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: UserId,
    pub employee: Option<EmployeeId>,
    pub capabilities: Vec<Capability>,
}

impl Caller {
    pub fn new<S: AsRef<str>>(user: S) -> Self {
        Self {
            user: UserId::new(user),
            employee: None,
            capabilities: Vec::new(),
        }
    }

    /// Salarié agissant pour lui-même (identifiants utilisateur et salarié confondus).
    pub fn employee(id: &EmployeeId) -> Self {
        Self {
            user: UserId::new(id.as_str()),
            employee: Some(id.clone()),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_employee(&self, employee: &EmployeeId) -> bool {
        self.employee.as_ref() == Some(employee)
    }
}

/// Verdict d'autorisation, délégué au collaborateur externe.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, caller: &Caller, capability: Capability) -> Result<(), SchedError>;
}

/// Autorise sur la seule base des capacités portées par l'appelant.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapabilityAuthorizer;

impl Authorizer for CapabilityAuthorizer {
    fn authorize(&self, caller: &Caller, capability: Capability) -> Result<(), SchedError> {
        if caller.has(capability) {
            return Ok(());
        }
        Err(SchedError::Forbidden(format!(
            "{} lacks capability {}",
            caller.user, capability
        )))
    }
}
