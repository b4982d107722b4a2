use crate::model::Registry;
use crate::scheduler::SchedError;
use anyhow::Context;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

pub trait Storage: Send + Sync {
    /// Charge le registre depuis un support.
    fn load(&self) -> anyhow::Result<Registry>;
    /// Sauvegarde de manière atomique.
    fn save(&self, registry: &Registry) -> anyhow::Result<()>;
}

pub struct JsonStorage {
    path: PathBuf,
}

impl JsonStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Ok(Self {
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl Storage for JsonStorage {
    fn load(&self) -> anyhow::Result<Registry> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Registry::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let registry: Registry = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(registry)
    }

    fn save(&self, registry: &Registry) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(registry)?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).with_context(|| "creating temp file")?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).with_context(|| "atomic rename")?;
        Ok(())
    }
}

/// Support volatile : rien n'est écrit.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStorage;

impl Storage for MemoryStorage {
    fn load(&self) -> anyhow::Result<Registry> {
        Ok(Registry::default())
    }

    fn save(&self, _registry: &Registry) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Unité de travail sur le registre.
///
/// Chaque transaction travaille sur une copie ; la copie ne remplace l'état
/// courant qu'après contrôle de l'index d'unicité (salarié, date) et
/// sauvegarde réussie. Une erreur en cours de route laisse l'état intact.
pub struct Store {
    state: Mutex<Registry>,
    backend: Box<dyn Storage>,
}

impl Store {
    pub fn new(backend: Box<dyn Storage>, registry: Registry) -> Self {
        Self {
            state: Mutex::new(registry),
            backend,
        }
    }

    pub fn open(backend: Box<dyn Storage>) -> anyhow::Result<Self> {
        let registry = backend.load()?;
        Ok(Self::new(backend, registry))
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read<T>(&self, f: impl FnOnce(&Registry) -> T) -> T {
        f(&self.lock())
    }

    pub fn snapshot(&self) -> Registry {
        self.lock().clone()
    }

    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> Result<T, SchedError>,
    ) -> Result<T, SchedError> {
        let mut state = self.lock();
        let mut draft = state.clone();
        let out = f(&mut draft)?;

        if let Some((employee, date)) = draft.double_bookings().into_iter().next() {
            return Err(SchedError::Conflict(format!(
                "{employee} already holds a shift on {date}"
            )));
        }

        self.backend.save(&draft)?;
        *state = draft;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EmployeeId, OrganizationId, ShiftAssignment, ShiftId};
    use chrono::{NaiveDate, Utc};

    fn assignment(shift: &str) -> ShiftAssignment {
        ShiftAssignment::new(
            OrganizationId::new("org"),
            None,
            ShiftId::new(shift),
            EmployeeId::new("alice"),
            NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn failed_transaction_leaves_state_untouched() {
        let store = Store::new(Box::new(MemoryStorage), Registry::default());
        let res: Result<(), SchedError> = store.transaction(|reg| {
            reg.assignments.push(assignment("a"));
            Err(SchedError::Validation("nope".into()))
        });
        assert!(res.is_err());
        assert!(store.read(|r| r.assignments.is_empty()));
    }

    #[test]
    fn commit_rejects_double_booking() {
        let store = Store::new(Box::new(MemoryStorage), Registry::default());
        store
            .transaction(|reg| {
                reg.assignments.push(assignment("a"));
                Ok(())
            })
            .unwrap();
        let err = store
            .transaction(|reg| {
                reg.assignments.push(assignment("b"));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, SchedError::Conflict(_)));
        assert_eq!(store.read(|r| r.assignments.len()), 1);
    }

    #[test]
    fn json_storage_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::open(dir.path().join("registry.json")).unwrap();
        assert!(storage.load().unwrap().assignments.is_empty());

        let mut reg = Registry::default();
        reg.assignments.push(assignment("a"));
        storage.save(&reg).unwrap();
        assert_eq!(storage.load().unwrap().assignments, reg.assignments);
    }
}
