use crate::model::EmployeeId;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

pub(super) type SlotKey = (EmployeeId, NaiveDate);

/// Verrous par couple (salarié, date).
///
/// Une portée prend toutes ses clés d'un coup ou attend : pas d'ordre
/// d'acquisition à respecter, donc pas d'interblocage entre portées.
#[derive(Debug, Default)]
pub(super) struct KeyLocks {
    held: Mutex<HashSet<SlotKey>>,
    released: Condvar,
}

pub(super) struct KeyScope<'a> {
    locks: &'a KeyLocks,
    keys: Vec<SlotKey>,
}

impl KeyLocks {
    pub(super) fn acquire<I>(&self, keys: I) -> KeyScope<'_>
    where
        I: IntoIterator<Item = SlotKey>,
    {
        let keys = normalize(keys);
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while keys.iter().any(|k| held.contains(k)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.extend(keys.iter().cloned());
        KeyScope { locks: self, keys }
    }
}

impl Drop for KeyScope<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            held.remove(key);
        }
        self.locks.released.notify_all();
    }
}

pub(super) fn normalize<I>(keys: I) -> Vec<SlotKey>
where
    I: IntoIterator<Item = SlotKey>,
{
    let mut keys: Vec<SlotKey> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Candidats triés, sans doublon : l'ordre de rotation ne dépend pas de l'appelant.
pub(super) fn stable_candidates(candidates: &[EmployeeId]) -> Vec<EmployeeId> {
    let mut out = candidates.to_vec();
    out.sort();
    out.dedup();
    out
}

pub(super) fn days_between(start: NaiveDate, current: NaiveDate) -> i64 {
    current.signed_duration_since(start).num_days()
}
