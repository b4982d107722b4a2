use crate::model::RotationPattern;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Échanges limités au même jour, ou autorisés entre dates différentes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDatePolicy {
    SameDateOnly,
    AnyDate,
}

/// Sort d'une rotation qui laisse des créneaux en sous-effectif.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderstaffedPolicy {
    Warn,
    Abort,
}

/// Options reconnues par le moteur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_rotation: RotationPattern,
    pub swap_policy: SwapDatePolicy,
    pub understaffed: UnderstaffedPolicy,
    pub reminder_lead_days: u32,
    pub rotation_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_rotation: RotationPattern::Weekly,
            swap_policy: SwapDatePolicy::SameDateOnly,
            understaffed: UnderstaffedPolicy::Warn,
            reminder_lead_days: 1,
            rotation_workers: 1,
        }
    }
}

impl EngineConfig {
    /// Charge un fichier JSON ; les clés absentes prennent la valeur par défaut.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let config: EngineConfig = serde_json::from_slice(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "swap_policy": "any_date", "reminder_lead_days": 3 }"#)
                .unwrap();
        assert_eq!(config.swap_policy, SwapDatePolicy::AnyDate);
        assert_eq!(config.reminder_lead_days, 3);
        assert_eq!(config.understaffed, UnderstaffedPolicy::Warn);
        assert_eq!(config.default_rotation, RotationPattern::Weekly);
    }
}
