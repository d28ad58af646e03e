//! Intent Registry (C2): process-wide dedup set enforcing at-most-one live
//! plan per intent fingerprint.
//!
//! `dashmap` gives per-shard locking so single-entry reads/writes are atomic
//! without a manual mutex held across calls into other components.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryState {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub state: RegistryState,
    pub registered_ts: i64,
}

#[derive(Debug, Default)]
pub struct IntentRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, intent_id: &str, now_ms: i64) -> Result<(), PipelineError> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(intent_id.to_string()) {
            Entry::Occupied(_) => Err(PipelineError::DuplicateIntent {
                intent_id: intent_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    state: RegistryState::Active,
                    registered_ts: now_ms,
                });
                Ok(())
            }
        }
    }

    pub fn mark_completed(&self, intent_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(intent_id) {
            entry.state = RegistryState::Completed;
        }
    }

    pub fn mark_failed(&self, intent_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(intent_id) {
            entry.state = RegistryState::Failed;
        }
    }

    pub fn is_registered(&self, intent_id: &str) -> bool {
        self.entries.contains_key(intent_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == RegistryState::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_once_succeeds() {
        let reg = IntentRegistry::new();
        assert!(reg.register("i1", 0).is_ok());
        assert!(reg.is_registered("i1"));
    }

    #[test]
    fn duplicate_register_fails() {
        let reg = IntentRegistry::new();
        reg.register("i1", 0).unwrap();
        let err = reg.register("i1", 1).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_INTENT");
    }

    #[test]
    fn mark_completed_does_not_allow_re_register() {
        let reg = IntentRegistry::new();
        reg.register("i1", 0).unwrap();
        reg.mark_completed("i1");
        assert!(reg.register("i1", 2).is_err());
    }

    #[test]
    fn active_count_excludes_terminal() {
        let reg = IntentRegistry::new();
        reg.register("i1", 0).unwrap();
        reg.register("i2", 0).unwrap();
        reg.mark_failed("i2");
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.len(), 2);
    }
}
