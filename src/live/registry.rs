use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::controller::LedgerController;

/// One controller per entity.
///
/// Each controller serializes its own writes, so different entities never
/// contend with each other.
pub struct LedgerRegistry {
    controllers: RwLock<HashMap<String, Arc<LedgerController>>>,
    update_capacity: usize,
}

impl LedgerRegistry {
    pub fn new(update_capacity: usize) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            update_capacity,
        }
    }

    pub fn get(&self, entity: &str) -> Option<Arc<LedgerController>> {
        self.controllers.read().get(entity).cloned()
    }

    pub fn get_or_create(&self, entity: &str) -> Arc<LedgerController> {
        if let Some(existing) = self.get(entity) {
            return existing;
        }
        let mut map = self.controllers.write();
        map.entry(entity.to_string())
            .or_insert_with(|| Arc::new(LedgerController::new(entity, self.update_capacity)))
            .clone()
    }

    /// End the entity's session: reset its ledger and forget it.
    pub fn remove(&self, entity: &str) -> Option<Arc<LedgerController>> {
        let removed = self.controllers.write().remove(entity);
        if let Some(controller) = &removed {
            controller.reset();
        }
        removed
    }

    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.controllers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
