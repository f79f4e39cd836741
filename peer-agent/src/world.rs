//! Local entity registry
//!
//! Tracks which network identifiers have a local representation and the
//! attributes applied to them. The actual game objects live in the
//! embedding application; this registry is the synchronization layer's
//! view of them.

use std::collections::{HashMap, HashSet};

use entity_sync::dispatch::{AttributeValue, EntityWorld};

/// Flat attribute store keyed by network id.
#[derive(Default)]
pub struct LocalWorld {
    entities: HashSet<i32>,
    attributes: HashMap<i32, HashMap<String, AttributeValue>>,
}

impl LocalWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locally created or announced entity. Messages for its
    /// id stop being deferred once this returns.
    pub fn spawn(&mut self, network_id: i32) {
        if !self.entities.insert(network_id) {
            log::debug!("entity {} already present", network_id);
        }
    }

    /// Drop an entity and its attributes.
    pub fn despawn(&mut self, network_id: i32) {
        self.entities.remove(&network_id);
        self.attributes.remove(&network_id);
    }

    pub fn contains(&self, network_id: i32) -> bool {
        self.entities.contains(&network_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn attribute(&self, network_id: i32, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(&network_id)?.get(name)
    }
}

impl EntityWorld for LocalWorld {
    fn has_local_representation(&self, network_id: i32) -> bool {
        self.entities.contains(&network_id)
    }

    fn apply_attribute(&mut self, network_id: i32, name: &str, value: AttributeValue) {
        if !self.entities.contains(&network_id) {
            // Callers check has_local_representation first; an apply for
            // an unknown id indicates a dispatch defect upstream
            log::warn!("attribute '{}' applied to unknown entity {}", name, network_id);
            return;
        }
        self.attributes
            .entry(network_id)
            .or_default()
            .insert(name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_apply() {
        let mut world = LocalWorld::new();
        assert!(!world.has_local_representation(7));

        world.spawn(7);
        assert!(world.has_local_representation(7));

        world.apply_attribute(7, "Health", AttributeValue::Int(80));
        assert_eq!(world.attribute(7, "Health"), Some(&AttributeValue::Int(80)));
    }

    #[test]
    fn test_apply_to_unknown_entity_is_dropped() {
        let mut world = LocalWorld::new();
        world.apply_attribute(3, "Health", AttributeValue::Int(80));
        assert_eq!(world.attribute(3, "Health"), None);
    }

    #[test]
    fn test_despawn_clears_attributes() {
        let mut world = LocalWorld::new();
        world.spawn(5);
        world.apply_attribute(5, "Flag", AttributeValue::Bool(true));

        world.despawn(5);
        assert!(!world.contains(5));

        world.spawn(5);
        assert_eq!(world.attribute(5, "Flag"), None);
    }
}
