//! Coarse tracking of groups whose contents changed since the UI last looked

use crate::group::Group;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Set of groups that need a refresh. Not a change log.
#[derive(Debug, Clone, Default)]
pub struct DirtyGroups {
    dirty: HashSet<Uuid>,
}

impl DirtyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `group` and every ancestor of it
    pub fn mark_dirty(&mut self, group: Uuid, groups: &HashMap<Uuid, Group>) {
        let mut seen = HashSet::new();
        let mut current = Some(group);
        while let Some(uuid) = current {
            // stop on a corrupt parent chain
            if !seen.insert(uuid) {
                break;
            }
            self.dirty.insert(uuid);
            current = groups.get(&uuid).and_then(|g| g.parent);
        }
    }

    pub fn is_dirty(&self, group: &Uuid) -> bool {
        self.dirty.contains(group)
    }

    pub fn clear_dirty(&mut self, group: &Uuid) -> bool {
        self.dirty.remove(group)
    }

    /// Take every dirty group, leaving the set empty
    pub fn drain(&mut self) -> Vec<Uuid> {
        self.dirty.drain().collect()
    }
}
