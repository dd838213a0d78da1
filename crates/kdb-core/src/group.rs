//! Group types and operations

use crate::icons::{IconRef, ICON_FOLDER};
use crate::times::Times;
use uuid::Uuid;

/// A group (folder) that contains entries and subgroups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Unique identifier for this group
    pub uuid: Uuid,
    /// Integer id used by KDB v3 files
    pub kdb_id: Option<u32>,
    /// Group name
    pub name: String,
    /// Notes for this group
    pub notes: String,
    pub icon: IconRef,
    /// UUID of the parent group (None for root)
    pub parent: Option<Uuid>,
    /// UUIDs of child groups, in display order
    pub children: Vec<Uuid>,
    /// UUIDs of entries in this group, in display order
    pub entries: Vec<Uuid>,
    pub times: Times,
    /// Whether this group is expanded in the UI
    pub expanded: bool,
    pub default_auto_type_sequence: String,
    /// Auto-type for entries in this group; `None` inherits from the parent
    pub enable_auto_type: Option<bool>,
    /// Search for entries in this group; `None` inherits from the parent
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Uuid,
    /// Raw KDB v3 flags, preserved as read
    pub kdb_flags: u32,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kdb_id: None,
            name: name.into(),
            notes: String::new(),
            icon: IconRef::standard(ICON_FOLDER),
            parent: None,
            children: Vec::new(),
            entries: Vec::new(),
            times: Times::new(),
            expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: Uuid::nil(),
            kdb_flags: 0,
        }
    }

    /// Create a new group with a specific UUID (used when loading from database)
    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        let mut group = Self::new(name);
        group.uuid = uuid;
        group
    }

    /// Add a child group UUID
    pub fn add_child(&mut self, child_uuid: Uuid) {
        if !self.children.contains(&child_uuid) {
            self.children.push(child_uuid);
        }
    }

    /// Remove a child group UUID
    pub fn remove_child(&mut self, child_uuid: &Uuid) -> bool {
        if let Some(pos) = self.children.iter().position(|u| u == child_uuid) {
            self.children.remove(pos);
            true
        } else {
            false
        }
    }

    /// Add an entry UUID to this group
    pub fn add_entry(&mut self, entry_uuid: Uuid) {
        if !self.entries.contains(&entry_uuid) {
            self.entries.push(entry_uuid);
        }
    }

    /// Remove an entry UUID from this group
    pub fn remove_entry(&mut self, entry_uuid: &Uuid) -> bool {
        if let Some(pos) = self.entries.iter().position(|u| u == entry_uuid) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Check if this is a root group (no parent)
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Mark as modified
    pub fn mark_modified(&mut self) {
        self.times.mark_modified();
    }
}

/// Builder for creating groups
pub struct GroupBuilder {
    group: Group,
}

impl GroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            group: Group::new(name),
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.group.notes = notes.into();
        self
    }

    pub fn icon(mut self, icon_id: u32) -> Self {
        self.group.icon = IconRef::standard(icon_id);
        self
    }

    pub fn parent(mut self, parent_uuid: Uuid) -> Self {
        self.group.parent = Some(parent_uuid);
        self
    }

    pub fn expanded(mut self, expanded: bool) -> Self {
        self.group.expanded = expanded;
        self
    }

    pub fn searchable(mut self, enabled: bool) -> Self {
        self.group.enable_searching = Some(enabled);
        self
    }

    pub fn build(self) -> Group {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_creation() {
        let group = Group::new("My Passwords");
        assert_eq!(group.name, "My Passwords");
        assert!(group.is_root());
        assert!(group.children.is_empty());
        assert!(group.entries.is_empty());
        assert_eq!(group.enable_searching, None);
    }

    #[test]
    fn test_group_builder() {
        let parent_uuid = Uuid::new_v4();
        let group = GroupBuilder::new("Work")
            .notes("Work-related passwords")
            .icon(1)
            .parent(parent_uuid)
            .expanded(false)
            .searchable(false)
            .build();

        assert_eq!(group.name, "Work");
        assert_eq!(group.notes, "Work-related passwords");
        assert_eq!(group.icon.standard, 1);
        assert_eq!(group.parent, Some(parent_uuid));
        assert!(!group.expanded);
        assert_eq!(group.enable_searching, Some(false));
    }

    #[test]
    fn test_group_children() {
        let mut group = Group::new("Parent");
        let child_uuid = Uuid::new_v4();

        group.add_child(child_uuid);
        assert_eq!(group.children.len(), 1);

        // Adding same child again should not duplicate
        group.add_child(child_uuid);
        assert_eq!(group.children.len(), 1);

        assert!(group.remove_child(&child_uuid));
        assert!(group.children.is_empty());
        assert!(!group.remove_child(&child_uuid));
    }

    #[test]
    fn test_group_entries() {
        let mut group = Group::new("Parent");
        let entry_uuid = Uuid::new_v4();

        group.add_entry(entry_uuid);
        assert!(group.entries.contains(&entry_uuid));
        assert!(group.remove_entry(&entry_uuid));
        assert!(group.entries.is_empty());
    }
}
