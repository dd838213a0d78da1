//! The in-memory database: an arena of groups and entries addressed by UUID

use crate::crypto::cipher::DataCipher;
use crate::crypto::kdf::{KdfParameters, DEFAULT_KDB_ROUNDS};
use crate::dirty::DirtyGroups;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::icons::ICON_RECYCLE_BIN;
use crate::key::Credentials;
use crate::meta::{DeletedObject, Meta};
use crate::protected::{MemoryMask, ProtectedString};
use crate::search::{self, SearchParameters};
use crate::times::now;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Root group name of KDB v3 databases, which have no stored root
pub const KDB_ROOT_NAME: &str = "KeePass Password Manager";
pub const RECYCLE_BIN_NAME: &str = "Recycle Bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdbxVersion {
    /// 3.1: AES-KDF, hashed blocks, Salsa20 inner stream
    Kdbx31,
    /// 4.0: KDF parameters, HMAC blocks, inner header
    Kdbx40,
}

/// File dialect of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseFormat {
    /// KeePass 1.x `.kdb`
    Kdb,
    /// KeePass 2.x `.kdbx`
    Kdbx(KdbxVersion),
}

impl DatabaseFormat {
    pub fn is_kdb(&self) -> bool {
        matches!(self, DatabaseFormat::Kdb)
    }

    pub fn is_kdbx(&self) -> bool {
        !self.is_kdb()
    }

    pub fn name(&self) -> &'static str {
        match self {
            DatabaseFormat::Kdb => "KDB 1.x",
            DatabaseFormat::Kdbx(KdbxVersion::Kdbx31) => "KDBX 3.1",
            DatabaseFormat::Kdbx(KdbxVersion::Kdbx40) => "KDBX 4.0",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

/// How the payload is protected on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoSettings {
    pub cipher: DataCipher,
    /// KDBX only
    pub compression: Compression,
    pub kdf: KdfParameters,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            cipher: DataCipher::Aes256,
            compression: Compression::Gzip,
            kdf: KdfParameters::default(),
        }
    }
}

/// Options for [`Database::create`]
#[derive(Debug, Clone)]
pub struct NewDatabase {
    pub name: String,
    pub format: DatabaseFormat,
    pub crypto: CryptoSettings,
    pub history_max_items: i32,
    pub history_max_size: i64,
}

impl Default for NewDatabase {
    fn default() -> Self {
        let meta = Meta::default();
        Self {
            name: "Database".to_string(),
            format: DatabaseFormat::Kdbx(KdbxVersion::Kdbx31),
            crypto: CryptoSettings::default(),
            history_max_items: meta.history_max_items,
            history_max_size: meta.history_max_size,
        }
    }
}

/// Metadata about the database (for display without walking the tree)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: String,
    pub description: String,
    pub format: DatabaseFormat,
    pub cipher: String,
    pub transform_rounds: u64,
    pub entry_count: usize,
    /// Groups stored in the file. The synthetic KDB root is not counted.
    pub group_count: usize,
}

/// A tree node for displaying the group hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTreeNode {
    pub uuid: Uuid,
    pub name: String,
    pub entry_count: usize,
    pub children: Vec<GroupTreeNode>,
}

/// Everything a loader produces before the database takes ownership
pub(crate) struct Tree {
    pub root: Uuid,
    pub groups: HashMap<Uuid, Group>,
    pub entries: HashMap<Uuid, Entry>,
    pub deleted_objects: Vec<DeletedObject>,
}

/// Copy of the mutable state, restored when a save fails
pub(crate) struct Checkpoint {
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
    deleted_objects: Vec<DeletedObject>,
    meta: Meta,
}

/// An unlocked database
#[derive(Debug)]
pub struct Database {
    format: DatabaseFormat,
    pub crypto: CryptoSettings,
    pub meta: Meta,
    credentials: Credentials,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
    root: Uuid,
    deleted_objects: Vec<DeletedObject>,
    /// Opaque KDBX 4 public custom data, written back unchanged
    pub(crate) public_custom_data: Option<Vec<u8>>,
    mask: Arc<MemoryMask>,
    dirty: DirtyGroups,
}

impl Database {
    /// Create a new empty KDBX database
    pub fn new(name: impl Into<String>, credentials: Credentials) -> Self {
        let mut db = Self::empty(
            DatabaseFormat::Kdbx(KdbxVersion::Kdbx31),
            CryptoSettings::default(),
            credentials,
        );
        let name = name.into();
        db.meta.set_name(name.clone());
        if let Some(root) = db.groups.get_mut(&db.root) {
            root.name = name;
        }
        db
    }

    /// Create a new KDB v3 database with the default groups
    pub fn new_kdb(credentials: Credentials) -> Self {
        let crypto = CryptoSettings {
            cipher: DataCipher::Aes256,
            compression: Compression::None,
            kdf: KdfParameters::aes(DEFAULT_KDB_ROUNDS),
        };
        let mut db = Self::empty(DatabaseFormat::Kdb, crypto, credentials);
        db.meta.recycle_bin_enabled = false;
        let root = db.root;
        for (kdb_id, (name, icon)) in (1..).zip([("Internet", 1), ("eMail", 19)]) {
            let mut group = Group::new(name);
            group.icon = crate::icons::IconRef::standard(icon);
            group.parent = Some(root);
            group.kdb_id = Some(kdb_id);
            let uuid = group.uuid;
            if let Some(parent) = db.groups.get_mut(&root) {
                parent.add_child(uuid);
            }
            db.groups.insert(uuid, group);
        }
        db
    }

    /// Create a new database from explicit settings
    pub fn create(options: NewDatabase, credentials: Credentials) -> Result<Self> {
        validate_crypto(options.format, &options.crypto)?;
        let mut db = match options.format {
            DatabaseFormat::Kdb => Self::new_kdb(credentials),
            DatabaseFormat::Kdbx(_) => Self::new(options.name, credentials),
        };
        db.format = options.format;
        db.crypto = options.crypto;
        db.meta.history_max_items = options.history_max_items;
        db.meta.history_max_size = options.history_max_size;
        Ok(db)
    }

    fn empty(format: DatabaseFormat, crypto: CryptoSettings, credentials: Credentials) -> Self {
        let root_name = match format {
            DatabaseFormat::Kdb => KDB_ROOT_NAME,
            DatabaseFormat::Kdbx(_) => "Root",
        };
        let root = Group::new(root_name);
        let root_uuid = root.uuid;
        let mut groups = HashMap::new();
        groups.insert(root_uuid, root);

        Self {
            format,
            crypto,
            meta: Meta::default(),
            credentials,
            groups,
            entries: HashMap::new(),
            root: root_uuid,
            deleted_objects: Vec::new(),
            public_custom_data: None,
            mask: MemoryMask::new(),
            dirty: DirtyGroups::new(),
        }
    }

    /// Take ownership of a freshly parsed tree
    pub(crate) fn assemble(
        format: DatabaseFormat,
        crypto: CryptoSettings,
        meta: Meta,
        credentials: Credentials,
        tree: Tree,
    ) -> Result<Self> {
        let mut db = Self {
            format,
            crypto,
            meta,
            credentials,
            groups: tree.groups,
            entries: tree.entries,
            root: tree.root,
            deleted_objects: tree.deleted_objects,
            public_custom_data: None,
            mask: MemoryMask::new(),
            dirty: DirtyGroups::new(),
        };
        let mask = Arc::clone(&db.mask);
        for entry in db.entries.values_mut() {
            entry.remask(&mask);
        }
        db.check_integrity()?;
        Ok(db)
    }

    pub fn format(&self) -> DatabaseFormat {
        self.format
    }

    /// Change the KDBX version written on the next save
    pub fn set_kdbx_version(&mut self, version: KdbxVersion) -> Result<()> {
        if self.format.is_kdb() {
            return Err(Error::InvalidGroup(
                "A KDB database cannot be saved as KDBX".to_string(),
            ));
        }
        validate_crypto(DatabaseFormat::Kdbx(version), &self.crypto)?;
        self.format = DatabaseFormat::Kdbx(version);
        Ok(())
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Replace the master key used by the next save
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
        self.meta.master_key_changed = now();
    }

    /// A field value, masked under this database's key when `protect` is set
    pub fn store_string(&self, value: &str, protect: bool) -> ProtectedString {
        if protect {
            self.mask.protect(value)
        } else {
            ProtectedString::plain(value)
        }
    }

    /// Get database metadata
    pub fn metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            name: self.name().to_string(),
            description: self.meta.description.clone(),
            format: self.format,
            cipher: self.crypto.cipher.name().to_string(),
            transform_rounds: self.crypto.kdf.rounds(),
            entry_count: self.visible_entries().count(),
            group_count: self.groups.len() - usize::from(self.format.is_kdb()),
        }
    }

    pub fn name(&self) -> &str {
        match self.format {
            DatabaseFormat::Kdb => KDB_ROOT_NAME,
            DatabaseFormat::Kdbx(_) => &self.meta.name,
        }
    }

    pub fn root_uuid(&self) -> Uuid {
        self.root
    }

    /// Get the root group
    pub fn root_group(&self) -> &Group {
        &self.groups[&self.root]
    }

    /// Get all groups
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Get a group by UUID
    pub fn get_group(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.get(uuid)
    }

    /// Get all entries, KDB meta-stream entries included
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Entries that hold user data
    pub fn visible_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(|e| !e.is_meta_stream())
    }

    /// Get an entry by UUID
    pub fn get_entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries.get(uuid)
    }

    /// Get a mutable entry by UUID. Structural fields must go through
    /// [`Database::move_entry`].
    pub fn get_entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        self.entries.get_mut(uuid)
    }

    /// Child groups of a group, in order
    pub fn child_groups(&self, group_uuid: &Uuid) -> Vec<&Group> {
        self.groups
            .get(group_uuid)
            .map(|group| {
                group
                    .children
                    .iter()
                    .filter_map(|uuid| self.groups.get(uuid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get entries in a specific group
    pub fn entries_in_group(&self, group_uuid: &Uuid) -> Vec<&Entry> {
        self.groups
            .get(group_uuid)
            .map(|group| {
                group
                    .entries
                    .iter()
                    .filter_map(|uuid| self.entries.get(uuid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The group holding a group or entry
    pub fn parent_of(&self, uuid: &Uuid) -> Option<&Group> {
        let parent = match self.groups.get(uuid) {
            Some(group) => group.parent,
            None => self.entries.get(uuid)?.parent_group,
        }?;
        self.groups.get(&parent)
    }

    /// Names of the groups from the top level down to `group_uuid`.
    ///
    /// The root is left out, so the root's path is empty.
    pub fn path_of(&self, group_uuid: &Uuid) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut current = *group_uuid;
        while current != self.root {
            if !seen.insert(current) {
                return Err(Error::InconsistentTree(format!(
                    "Group {} is part of a cycle",
                    current
                )));
            }
            let group = self
                .groups
                .get(&current)
                .ok_or(Error::GroupNotFound(current))?;
            names.push(group.name.clone());
            current = group.parent.ok_or_else(|| {
                Error::InconsistentTree(format!("Group {} is detached", group.uuid))
            })?;
        }
        names.reverse();
        Ok(names)
    }

    /// Resolve a `/`-separated path of group names below the root
    pub fn find_group_by_path(&self, path: &str) -> Option<Uuid> {
        let mut current = self.root;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            current = *self.groups.get(&current)?.children.iter().find(|child| {
                self.groups
                    .get(*child)
                    .map_or(false, |g| g.name == name)
            })?;
        }
        Some(current)
    }

    /// Get the group tree structure (for sidebar display)
    pub fn group_tree(&self) -> GroupTreeNode {
        self.build_group_tree(self.root_group())
    }

    fn build_group_tree(&self, group: &Group) -> GroupTreeNode {
        GroupTreeNode {
            uuid: group.uuid,
            name: group.name.clone(),
            entry_count: group
                .entries
                .iter()
                .filter(|uuid| self.entries.get(*uuid).map_or(false, |e| !e.is_meta_stream()))
                .count(),
            children: group
                .children
                .iter()
                .filter_map(|child_uuid| self.groups.get(child_uuid))
                .map(|child| self.build_group_tree(child))
                .collect(),
        }
    }

    /// Groups in pre-order, root first
    pub fn groups_preorder(&self) -> Vec<&Group> {
        let mut out = Vec::with_capacity(self.groups.len());
        let mut stack = vec![self.root];
        while let Some(uuid) = stack.pop() {
            if let Some(group) = self.groups.get(&uuid) {
                out.push(group);
                stack.extend(group.children.iter().rev());
            }
        }
        out
    }

    /// Whether `uuid` is `ancestor` or lies below it
    pub fn is_in_group(&self, uuid: &Uuid, ancestor: &Uuid) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(*uuid);
        while let Some(id) = current {
            if id == *ancestor {
                return true;
            }
            if !seen.insert(id) {
                return false;
            }
            current = match self.groups.get(&id) {
                Some(group) => group.parent,
                None => self.entries.get(&id).and_then(|e| e.parent_group),
            };
        }
        false
    }

    /// Add a group to the database
    pub fn add_group(&mut self, mut group: Group) -> Result<Uuid> {
        let group_uuid = group.uuid;
        if self.groups.contains_key(&group_uuid) {
            return Err(Error::InvalidGroup(format!(
                "Group {} already exists",
                group_uuid
            )));
        }

        // Set parent group to root if not specified
        let parent_uuid = group.parent.unwrap_or(self.root);
        if !self.groups.contains_key(&parent_uuid) {
            return Err(Error::GroupNotFound(parent_uuid));
        }
        group.parent = Some(parent_uuid);
        group.children.clear();
        group.entries.clear();
        if self.format.is_kdb() && group.kdb_id.is_none() {
            group.kdb_id = Some(self.next_kdb_group_id());
        }

        if let Some(parent) = self.groups.get_mut(&parent_uuid) {
            parent.add_child(group_uuid);
        }
        self.groups.insert(group_uuid, group);
        self.mark_dirty(parent_uuid);
        debug!("Added group {}", group_uuid);
        Ok(group_uuid)
    }

    fn next_kdb_group_id(&self) -> u32 {
        self.groups
            .values()
            .filter_map(|g| g.kdb_id)
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    /// Replace the editable fields of a group, keeping its place in the tree
    pub fn update_group(&mut self, uuid: &Uuid, mut group: Group) -> Result<Group> {
        let old = self.groups.get(uuid).ok_or(Error::GroupNotFound(*uuid))?;
        group.uuid = *uuid;
        group.parent = old.parent;
        group.children = old.children.clone();
        group.entries = old.entries.clone();
        if group.kdb_id.is_none() {
            group.kdb_id = old.kdb_id;
        }
        group.mark_modified();
        let old = self
            .groups
            .insert(*uuid, group)
            .ok_or(Error::GroupNotFound(*uuid))?;
        self.mark_dirty(*uuid);
        Ok(old)
    }

    /// Move a group under a new parent
    pub fn move_group(&mut self, uuid: &Uuid, new_parent: &Uuid) -> Result<()> {
        if *uuid == self.root {
            return Err(Error::InvalidGroup("Cannot move the root group".to_string()));
        }
        if !self.groups.contains_key(new_parent) {
            return Err(Error::GroupNotFound(*new_parent));
        }
        if self.is_in_group(new_parent, uuid) {
            return Err(Error::InvalidGroup(
                "Cannot move a group into itself or one of its subgroups".to_string(),
            ));
        }
        let group = self.groups.get_mut(uuid).ok_or(Error::GroupNotFound(*uuid))?;
        let old_parent = group.parent.replace(*new_parent);
        group.times.location_changed = now();

        if let Some(old_parent) = old_parent {
            if let Some(parent) = self.groups.get_mut(&old_parent) {
                parent.remove_child(uuid);
            }
            self.mark_dirty(old_parent);
        }
        if let Some(parent) = self.groups.get_mut(new_parent) {
            parent.add_child(*uuid);
        }
        self.mark_dirty(*uuid);
        Ok(())
    }

    /// Delete a group permanently, with everything below it
    pub fn delete_group(&mut self, uuid: &Uuid) -> Result<()> {
        if *uuid == self.root {
            return Err(Error::InvalidGroup("Cannot delete root group".to_string()));
        }
        let group = self.groups.get(uuid).ok_or(Error::GroupNotFound(*uuid))?;
        let parent_uuid = group.parent;

        if let Some(parent_uuid) = parent_uuid {
            if let Some(parent) = self.groups.get_mut(&parent_uuid) {
                parent.remove_child(uuid);
            }
            self.mark_dirty(parent_uuid);
        }
        self.remove_subtree(uuid);
        if self.meta.recycle_bin_uuid == *uuid {
            self.meta.recycle_bin_uuid = Uuid::nil();
            self.meta.recycle_bin_changed = now();
        }
        Ok(())
    }

    fn remove_subtree(&mut self, uuid: &Uuid) {
        let Some(group) = self.groups.remove(uuid) else {
            return;
        };
        let deletion_time = now();
        for entry_uuid in &group.entries {
            if self.entries.remove(entry_uuid).is_some() {
                self.record_deletion(*entry_uuid, deletion_time);
            }
        }
        for child_uuid in &group.children {
            self.remove_subtree(child_uuid);
        }
        self.record_deletion(*uuid, deletion_time);
        self.dirty.clear_dirty(uuid);
    }

    fn record_deletion(&mut self, uuid: Uuid, deletion_time: chrono::DateTime<chrono::Utc>) {
        if self.format.is_kdbx() {
            self.deleted_objects.push(DeletedObject {
                uuid,
                deletion_time,
            });
        }
    }

    pub fn deleted_objects(&self) -> &[DeletedObject] {
        &self.deleted_objects
    }

    /// Add an entry to the database
    pub fn add_entry(&mut self, mut entry: Entry) -> Result<Uuid> {
        let entry_uuid = entry.uuid;
        if self.entries.contains_key(&entry_uuid) {
            return Err(Error::InvalidEntry(format!(
                "Entry {} already exists",
                entry_uuid
            )));
        }

        // Set parent group to root if not specified
        let parent_uuid = entry.parent_group.unwrap_or(self.root);
        if !self.groups.contains_key(&parent_uuid) {
            return Err(Error::GroupNotFound(parent_uuid));
        }
        if self.format.is_kdb() {
            if parent_uuid == self.root {
                return Err(Error::InvalidEntry(
                    "KDB entries must belong to a group below the root".to_string(),
                ));
            }
            if entry.binaries.len() > 1 {
                return Err(Error::InvalidEntry(
                    "KDB entries hold at most one attachment".to_string(),
                ));
            }
            entry.history.clear();
        }
        entry.parent_group = Some(parent_uuid);
        entry.remask(&self.mask);

        if let Some(group) = self.groups.get_mut(&parent_uuid) {
            group.add_entry(entry_uuid);
        }
        self.entries.insert(entry_uuid, entry);
        self.mark_dirty(parent_uuid);
        Ok(entry_uuid)
    }

    /// Replace an entry, keeping the previous version in its history (KDBX).
    ///
    /// Returns the previous version.
    pub fn update_entry(&mut self, uuid: &Uuid, mut entry: Entry) -> Result<Entry> {
        let old = self.entries.get(uuid).ok_or(Error::EntryNotFound(*uuid))?;
        if self.format.is_kdb() && entry.binaries.len() > 1 {
            return Err(Error::InvalidEntry(
                "KDB entries hold at most one attachment".to_string(),
            ));
        }
        entry.uuid = *uuid;
        entry.parent_group = old.parent_group;
        if self.format.is_kdbx() {
            let mut history = old.history.clone();
            history.push(old.snapshot());
            entry.history = history;
            entry.maintain_backups(self.meta.history_max_items, self.meta.history_max_size);
        } else {
            entry.history.clear();
        }
        entry.mark_modified();
        entry.remask(&self.mask);

        let parent = entry.parent_group;
        let old = self
            .entries
            .insert(*uuid, entry)
            .ok_or(Error::EntryNotFound(*uuid))?;
        if let Some(parent) = parent {
            self.mark_dirty(parent);
        }
        Ok(old)
    }

    /// Move an entry into another group
    pub fn move_entry(&mut self, uuid: &Uuid, new_group: &Uuid) -> Result<()> {
        if !self.groups.contains_key(new_group) {
            return Err(Error::GroupNotFound(*new_group));
        }
        if self.format.is_kdb() && *new_group == self.root {
            return Err(Error::InvalidEntry(
                "KDB entries must belong to a group below the root".to_string(),
            ));
        }
        let entry = self.entries.get_mut(uuid).ok_or(Error::EntryNotFound(*uuid))?;
        let old_group = entry.parent_group.replace(*new_group);
        entry.times.location_changed = now();

        if let Some(old_group) = old_group {
            if let Some(group) = self.groups.get_mut(&old_group) {
                group.remove_entry(uuid);
            }
            self.mark_dirty(old_group);
        }
        if let Some(group) = self.groups.get_mut(new_group) {
            group.add_entry(*uuid);
        }
        self.mark_dirty(*new_group);
        Ok(())
    }

    /// Delete an entry permanently
    pub fn delete_entry(&mut self, uuid: &Uuid) -> Result<Entry> {
        let entry = self
            .entries
            .remove(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;

        // Remove from parent group
        if let Some(parent_uuid) = entry.parent_group {
            if let Some(group) = self.groups.get_mut(&parent_uuid) {
                group.remove_entry(uuid);
            }
            self.mark_dirty(parent_uuid);
        }
        self.record_deletion(*uuid, now());

        Ok(entry)
    }

    /// The recycle bin, created on first use. `None` when disabled or KDB.
    pub fn ensure_recycle_bin(&mut self) -> Option<Uuid> {
        if self.format.is_kdb() || !self.meta.recycle_bin_enabled {
            return None;
        }
        if let Some(bin) = self.meta.recycle_bin() {
            if self.groups.contains_key(&bin) {
                return Some(bin);
            }
        }
        let mut bin = Group::new(RECYCLE_BIN_NAME);
        bin.icon = crate::icons::IconRef::standard(ICON_RECYCLE_BIN);
        bin.enable_searching = Some(false);
        bin.enable_auto_type = Some(false);
        bin.expanded = false;
        let uuid = self.add_group(bin).ok()?;
        self.meta.recycle_bin_uuid = uuid;
        self.meta.recycle_bin_changed = now();
        Some(uuid)
    }

    /// Move an entry to the recycle bin, or delete it when that is not possible.
    ///
    /// Returns true when the entry was recycled.
    pub fn recycle_entry(&mut self, uuid: &Uuid) -> Result<bool> {
        if !self.entries.contains_key(uuid) {
            return Err(Error::EntryNotFound(*uuid));
        }
        match self.recycle_target(uuid) {
            Some(bin) => {
                self.move_entry(uuid, &bin)?;
                Ok(true)
            }
            None => {
                self.delete_entry(uuid)?;
                Ok(false)
            }
        }
    }

    /// Move a group to the recycle bin, or delete it when that is not possible
    pub fn recycle_group(&mut self, uuid: &Uuid) -> Result<bool> {
        if !self.groups.contains_key(uuid) {
            return Err(Error::GroupNotFound(*uuid));
        }
        if self.meta.recycle_bin() == Some(*uuid) {
            self.delete_group(uuid)?;
            return Ok(false);
        }
        match self.recycle_target(uuid) {
            Some(bin) => {
                self.move_group(uuid, &bin)?;
                Ok(true)
            }
            None => {
                self.delete_group(uuid)?;
                Ok(false)
            }
        }
    }

    fn recycle_target(&mut self, uuid: &Uuid) -> Option<Uuid> {
        let bin = self.ensure_recycle_bin()?;
        if self.is_in_group(uuid, &bin) {
            None
        } else {
            Some(bin)
        }
    }

    /// Search entries, see [`SearchParameters`]
    pub fn search(&self, query: &str, params: &SearchParameters) -> Vec<&Entry> {
        search::search(self, query, params)
    }

    /// Verify the tree invariants: one root, agreeing parent and child lists,
    /// no cycles, every node reachable
    pub fn check_integrity(&self) -> Result<()> {
        let root = self
            .groups
            .get(&self.root)
            .ok_or_else(|| Error::InconsistentTree("Root group is missing".to_string()))?;
        if root.parent.is_some() {
            return Err(Error::InconsistentTree("Root group has a parent".to_string()));
        }

        let mut seen_groups = HashSet::new();
        let mut seen_entries = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(uuid) = stack.pop() {
            if !seen_groups.insert(uuid) {
                return Err(Error::InconsistentTree(format!(
                    "Group {} is reachable twice",
                    uuid
                )));
            }
            let group = self
                .groups
                .get(&uuid)
                .ok_or_else(|| Error::InconsistentTree(format!("Missing group {}", uuid)))?;
            for child_uuid in &group.children {
                let child = self.groups.get(child_uuid).ok_or_else(|| {
                    Error::InconsistentTree(format!("Missing group {}", child_uuid))
                })?;
                if child.parent != Some(uuid) {
                    return Err(Error::InconsistentTree(format!(
                        "Group {} is listed under {} but points elsewhere",
                        child_uuid, uuid
                    )));
                }
                stack.push(*child_uuid);
            }
            for entry_uuid in &group.entries {
                let entry = self.entries.get(entry_uuid).ok_or_else(|| {
                    Error::InconsistentTree(format!("Missing entry {}", entry_uuid))
                })?;
                if entry.parent_group != Some(uuid) || !seen_entries.insert(*entry_uuid) {
                    return Err(Error::InconsistentTree(format!(
                        "Entry {} has conflicting parents",
                        entry_uuid
                    )));
                }
            }
        }

        if seen_groups.len() != self.groups.len() {
            return Err(Error::InconsistentTree(format!(
                "{} groups are unreachable from the root",
                self.groups.len() - seen_groups.len()
            )));
        }
        if seen_entries.len() != self.entries.len() {
            return Err(Error::InconsistentTree(format!(
                "{} entries are unreachable from the root",
                self.entries.len() - seen_entries.len()
            )));
        }
        Ok(())
    }

    /// Mark a group and its ancestors as needing a refresh
    pub fn mark_dirty(&mut self, group: Uuid) {
        self.dirty.mark_dirty(group, &self.groups);
    }

    pub fn is_dirty(&self, group: &Uuid) -> bool {
        self.dirty.is_dirty(group)
    }

    pub fn clear_dirty(&mut self, group: &Uuid) -> bool {
        self.dirty.clear_dirty(group)
    }

    /// Take the set of groups changed since the last call
    pub fn drain_dirty(&mut self) -> Vec<Uuid> {
        self.dirty.drain()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            groups: self.groups.clone(),
            entries: self.entries.clone(),
            deleted_objects: self.deleted_objects.clone(),
            meta: self.meta.clone(),
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        self.groups = checkpoint.groups;
        self.entries = checkpoint.entries;
        self.deleted_objects = checkpoint.deleted_objects;
        self.meta = checkpoint.meta;
    }

    /// Lock the database. Protected values are wiped as they drop.
    pub fn close(self) {
        debug!("Closing database with {} entries", self.entries.len());
    }
}

fn validate_crypto(format: DatabaseFormat, crypto: &CryptoSettings) -> Result<()> {
    let kdbx4 = format == DatabaseFormat::Kdbx(KdbxVersion::Kdbx40);
    if crypto.cipher == DataCipher::ChaCha20 && !kdbx4 {
        return Err(Error::UnsupportedCipher(format!(
            "ChaCha20 cannot be used with {}",
            format.name()
        )));
    }
    if !kdbx4 && !matches!(crypto.kdf, KdfParameters::Aes { .. }) {
        return Err(Error::UnsupportedKdf(format!(
            "Argon2 cannot be used with {}",
            format.name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBuilder;
    use crate::group::GroupBuilder;

    fn test_db() -> Database {
        Database::new("Test DB", Credentials::from_password("secret"))
    }

    #[test]
    fn test_database_creation() {
        let db = test_db();
        assert_eq!(db.name(), "Test DB");
        assert_eq!(db.root_group().name, "Test DB");
        assert!(db.entries().count() == 0);
        assert!(db.groups().count() == 1); // Root group
        assert_eq!(db.format(), DatabaseFormat::Kdbx(KdbxVersion::Kdbx31));
        db.check_integrity().unwrap();
    }

    #[test]
    fn test_new_kdb_defaults() {
        let mut db = Database::new_kdb(Credentials::from_password("secret"));
        assert_eq!(db.name(), KDB_ROOT_NAME);
        assert_eq!(db.crypto.kdf.rounds(), 300);
        let names: Vec<_> = db
            .child_groups(&db.root_uuid())
            .iter()
            .map(|g| (g.name.clone(), g.icon.standard, g.kdb_id))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Internet".to_string(), 1, Some(1)),
                ("eMail".to_string(), 19, Some(2))
            ]
        );
        assert!(db.drain_dirty().is_empty());
        db.check_integrity().unwrap();
        assert_eq!(db.metadata().group_count, 2);
    }

    #[test]
    fn test_store_string_under_database_mask() {
        let mut db = test_db();
        let mut entry = Entry::new("Bank");
        entry.set_field("PIN", db.store_string("4321", true));
        entry.set_field("Branch", db.store_string("Main St", false));
        let uuid = db.add_entry(entry).unwrap();

        let stored = db.get_entry(&uuid).unwrap();
        assert!(stored.custom_fields["PIN"].is_protected());
        assert_eq!(stored.custom_fields["PIN"].reveal().as_str(), "4321");
        assert!(!stored.custom_fields["Branch"].is_protected());
    }

    #[test]
    fn test_metadata_counts_kdbx_root() {
        let mut db = test_db();
        db.add_group(GroupBuilder::new("Work").build()).unwrap();
        assert_eq!(db.metadata().group_count, 2);
    }

    #[test]
    fn test_add_entry() {
        let mut db = test_db();
        let entry = Entry::new("GitHub");
        let uuid = db.add_entry(entry).unwrap();

        assert!(db.get_entry(&uuid).is_some());
        assert_eq!(db.entries().count(), 1);
        assert_eq!(db.entries_in_group(&db.root_uuid()).len(), 1);
        assert!(db.is_dirty(&db.root_uuid()));
    }

    #[test]
    fn test_kdb_entry_needs_group() {
        let mut db = Database::new_kdb(Credentials::from_password("secret"));
        assert!(matches!(
            db.add_entry(Entry::new("x")),
            Err(Error::InvalidEntry(_))
        ));
    }

    #[test]
    fn test_delete_entry_records_deleted_object() {
        let mut db = test_db();
        let uuid = db.add_entry(Entry::new("GitHub")).unwrap();

        let deleted = db.delete_entry(&uuid);
        assert!(deleted.is_ok());
        assert!(db.get_entry(&uuid).is_none());
        assert_eq!(db.deleted_objects().len(), 1);
        assert_eq!(db.deleted_objects()[0].uuid, uuid);
        db.check_integrity().unwrap();
    }

    #[test]
    fn test_add_group() {
        let mut db = test_db();
        let group = Group::new("Work");
        let uuid = db.add_group(group).unwrap();

        assert!(db.get_group(&uuid).is_some());
        assert_eq!(db.groups().count(), 2); // Root + Work
        assert_eq!(db.path_of(&uuid).unwrap(), vec!["Work"]);
        assert_eq!(db.find_group_by_path("/Work"), Some(uuid));
    }

    #[test]
    fn test_update_entry_keeps_history() {
        let mut db = test_db();
        db.meta.history_max_items = 10;
        let uuid = db.add_entry(Entry::new("v0")).unwrap();
        for i in 1..=20 {
            let mut edited = db.get_entry(&uuid).unwrap().clone();
            edited.title = ProtectedString::plain(&format!("v{}", i));
            db.update_entry(&uuid, edited).unwrap();
        }
        let entry = db.get_entry(&uuid).unwrap();
        assert_eq!(entry.title.reveal().as_str(), "v20");
        assert_eq!(entry.history.len(), 10);
        assert_eq!(entry.history[0].title.reveal().as_str(), "v10");
        assert_eq!(entry.history[9].title.reveal().as_str(), "v19");
    }

    #[test]
    fn test_move_group_rejects_cycle() {
        let mut db = test_db();
        let a = db.add_group(Group::new("A")).unwrap();
        let b = db
            .add_group(GroupBuilder::new("B").parent(a).build())
            .unwrap();

        assert!(matches!(db.move_group(&a, &b), Err(Error::InvalidGroup(_))));
        assert!(matches!(db.move_group(&a, &a), Err(Error::InvalidGroup(_))));

        let c = db.add_group(Group::new("C")).unwrap();
        db.move_group(&b, &c).unwrap();
        assert_eq!(db.parent_of(&b).map(|g| g.uuid), Some(c));
        db.check_integrity().unwrap();
    }

    #[test]
    fn test_delete_group_is_recursive() {
        let mut db = test_db();
        let a = db.add_group(Group::new("A")).unwrap();
        let b = db
            .add_group(GroupBuilder::new("B").parent(a).build())
            .unwrap();
        let e = db
            .add_entry(EntryBuilder::new("inside").parent_group(b).build())
            .unwrap();

        db.delete_group(&a).unwrap();
        assert!(db.get_group(&b).is_none());
        assert!(db.get_entry(&e).is_none());
        assert_eq!(db.deleted_objects().len(), 3);
        db.check_integrity().unwrap();
    }

    #[test]
    fn test_recycle_then_delete() {
        let mut db = test_db();
        let uuid = db.add_entry(Entry::new("old")).unwrap();

        assert!(db.recycle_entry(&uuid).unwrap());
        let bin = db.meta.recycle_bin().unwrap();
        let bin_group = db.get_group(&bin).unwrap();
        assert_eq!(bin_group.name, RECYCLE_BIN_NAME);
        assert_eq!(bin_group.icon.standard, ICON_RECYCLE_BIN);
        assert_eq!(bin_group.enable_searching, Some(false));
        assert_eq!(db.parent_of(&uuid).map(|g| g.uuid), Some(bin));

        // a second delete from inside the bin is permanent
        assert!(!db.recycle_entry(&uuid).unwrap());
        assert!(db.get_entry(&uuid).is_none());
    }

    #[test]
    fn test_group_tree() {
        let mut db = test_db();
        let work = db.add_group(Group::new("Work")).unwrap();
        db.add_entry(EntryBuilder::new("a").parent_group(work).build())
            .unwrap();
        let tree = db.group_tree();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].entry_count, 1);
        assert_eq!(db.metadata().entry_count, 1);
    }

    #[test]
    fn test_chacha_requires_kdbx4() {
        let options = NewDatabase {
            crypto: CryptoSettings {
                cipher: DataCipher::ChaCha20,
                ..CryptoSettings::default()
            },
            ..NewDatabase::default()
        };
        assert!(matches!(
            Database::create(options, Credentials::from_password("x")),
            Err(Error::UnsupportedCipher(_))
        ));
    }
}
