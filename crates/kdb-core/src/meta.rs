//! Database-wide settings stored in the KDBX `<Meta>` element

use crate::entry::{NOTES, PASSWORD, TITLE, URL, USERNAME};
use crate::icons::IconPool;
use crate::times::now;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;
pub const DEFAULT_MAINTENANCE_HISTORY_DAYS: u32 = 365;
pub const GENERATOR: &str = "kdb-core";

/// Which standard fields are written with `Protected="True"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProtection {
    pub title: bool,
    pub username: bool,
    pub password: bool,
    pub url: bool,
    pub notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            title: false,
            username: false,
            password: true,
            url: false,
            notes: false,
        }
    }
}

impl MemoryProtection {
    /// The flag for a standard field, `None` for custom fields
    pub fn for_field(&self, key: &str) -> Option<bool> {
        match key {
            TITLE => Some(self.title),
            USERNAME => Some(self.username),
            PASSWORD => Some(self.password),
            URL => Some(self.url),
            NOTES => Some(self.notes),
            _ => None,
        }
    }
}

/// A node removed permanently, kept so that synchronizing clients do not
/// resurrect it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

/// Database metadata. KDB v3 files only carry the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub generator: String,
    pub name: String,
    pub name_changed: DateTime<Utc>,
    pub description: String,
    pub description_changed: DateTime<Utc>,
    pub default_username: String,
    pub default_username_changed: DateTime<Utc>,
    pub maintenance_history_days: u32,
    pub color: String,
    pub master_key_changed: DateTime<Utc>,
    /// Days before a key change is recommended, -1 for never
    pub master_key_change_rec: i64,
    /// Days before a key change is forced, -1 for never
    pub master_key_change_force: i64,
    pub memory_protection: MemoryProtection,
    pub custom_icons: IconPool,
    pub recycle_bin_enabled: bool,
    /// Nil when no recycle bin exists yet
    pub recycle_bin_uuid: Uuid,
    pub recycle_bin_changed: DateTime<Utc>,
    pub entry_templates_group: Uuid,
    pub entry_templates_group_changed: DateTime<Utc>,
    /// Negative means unlimited
    pub history_max_items: i32,
    /// Bytes, negative means unlimited
    pub history_max_size: i64,
    pub last_selected_group: Uuid,
    pub last_top_visible_group: Uuid,
    pub custom_data: BTreeMap<String, String>,
}

impl Default for Meta {
    fn default() -> Self {
        let now = now();
        Self {
            generator: GENERATOR.to_string(),
            name: String::new(),
            name_changed: now,
            description: String::new(),
            description_changed: now,
            default_username: String::new(),
            default_username_changed: now,
            maintenance_history_days: DEFAULT_MAINTENANCE_HISTORY_DAYS,
            color: String::new(),
            master_key_changed: now,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            memory_protection: MemoryProtection::default(),
            custom_icons: IconPool::new(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: Uuid::nil(),
            recycle_bin_changed: now,
            entry_templates_group: Uuid::nil(),
            entry_templates_group_changed: now,
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            last_selected_group: Uuid::nil(),
            last_top_visible_group: Uuid::nil(),
            custom_data: BTreeMap::new(),
        }
    }
}

impl Meta {
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.name_changed = now();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.description_changed = now();
    }

    pub fn set_default_username(&mut self, username: impl Into<String>) {
        self.default_username = username.into();
        self.default_username_changed = now();
    }

    pub fn recycle_bin(&self) -> Option<Uuid> {
        if self.recycle_bin_enabled && !self.recycle_bin_uuid.is_nil() {
            Some(self.recycle_bin_uuid)
        } else {
            None
        }
    }
}
