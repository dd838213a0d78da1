//! Standard and custom icons

use uuid::Uuid;

/// Number of built-in icons shared by all KeePass clients
pub const STANDARD_ICON_COUNT: u32 = 69;

pub const ICON_KEY: u32 = 0;
pub const ICON_FOLDER: u32 = 48;
pub const ICON_RECYCLE_BIN: u32 = 43;

/// Icon of a group or entry: a standard id, optionally overridden by a custom icon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IconRef {
    pub standard: u32,
    pub custom: Option<Uuid>,
}

impl IconRef {
    pub fn standard(id: u32) -> Self {
        Self {
            standard: if id < STANDARD_ICON_COUNT { id } else { ICON_KEY },
            custom: None,
        }
    }
}

/// An image stored in the database metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    /// PNG data
    pub data: Vec<u8>,
}

/// The custom icons of a database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IconPool {
    icons: Vec<CustomIcon>,
}

impl IconPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomIcon> {
        self.icons.iter()
    }

    pub fn len(&self) -> usize {
        self.icons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.icons.is_empty()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&CustomIcon> {
        self.icons.iter().find(|icon| &icon.uuid == uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.get(uuid).is_some()
    }

    /// Add an icon, replacing any icon with the same UUID
    pub fn add(&mut self, icon: CustomIcon) {
        match self.icons.iter_mut().find(|i| i.uuid == icon.uuid) {
            Some(existing) => *existing = icon,
            None => self.icons.push(icon),
        }
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<CustomIcon> {
        let pos = self.icons.iter().position(|i| &i.uuid == uuid)?;
        Some(self.icons.remove(pos))
    }

    /// Drop a dangling custom reference, keeping the standard fallback
    pub fn resolve(&self, icon: &mut IconRef) -> bool {
        match icon.custom {
            Some(uuid) if !self.contains(&uuid) => {
                icon.custom = None;
                false
            }
            _ => true,
        }
    }
}
