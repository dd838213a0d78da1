//! Entry types and operations

use crate::icons::IconRef;
use crate::protected::{MemoryMask, ProtectedBinary, ProtectedString};
use crate::times::Times;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub const TITLE: &str = "Title";
pub const USERNAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

/// Field names with a dedicated slot on [`Entry`], in serialization order
pub const STANDARD_FIELDS: [&str; 5] = [TITLE, USERNAME, PASSWORD, URL, NOTES];

/// Approximate size of the fixed part of an entry, used for history limits
const FIXED_LENGTH_SIZE: u64 = 128;

// KDB v3 meta-stream markers
const META_STREAM_TITLE: &str = "Meta-Info";
const META_STREAM_USER: &str = "SYSTEM";
const META_STREAM_URL: &str = "$";
const META_STREAM_BINARY_DESC: &str = "bin-stream";

/// Auto-type settings of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoType {
    pub enabled: bool,
    pub obfuscation: u32,
    pub default_sequence: String,
    /// (window title, keystroke sequence)
    pub associations: Vec<(String, String)>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
        }
    }
}

/// A password entry
#[derive(Debug, Clone)]
pub struct Entry {
    /// Unique identifier for this entry
    pub uuid: Uuid,
    /// UUID of the parent group
    pub parent_group: Option<Uuid>,
    pub title: ProtectedString,
    pub username: ProtectedString,
    pub password: ProtectedString,
    pub url: ProtectedString,
    pub notes: ProtectedString,
    /// Custom string fields (KDBX only)
    pub custom_fields: BTreeMap<String, ProtectedString>,
    /// Attachments by name. KDB v3 entries carry at most one.
    pub binaries: BTreeMap<String, ProtectedBinary>,
    pub icon: IconRef,
    pub times: Times,
    pub tags: Vec<String>,
    pub foreground_color: String,
    pub background_color: String,
    pub override_url: String,
    pub auto_type: AutoType,
    /// Previous versions of this entry, oldest first (KDBX only)
    pub history: Vec<Entry>,
}

impl Entry {
    /// Create a new entry with the given title
    pub fn new(title: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            parent_group: None,
            title: ProtectedString::plain(title),
            username: ProtectedString::empty(),
            password: ProtectedString::protected(""),
            url: ProtectedString::empty(),
            notes: ProtectedString::empty(),
            custom_fields: BTreeMap::new(),
            binaries: BTreeMap::new(),
            icon: IconRef::default(),
            times: Times::new(),
            tags: Vec::new(),
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            auto_type: AutoType::default(),
            history: Vec::new(),
        }
    }

    /// A field by its KDBX key, standard or custom
    pub fn field(&self, key: &str) -> Option<&ProtectedString> {
        match key {
            TITLE => Some(&self.title),
            USERNAME => Some(&self.username),
            PASSWORD => Some(&self.password),
            URL => Some(&self.url),
            NOTES => Some(&self.notes),
            _ => self.custom_fields.get(key),
        }
    }

    /// Set a field by its KDBX key, creating a custom field if needed
    pub fn set_field(&mut self, key: &str, value: ProtectedString) {
        match key {
            TITLE => self.title = value,
            USERNAME => self.username = value,
            PASSWORD => self.password = value,
            URL => self.url = value,
            NOTES => self.notes = value,
            _ => {
                self.custom_fields.insert(key.to_string(), value);
            }
        }
    }

    pub fn remove_custom_field(&mut self, key: &str) -> Option<ProtectedString> {
        self.custom_fields.remove(key)
    }

    /// Every string field in serialization order: standard fields first
    pub fn fields(&self) -> impl Iterator<Item = (&str, &ProtectedString)> {
        [
            (TITLE, &self.title),
            (USERNAME, &self.username),
            (PASSWORD, &self.password),
            (URL, &self.url),
            (NOTES, &self.notes),
        ]
        .into_iter()
        .chain(self.custom_fields.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Set the password, keeping its protection flag
    pub fn set_password(&mut self, password: &str) {
        let protect = self.password.is_protected() || self.password.is_empty();
        self.password = ProtectedString::new(password, protect);
        self.times.mark_modified();
    }

    /// Clear the password from memory
    pub fn clear_password(&mut self) {
        self.password = ProtectedString::protected("");
    }

    pub fn is_expired(&self) -> bool {
        self.times.is_expired()
    }

    /// Update the accessed timestamp
    pub fn touch(&mut self) {
        self.times.touch();
    }

    /// Mark as modified
    pub fn mark_modified(&mut self) {
        self.times.mark_modified();
    }

    /// KDB v3 entries that store client settings rather than user data
    pub fn is_meta_stream(&self) -> bool {
        let Some((desc, data)) = self.binaries.iter().next() else {
            return false;
        };
        !data.is_empty()
            && desc == META_STREAM_BINARY_DESC
            && !self.notes.is_empty()
            && self.title.reveal().as_str() == META_STREAM_TITLE
            && self.username.reveal().as_str() == META_STREAM_USER
            && self.url.reveal().as_str() == META_STREAM_URL
            && self.icon.standard == 0
    }

    /// Deep copy of this entry with its history left out
    pub fn snapshot(&self) -> Entry {
        Entry {
            uuid: self.uuid,
            parent_group: self.parent_group,
            title: self.title.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            url: self.url.clone(),
            notes: self.notes.clone(),
            custom_fields: self.custom_fields.clone(),
            binaries: self.binaries.clone(),
            icon: self.icon,
            times: self.times.clone(),
            tags: self.tags.clone(),
            foreground_color: self.foreground_color.clone(),
            background_color: self.background_color.clone(),
            override_url: self.override_url.clone(),
            auto_type: self.auto_type.clone(),
            history: Vec::new(),
        }
    }

    /// Push a snapshot of `previous` onto this entry's history
    pub fn create_backup(&mut self, previous: &Entry) {
        self.history.push(previous.snapshot());
    }

    /// Trim history to `max_items` snapshots and `max_size` bytes.
    ///
    /// Negative limits mean unlimited. Returns whether anything was dropped.
    pub fn maintain_backups(&mut self, max_items: i32, max_size: i64) -> bool {
        let mut deleted = false;

        if max_items >= 0 {
            while self.history.len() > max_items as usize {
                self.remove_oldest_backup();
                deleted = true;
            }
        }

        if max_size >= 0 {
            loop {
                let history_size: u64 = self.history.iter().map(Entry::size).sum();
                if history_size > max_size as u64 && !self.history.is_empty() {
                    self.remove_oldest_backup();
                    deleted = true;
                } else {
                    break;
                }
            }
        }

        deleted
    }

    fn remove_oldest_backup(&mut self) {
        let mut oldest: Option<(usize, DateTime<Utc>)> = None;
        for (i, entry) in self.history.iter().enumerate() {
            let modified = entry.times.modified;
            if oldest.map_or(true, |(_, min)| modified < min) {
                oldest = Some((i, modified));
            }
        }
        if let Some((index, _)) = oldest {
            self.history.remove(index);
        }
    }

    /// Approximate serialized size, used by the history size limit
    pub fn size(&self) -> u64 {
        let mut size = FIXED_LENGTH_SIZE;
        for (key, value) in self.fields() {
            size += key.len() as u64 + value.len() as u64;
        }
        for (key, value) in &self.binaries {
            size += key.len() as u64 + value.len() as u64;
        }
        size += self.auto_type.default_sequence.len() as u64;
        for (window, sequence) in &self.auto_type.associations {
            size += window.len() as u64 + sequence.len() as u64;
        }
        size += self.history.iter().map(Entry::size).sum::<u64>();
        size += self.override_url.len() as u64;
        size += self.tags.iter().map(|t| t.len() as u64).sum::<u64>();
        size
    }

    /// Move every protected value, history included, under `mask`
    pub(crate) fn remask(&mut self, mask: &Arc<MemoryMask>) {
        self.title.remask(mask);
        self.username.remask(mask);
        self.password.remask(mask);
        self.url.remask(mask);
        self.notes.remask(mask);
        for value in self.custom_fields.values_mut() {
            value.remask(mask);
        }
        for value in self.binaries.values_mut() {
            value.remask(mask);
        }
        for old in &mut self.history {
            old.remask(mask);
        }
    }
}

/// Builder for creating entries
pub struct EntryBuilder {
    entry: Entry,
}

impl EntryBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            entry: Entry::new(title),
        }
    }

    pub fn username(mut self, username: &str) -> Self {
        self.entry.username = ProtectedString::plain(username);
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.entry.password = ProtectedString::protected(password);
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.entry.url = ProtectedString::plain(url);
        self
    }

    pub fn notes(mut self, notes: &str) -> Self {
        self.entry.notes = ProtectedString::plain(notes);
        self
    }

    pub fn custom_field(mut self, key: &str, value: &str, protect: bool) -> Self {
        self.entry
            .custom_fields
            .insert(key.to_string(), ProtectedString::new(value, protect));
        self
    }

    pub fn attachment(mut self, name: &str, data: &[u8]) -> Self {
        self.entry
            .binaries
            .insert(name.to_string(), ProtectedBinary::new(data, false));
        self
    }

    pub fn icon(mut self, id: u32) -> Self {
        self.entry.icon = IconRef::standard(id);
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.entry.tags.push(tag.to_string());
        self
    }

    pub fn parent_group(mut self, group_uuid: Uuid) -> Self {
        self.entry.parent_group = Some(group_uuid);
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.entry.times.set_expiry(Some(expires));
        self
    }

    pub fn build(self) -> Entry {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = Entry::new("Test Entry");
        assert_eq!(entry.title.reveal().as_str(), "Test Entry");
        assert!(entry.password.is_empty());
        assert!(entry.password.is_protected());
    }

    #[test]
    fn test_entry_builder() {
        let entry = EntryBuilder::new("GitHub")
            .username("user@example.com")
            .password("secret123")
            .url("https://github.com")
            .notes("My GitHub account")
            .tag("work")
            .tag("dev")
            .custom_field("2FA", "enabled", false)
            .build();

        assert_eq!(entry.title.reveal().as_str(), "GitHub");
        assert_eq!(entry.username.reveal().as_str(), "user@example.com");
        assert_eq!(entry.password.reveal().as_str(), "secret123");
        assert_eq!(entry.url.reveal().as_str(), "https://github.com");
        assert_eq!(entry.tags, vec!["work", "dev"]);
        assert_eq!(
            entry.field("2FA").map(|v| v.reveal().to_string()),
            Some("enabled".to_string())
        );
    }

    #[test]
    fn test_fields_order() {
        let entry = EntryBuilder::new("t")
            .custom_field("b", "2", false)
            .custom_field("a", "1", true)
            .build();
        let keys: Vec<&str> = entry.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![TITLE, USERNAME, PASSWORD, URL, NOTES, "a", "b"]);
    }

    #[test]
    fn test_history_cap_keeps_newest() {
        let mut entry = Entry::new("v0");
        for i in 1..=20 {
            let previous = entry.clone();
            entry.title = ProtectedString::plain(&format!("v{}", i));
            entry.times.modified = previous.times.modified + chrono::Duration::seconds(1);
            entry.create_backup(&previous);
            entry.maintain_backups(10, -1);
        }
        assert_eq!(entry.history.len(), 10);
        assert_eq!(entry.history[0].title.reveal().as_str(), "v10");
        assert_eq!(entry.history[9].title.reveal().as_str(), "v19");
        assert!(entry.history.iter().all(|h| h.history.is_empty()));
    }

    #[test]
    fn test_history_size_limit() {
        let mut entry = Entry::new("big");
        for i in 0..5 {
            let previous = entry.clone();
            entry.notes = ProtectedString::plain(&"x".repeat(1000 + i));
            entry.times.modified = previous.times.modified + chrono::Duration::seconds(1);
            entry.create_backup(&previous);
        }
        let one = entry.history[4].size();
        assert!(entry.maintain_backups(-1, (one * 2) as i64));
        assert!(entry.history.len() <= 2);
        assert!(!entry.maintain_backups(-1, -1));
    }

    #[test]
    fn test_meta_stream_detection() {
        let mut entry = EntryBuilder::new("Meta-Info")
            .username("SYSTEM")
            .url("$")
            .notes("KPX_GROUP_TREE_STATE")
            .attachment("bin-stream", &[1, 2, 3])
            .build();
        assert!(entry.is_meta_stream());
        entry.url = ProtectedString::plain("https://example.com");
        assert!(!entry.is_meta_stream());
    }
}
