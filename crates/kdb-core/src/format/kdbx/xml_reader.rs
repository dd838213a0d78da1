//! KDBX XML document to database tree.
//!
//! Protected values are un-XORed the moment they are visited, so the walk
//! must follow document order exactly.

use super::dom::Node;
use super::values::{decode_base64, parse_bool, parse_tags, parse_time, parse_uuid};
use crate::binary_pool::BinaryPool;
use crate::crypto::stream::InnerStream;
use crate::database::Tree;
use crate::entry::{AutoType, Entry};
use crate::error::{Error, Result};
use crate::format::gunzip;
use crate::group::Group;
use crate::icons::{CustomIcon, IconRef};
use crate::meta::{DeletedObject, MemoryProtection, Meta};
use crate::protected::{ProtectedBinary, ProtectedString};
use crate::times::Times;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything the XML carries
pub struct Document {
    pub meta: Meta,
    /// Meta/HeaderHash of 3.1 files
    pub header_hash: Option<Vec<u8>>,
    pub tree: Tree,
}

struct DocumentReader<'s> {
    stream: &'s mut InnerStream,
    binaries: BinaryPool,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
}

/// Parse a decrypted document. `binaries` holds the 4.x inner header
/// attachments; 3.1 files fill the pool from Meta/Binaries.
pub fn read_document(xml: &[u8], stream: &mut InnerStream, binaries: BinaryPool) -> Result<Document> {
    let root = Node::parse(xml)?;
    if root.name != "KeePassFile" {
        return Err(Error::Xml(format!("Unexpected root element <{}>", root.name)));
    }

    let mut reader = DocumentReader {
        stream,
        binaries,
        groups: HashMap::new(),
        entries: HashMap::new(),
    };
    let mut meta = Meta::default();
    let mut header_hash = None;
    let mut root_group = None;
    let mut deleted_objects = Vec::new();

    for section in &root.children {
        match section.name.as_str() {
            "Meta" => header_hash = reader.read_meta(section, &mut meta)?,
            "Root" => {
                for node in &section.children {
                    match node.name.as_str() {
                        "Group" if root_group.is_none() => {
                            root_group = Some(reader.read_group(node, None)?);
                        }
                        "Group" => warn!("Ignoring a second root group"),
                        "DeletedObjects" => deleted_objects = read_deleted_objects(node),
                        other => debug!("Skipping <Root>/<{}>", other),
                    }
                }
            }
            other => debug!("Skipping <{}>", other),
        }
    }

    let root_uuid =
        root_group.ok_or_else(|| Error::Xml("Document has no root group".to_string()))?;
    reader.resolve_icons(&meta);
    debug!(
        "Parsed XML: {} groups, {} entries, {} binaries",
        reader.groups.len(),
        reader.entries.len(),
        reader.binaries.len()
    );

    Ok(Document {
        meta,
        header_hash,
        tree: Tree {
            root: root_uuid,
            groups: reader.groups,
            entries: reader.entries,
            deleted_objects,
        },
    })
}

fn text_time(node: &Node, into: &mut DateTime<Utc>) {
    match parse_time(&node.text) {
        Some(time) => *into = time,
        None => warn!("Unreadable time in <{}>: {:?}", node.name, node.text),
    }
}

fn text_uuid(node: &Node) -> Uuid {
    parse_uuid(&node.text).unwrap_or_else(Uuid::nil)
}

fn text_number<T: std::str::FromStr>(node: &Node, default: T) -> T {
    node.text.trim().parse().unwrap_or(default)
}

fn read_times(node: &Node) -> Times {
    let mut times = Times::new();
    for child in &node.children {
        match child.name.as_str() {
            "CreationTime" => text_time(child, &mut times.created),
            "LastModificationTime" => text_time(child, &mut times.modified),
            "LastAccessTime" => text_time(child, &mut times.accessed),
            "ExpiryTime" => text_time(child, &mut times.expires),
            "Expires" => times.expires_enabled = parse_bool(&child.text).unwrap_or(false),
            "UsageCount" => times.usage_count = text_number(child, 0),
            "LocationChanged" => text_time(child, &mut times.location_changed),
            _ => {}
        }
    }
    times
}

fn read_deleted_objects(node: &Node) -> Vec<DeletedObject> {
    node.children_named("DeletedObject")
        .filter_map(|obj| {
            let uuid = parse_uuid(obj.child_text("UUID")?)?;
            let deletion_time = obj
                .child_text("DeletionTime")
                .and_then(parse_time)
                .unwrap_or_else(crate::times::now);
            Some(DeletedObject {
                uuid,
                deletion_time,
            })
        })
        .collect()
}

fn read_memory_protection(node: &Node) -> MemoryProtection {
    let mut mp = MemoryProtection::default();
    for child in &node.children {
        let flag = parse_bool(&child.text).unwrap_or(false);
        match child.name.as_str() {
            "ProtectTitle" => mp.title = flag,
            "ProtectUserName" => mp.username = flag,
            "ProtectPassword" => mp.password = flag,
            "ProtectURL" => mp.url = flag,
            "ProtectNotes" => mp.notes = flag,
            _ => {}
        }
    }
    mp
}

impl DocumentReader<'_> {
    fn read_meta(&mut self, node: &Node, meta: &mut Meta) -> Result<Option<Vec<u8>>> {
        let mut header_hash = None;
        for child in &node.children {
            let text = child.text.as_str();
            match child.name.as_str() {
                "Generator" => meta.generator = text.to_string(),
                "HeaderHash" => header_hash = decode_base64(text),
                "DatabaseName" => meta.name = text.to_string(),
                "DatabaseNameChanged" => text_time(child, &mut meta.name_changed),
                "DatabaseDescription" => meta.description = text.to_string(),
                "DatabaseDescriptionChanged" => text_time(child, &mut meta.description_changed),
                "DefaultUserName" => meta.default_username = text.to_string(),
                "DefaultUserNameChanged" => {
                    text_time(child, &mut meta.default_username_changed)
                }
                "MaintenanceHistoryDays" => {
                    meta.maintenance_history_days =
                        text_number(child, meta.maintenance_history_days)
                }
                "Color" => meta.color = text.to_string(),
                "MasterKeyChanged" => text_time(child, &mut meta.master_key_changed),
                "MasterKeyChangeRec" => meta.master_key_change_rec = text_number(child, -1),
                "MasterKeyChangeForce" => meta.master_key_change_force = text_number(child, -1),
                "MemoryProtection" => meta.memory_protection = read_memory_protection(child),
                "CustomIcons" => {
                    for icon in child.children_named("Icon") {
                        let uuid = icon.child_text("UUID").and_then(parse_uuid);
                        let data = icon.child_text("Data").and_then(decode_base64);
                        match (uuid, data) {
                            (Some(uuid), Some(data)) => {
                                meta.custom_icons.add(CustomIcon { uuid, data })
                            }
                            _ => warn!("Skipping unreadable custom icon"),
                        }
                    }
                }
                "RecycleBinEnabled" => {
                    meta.recycle_bin_enabled = parse_bool(text).unwrap_or(true)
                }
                "RecycleBinUUID" => meta.recycle_bin_uuid = text_uuid(child),
                "RecycleBinChanged" => text_time(child, &mut meta.recycle_bin_changed),
                "EntryTemplatesGroup" => meta.entry_templates_group = text_uuid(child),
                "EntryTemplatesGroupChanged" => {
                    text_time(child, &mut meta.entry_templates_group_changed)
                }
                "HistoryMaxItems" => {
                    meta.history_max_items = text_number(child, meta.history_max_items)
                }
                "HistoryMaxSize" => {
                    meta.history_max_size = text_number(child, meta.history_max_size)
                }
                "LastSelectedGroup" => meta.last_selected_group = text_uuid(child),
                "LastTopVisibleGroup" => meta.last_top_visible_group = text_uuid(child),
                "Binaries" => self.read_meta_binaries(child)?,
                "CustomData" => {
                    for item in child.children_named("Item") {
                        if let Some(key) = item.child_text("Key") {
                            let value = item.child_text("Value").unwrap_or_default();
                            meta.custom_data.insert(key.to_string(), value.to_string());
                        }
                    }
                }
                other => debug!("Skipping <Meta>/<{}>", other),
            }
        }
        Ok(header_hash)
    }

    fn read_meta_binaries(&mut self, node: &Node) -> Result<()> {
        for binary in node.children_named("Binary") {
            let Some(id) = binary.attr("ID").and_then(|id| id.trim().parse::<u32>().ok()) else {
                warn!("Skipping a pooled binary without an id");
                continue;
            };
            let value = self.read_binary_value(binary)?;
            self.binaries.insert(id, value);
        }
        Ok(())
    }

    /// Decode an inline binary: base64, then XOR if protected, then gunzip
    /// if compressed
    fn read_binary_value(&mut self, node: &Node) -> Result<ProtectedBinary> {
        let mut data = decode_base64(&node.text)
            .ok_or_else(|| Error::Xml(format!("Invalid base64 in <{}>", node.name)))?;
        let protected = node.attr("Protected").and_then(parse_bool).unwrap_or(false);
        if protected {
            self.stream.process(&mut data);
        }
        if node.attr("Compressed").and_then(parse_bool).unwrap_or(false) {
            data = gunzip(&data)?;
        }
        Ok(ProtectedBinary::new(&data, protected))
    }

    fn read_string_value(&mut self, node: &Node) -> Result<ProtectedString> {
        if node.attr("Protected").and_then(parse_bool).unwrap_or(false) {
            let mut data = decode_base64(&node.text)
                .ok_or_else(|| Error::Xml("Invalid base64 in protected value".to_string()))?;
            self.stream.process(&mut data);
            let value = String::from_utf8(data)
                .map_err(|_| Error::WrongKeyOrCorruptFile)?;
            return Ok(ProtectedString::protected(&value));
        }
        // unencrypted exports mark values to protect once loaded
        let protect = node
            .attr("ProtectInMemory")
            .and_then(parse_bool)
            .unwrap_or(false);
        Ok(ProtectedString::new(&node.text, protect))
    }

    fn read_group(&mut self, node: &Node, parent: Option<Uuid>) -> Result<Uuid> {
        let mut group = Group::new("");
        group.parent = parent;
        let mut custom_icon = None;
        let mut pending = Vec::new();

        for child in &node.children {
            let text = child.text.as_str();
            match child.name.as_str() {
                "UUID" => group.uuid = parse_uuid(text).unwrap_or_else(Uuid::new_v4),
                "Name" => group.name = text.to_string(),
                "Notes" => group.notes = text.to_string(),
                "IconID" => group.icon = IconRef::standard(text_number(child, 0)),
                "CustomIconUUID" => custom_icon = parse_uuid(text),
                "Times" => group.times = read_times(child),
                "IsExpanded" => group.expanded = parse_bool(text).unwrap_or(true),
                "DefaultAutoTypeSequence" => group.default_auto_type_sequence = text.to_string(),
                "EnableAutoType" => group.enable_auto_type = parse_bool(text),
                "EnableSearching" => group.enable_searching = parse_bool(text),
                "LastTopVisibleEntry" => group.last_top_visible_entry = text_uuid(child),
                "Group" | "Entry" => pending.push(child),
                other => debug!("Skipping <Group>/<{}>", other),
            }
        }
        group.icon.custom = custom_icon;
        if self.groups.contains_key(&group.uuid) || self.entries.contains_key(&group.uuid) {
            warn!("Duplicate group uuid {}, assigning a new one", group.uuid);
            group.uuid = Uuid::new_v4();
        }

        // children are visited in document order to keep the keystream aligned
        let uuid = group.uuid;
        for child in pending {
            if child.name == "Group" {
                let child_uuid = self.read_group(child, Some(uuid))?;
                group.add_child(child_uuid);
            } else {
                let mut entry = self.read_entry(child)?;
                if self.entries.contains_key(&entry.uuid) || self.groups.contains_key(&entry.uuid)
                {
                    warn!("Duplicate entry uuid {}, assigning a new one", entry.uuid);
                    entry.uuid = Uuid::new_v4();
                }
                entry.parent_group = Some(uuid);
                group.add_entry(entry.uuid);
                self.entries.insert(entry.uuid, entry);
            }
        }
        self.groups.insert(uuid, group);
        Ok(uuid)
    }

    fn read_entry(&mut self, node: &Node) -> Result<Entry> {
        let mut entry = Entry::new("");
        entry.title = ProtectedString::empty();
        entry.password = ProtectedString::empty();

        for child in &node.children {
            let text = child.text.as_str();
            match child.name.as_str() {
                "UUID" => entry.uuid = parse_uuid(text).unwrap_or_else(Uuid::new_v4),
                "IconID" => entry.icon = IconRef::standard(text_number(child, 0)),
                "CustomIconUUID" => entry.icon.custom = parse_uuid(text),
                "ForegroundColor" => entry.foreground_color = text.to_string(),
                "BackgroundColor" => entry.background_color = text.to_string(),
                "OverrideURL" => entry.override_url = text.to_string(),
                "Tags" => entry.tags = parse_tags(text),
                "Times" => entry.times = read_times(child),
                "String" => {
                    let key = child.child_text("Key").unwrap_or_default().to_string();
                    let value = match child.child("Value") {
                        Some(value) => self.read_string_value(value)?,
                        None => ProtectedString::empty(),
                    };
                    entry.set_field(&key, value);
                }
                "Binary" => {
                    let key = child.child_text("Key").unwrap_or_default().to_string();
                    if let Some(binary) = self.read_entry_binary(child)? {
                        entry.binaries.insert(key, binary);
                    }
                }
                "AutoType" => entry.auto_type = read_auto_type(child),
                "History" => {
                    for old in child.children_named("Entry") {
                        let mut old = self.read_entry(old)?;
                        old.history.clear();
                        entry.history.push(old);
                    }
                }
                other => debug!("Skipping <Entry>/<{}>", other),
            }
        }
        let uuid = entry.uuid;
        for old in &mut entry.history {
            old.uuid = uuid;
        }
        Ok(entry)
    }

    fn read_entry_binary(&mut self, node: &Node) -> Result<Option<ProtectedBinary>> {
        let Some(value) = node.child("Value") else {
            return Ok(None);
        };
        if let Some(reference) = value.attr("Ref") {
            let resolved = reference
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|id| self.binaries.get(id))
                .cloned();
            if resolved.is_none() {
                warn!("Dropping attachment with unresolved reference {}", reference);
            }
            return Ok(resolved);
        }
        self.read_binary_value(value).map(Some)
    }

    fn resolve_icons(&mut self, meta: &Meta) {
        let pool = &meta.custom_icons;
        for group in self.groups.values_mut() {
            if !pool.resolve(&mut group.icon) {
                warn!("Group {} references a missing custom icon", group.uuid);
            }
        }
        for entry in self.entries.values_mut() {
            if !pool.resolve(&mut entry.icon) {
                warn!("Entry {} references a missing custom icon", entry.uuid);
            }
            for old in &mut entry.history {
                pool.resolve(&mut old.icon);
            }
        }
    }
}

fn read_auto_type(node: &Node) -> AutoType {
    let mut auto_type = AutoType::default();
    for child in &node.children {
        match child.name.as_str() {
            "Enabled" => auto_type.enabled = parse_bool(&child.text).unwrap_or(true),
            "DataTransferObfuscation" => auto_type.obfuscation = text_number(child, 0),
            "DefaultSequence" => auto_type.default_sequence = child.text.clone(),
            "Association" => auto_type.associations.push((
                child.child_text("Window").unwrap_or_default().to_string(),
                child
                    .child_text("KeystrokeSequence")
                    .unwrap_or_default()
                    .to_string(),
            )),
            _ => {}
        }
    }
    auto_type
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::stream::InnerStreamAlgorithm;

    fn no_stream() -> InnerStream {
        InnerStream::new(InnerStreamAlgorithm::None, &[]).unwrap()
    }

    const DOC: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<KeePassFile>
  <Meta>
    <Generator>Other</Generator>
    <DatabaseName>Vault</DatabaseName>
    <HistoryMaxItems>5</HistoryMaxItems>
    <CustomIcons><Icon><UUID>AAAAAAAAAAAAAAAAAAAAAQ==</UUID><Data>iVBORw==</Data></Icon></CustomIcons>
    <Binaries><Binary ID="0">aGVsbG8=</Binary></Binaries>
    <UnknownThing><Nested>x</Nested></UnknownThing>
  </Meta>
  <Root>
    <Group>
      <UUID>AAAAAAAAAAAAAAAAAAAAAg==</UUID>
      <Name>Vault</Name>
      <EnableSearching>null</EnableSearching>
      <Entry>
        <UUID>AAAAAAAAAAAAAAAAAAAAAw==</UUID>
        <CustomIconUUID>AAAAAAAAAAAAAAAAAAAA/w==</CustomIconUUID>
        <Tags>a;b</Tags>
        <String><Key>Title</Key><Value>Mail</Value></String>
        <String><Key>Extra</Key><Value ProtectInMemory="True">pin</Value></String>
        <Binary><Key>note.txt</Key><Value Ref="0"/></Binary>
        <Binary><Key>gone.txt</Key><Value Ref="9"/></Binary>
        <History><Entry><String><Key>Title</Key><Value>Old</Value></String></Entry></History>
      </Entry>
      <Group><Name>Child</Name><IconID>12</IconID></Group>
    </Group>
    <DeletedObjects><DeletedObject><UUID>AAAAAAAAAAAAAAAAAAAABA==</UUID><DeletionTime>2020-01-01T00:00:00Z</DeletionTime></DeletedObject></DeletedObjects>
  </Root>
</KeePassFile>"#;

    #[test]
    fn test_reads_tree_and_meta() {
        let mut stream = no_stream();
        let doc = read_document(DOC.as_bytes(), &mut stream, BinaryPool::new()).unwrap();
        assert_eq!(doc.meta.name, "Vault");
        assert_eq!(doc.meta.history_max_items, 5);
        assert_eq!(doc.meta.custom_icons.len(), 1);
        assert!(doc.header_hash.is_none());

        let root = &doc.tree.groups[&doc.tree.root];
        assert_eq!(root.enable_searching, None);
        assert_eq!(root.children.len(), 1);
        assert_eq!(doc.tree.groups[&root.children[0]].icon.standard, 12);

        let entry = &doc.tree.entries[&root.entries[0]];
        assert_eq!(entry.title.reveal().as_str(), "Mail");
        assert!(entry.custom_fields["Extra"].is_protected());
        assert_eq!(entry.tags, vec!["a", "b"]);
        assert_eq!(entry.binaries.len(), 1);
        assert_eq!(entry.binaries["note.txt"].reveal().as_slice(), b"hello");
        // dangling custom icon dropped
        assert_eq!(entry.icon.custom, None);
        assert_eq!(entry.history.len(), 1);
        assert_eq!(entry.history[0].uuid, entry.uuid);
        assert_eq!(doc.tree.deleted_objects.len(), 1);
    }

    #[test]
    fn test_protected_values_follow_document_order() {
        let key = [7u8; 32];
        let mut encoder = InnerStream::new(InnerStreamAlgorithm::Salsa20, &key).unwrap();
        let mut first = b"one".to_vec();
        let mut second = b"two".to_vec();
        encoder.process(&mut first);
        encoder.process(&mut second);
        let xml = format!(
            "<KeePassFile><Root><Group><Name>R</Name>\
             <Entry><String><Key>Password</Key><Value Protected=\"True\">{}</Value></String></Entry>\
             <Group><Name>C</Name><Entry><String><Key>Password</Key><Value Protected=\"True\">{}</Value></String></Entry></Group>\
             </Group></Root></KeePassFile>",
            super::super::values::encode_base64(&first),
            super::super::values::encode_base64(&second)
        );

        let mut decoder = InnerStream::new(InnerStreamAlgorithm::Salsa20, &key).unwrap();
        let doc = read_document(xml.as_bytes(), &mut decoder, BinaryPool::new()).unwrap();
        let mut passwords: Vec<String> = doc
            .tree
            .entries
            .values()
            .map(|e| e.password.reveal().to_string())
            .collect();
        passwords.sort();
        assert_eq!(passwords, vec!["one", "two"]);
    }

    #[test]
    fn test_missing_root_group() {
        let mut stream = no_stream();
        assert!(matches!(
            read_document(b"<KeePassFile><Meta/></KeePassFile>", &mut stream, BinaryPool::new()),
            Err(Error::Xml(_))
        ));
    }
}
