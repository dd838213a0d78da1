//! Database tree to KDBX XML document

use super::values::{
    encode_base64, format_bool, format_optional_bool, format_time, format_uuid, xml_safe,
};
use crate::binary_pool::BinaryPool;
use crate::crypto::stream::InnerStream;
use crate::database::{Database, KdbxVersion};
use crate::entry::{AutoType, Entry};
use crate::error::{Error, Result};
use crate::format::gzip;
use crate::group::Group;
use crate::meta::{MemoryProtection, Meta};
use crate::protected::ProtectedString;
use crate::times::Times;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use xml::common::XmlVersion;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};
use zeroize::Zeroizing;

/// Where attachments go and how the document is stamped
pub struct WriteOptions<'a> {
    pub version: KdbxVersion,
    pub binaries: &'a BinaryPool,
    /// SHA-256 of the outer header, 3.1 only
    pub header_hash: Option<[u8; 32]>,
    /// Gzip unprotected pooled binaries, 3.1 only
    pub compress_binaries: bool,
}

struct DocumentWriter<'a, 's> {
    w: EventWriter<Vec<u8>>,
    stream: &'s mut InnerStream,
    options: WriteOptions<'a>,
    protection: MemoryProtection,
}

pub fn write_document(
    db: &Database,
    stream: &mut InnerStream,
    options: WriteOptions<'_>,
) -> Result<Vec<u8>> {
    let w = EmitterConfig::new()
        .perform_indent(true)
        .indent_string("\t")
        .create_writer(Vec::new());
    let mut writer = DocumentWriter {
        w,
        stream,
        options,
        protection: db.meta.memory_protection,
    };

    writer.w.write(XmlEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: Some(true),
    })?;
    writer.start("KeePassFile")?;
    writer.write_meta(&db.meta)?;
    writer.start("Root")?;
    writer.write_group(db, db.root_group())?;
    writer.start("DeletedObjects")?;
    for obj in db.deleted_objects() {
        writer.start("DeletedObject")?;
        writer.text("UUID", &format_uuid(&obj.uuid))?;
        writer.time("DeletionTime", &obj.deletion_time)?;
        writer.end()?;
    }
    writer.end()?;
    writer.end()?;
    writer.end()?;
    Ok(writer.w.into_inner())
}

impl DocumentWriter<'_, '_> {
    fn start(&mut self, name: &str) -> Result<()> {
        self.w.write(XmlEvent::start_element(name))?;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.w.write(XmlEvent::end_element())?;
        Ok(())
    }

    fn characters(&mut self, value: &str) -> Result<()> {
        if !value.is_empty() {
            self.w.write(XmlEvent::characters(&xml_safe(value)))?;
        }
        Ok(())
    }

    fn text(&mut self, name: &str, value: &str) -> Result<()> {
        self.start(name)?;
        self.characters(value)?;
        self.end()
    }

    fn time(&mut self, name: &str, value: &DateTime<Utc>) -> Result<()> {
        let text = format_time(value, self.options.version);
        self.text(name, &text)
    }

    fn uuid(&mut self, name: &str, value: &Uuid) -> Result<()> {
        self.text(name, &format_uuid(value))
    }

    fn bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.text(name, format_bool(value))
    }

    fn number(&mut self, name: &str, value: impl ToString) -> Result<()> {
        self.text(name, &value.to_string())
    }

    fn write_meta(&mut self, meta: &Meta) -> Result<()> {
        self.start("Meta")?;
        self.text("Generator", &meta.generator)?;
        if let (KdbxVersion::Kdbx31, Some(hash)) = (self.options.version, self.options.header_hash)
        {
            self.text("HeaderHash", &encode_base64(&hash))?;
        }
        self.text("DatabaseName", &meta.name)?;
        self.time("DatabaseNameChanged", &meta.name_changed)?;
        self.text("DatabaseDescription", &meta.description)?;
        self.time("DatabaseDescriptionChanged", &meta.description_changed)?;
        self.text("DefaultUserName", &meta.default_username)?;
        self.time("DefaultUserNameChanged", &meta.default_username_changed)?;
        self.number("MaintenanceHistoryDays", meta.maintenance_history_days)?;
        self.text("Color", &meta.color)?;
        self.time("MasterKeyChanged", &meta.master_key_changed)?;
        self.number("MasterKeyChangeRec", meta.master_key_change_rec)?;
        self.number("MasterKeyChangeForce", meta.master_key_change_force)?;

        let mp = meta.memory_protection;
        self.start("MemoryProtection")?;
        self.bool("ProtectTitle", mp.title)?;
        self.bool("ProtectUserName", mp.username)?;
        self.bool("ProtectPassword", mp.password)?;
        self.bool("ProtectURL", mp.url)?;
        self.bool("ProtectNotes", mp.notes)?;
        self.end()?;

        if !meta.custom_icons.is_empty() {
            self.start("CustomIcons")?;
            for icon in meta.custom_icons.iter() {
                self.start("Icon")?;
                self.uuid("UUID", &icon.uuid)?;
                self.text("Data", &encode_base64(&icon.data))?;
                self.end()?;
            }
            self.end()?;
        }

        self.bool("RecycleBinEnabled", meta.recycle_bin_enabled)?;
        self.uuid("RecycleBinUUID", &meta.recycle_bin_uuid)?;
        self.time("RecycleBinChanged", &meta.recycle_bin_changed)?;
        self.uuid("EntryTemplatesGroup", &meta.entry_templates_group)?;
        self.time("EntryTemplatesGroupChanged", &meta.entry_templates_group_changed)?;
        self.number("HistoryMaxItems", meta.history_max_items)?;
        self.number("HistoryMaxSize", meta.history_max_size)?;
        self.uuid("LastSelectedGroup", &meta.last_selected_group)?;
        self.uuid("LastTopVisibleGroup", &meta.last_top_visible_group)?;

        if self.options.version == KdbxVersion::Kdbx31 {
            self.write_pooled_binaries()?;
        }

        self.start("CustomData")?;
        for (key, value) in &meta.custom_data {
            self.start("Item")?;
            self.text("Key", key)?;
            self.text("Value", value)?;
            self.end()?;
        }
        self.end()?;
        self.end()
    }

    fn write_pooled_binaries(&mut self) -> Result<()> {
        self.start("Binaries")?;
        let pool = self.options.binaries;
        for (id, binary) in pool.iter() {
            let mut data = Zeroizing::new(binary.reveal().to_vec());
            let id = id.to_string();
            let element = XmlEvent::start_element("Binary").attr("ID", &id);
            let element = if binary.is_protected() {
                self.stream.process(&mut data);
                element.attr("Protected", "True")
            } else if self.options.compress_binaries {
                data = Zeroizing::new(gzip(&data)?);
                element.attr("Compressed", "True")
            } else {
                element
            };
            self.w.write(element)?;
            self.characters(&encode_base64(&data))?;
            self.end()?;
        }
        self.end()
    }

    fn write_times(&mut self, times: &Times) -> Result<()> {
        self.start("Times")?;
        self.time("CreationTime", &times.created)?;
        self.time("LastModificationTime", &times.modified)?;
        self.time("LastAccessTime", &times.accessed)?;
        self.time("ExpiryTime", &times.expires)?;
        self.bool("Expires", times.expires_enabled)?;
        self.number("UsageCount", times.usage_count)?;
        self.time("LocationChanged", &times.location_changed)?;
        self.end()
    }

    fn write_group(&mut self, db: &Database, group: &Group) -> Result<()> {
        self.start("Group")?;
        self.uuid("UUID", &group.uuid)?;
        self.text("Name", &group.name)?;
        self.text("Notes", &group.notes)?;
        self.number("IconID", group.icon.standard)?;
        if let Some(custom) = group.icon.custom {
            self.uuid("CustomIconUUID", &custom)?;
        }
        self.write_times(&group.times)?;
        self.bool("IsExpanded", group.expanded)?;
        self.text("DefaultAutoTypeSequence", &group.default_auto_type_sequence)?;
        self.text("EnableAutoType", format_optional_bool(group.enable_auto_type))?;
        self.text("EnableSearching", format_optional_bool(group.enable_searching))?;
        self.uuid("LastTopVisibleEntry", &group.last_top_visible_entry)?;
        for entry in db.entries_in_group(&group.uuid) {
            self.write_entry(entry, false)?;
        }
        for child in db.child_groups(&group.uuid) {
            self.write_group(db, child)?;
        }
        self.end()
    }

    fn write_entry(&mut self, entry: &Entry, in_history: bool) -> Result<()> {
        self.start("Entry")?;
        self.uuid("UUID", &entry.uuid)?;
        self.number("IconID", entry.icon.standard)?;
        if let Some(custom) = entry.icon.custom {
            self.uuid("CustomIconUUID", &custom)?;
        }
        self.text("ForegroundColor", &entry.foreground_color)?;
        self.text("BackgroundColor", &entry.background_color)?;
        self.text("OverrideURL", &entry.override_url)?;
        self.text("Tags", &entry.tags.join(";"))?;
        self.write_times(&entry.times)?;

        for (key, value) in entry.fields() {
            let protect = self
                .protection
                .for_field(key)
                .unwrap_or_else(|| value.is_protected());
            self.write_string(key, value, protect)?;
        }

        for (name, binary) in &entry.binaries {
            let id = self.options.binaries.find(binary).ok_or_else(|| {
                Error::InvalidEntry(format!("Attachment '{}' is missing from the pool", name))
            })?;
            let id = id.to_string();
            self.start("Binary")?;
            self.text("Key", name)?;
            self.w.write(XmlEvent::start_element("Value").attr("Ref", &id))?;
            self.end()?;
            self.end()?;
        }

        self.write_auto_type(&entry.auto_type)?;

        if !in_history {
            self.start("History")?;
            for old in &entry.history {
                self.write_entry(old, true)?;
            }
            self.end()?;
        }
        self.end()
    }

    fn write_string(&mut self, key: &str, value: &ProtectedString, protect: bool) -> Result<()> {
        self.start("String")?;
        self.text("Key", key)?;
        if protect {
            let mut data = Zeroizing::new(value.reveal().as_bytes().to_vec());
            self.stream.process(&mut data);
            self.w
                .write(XmlEvent::start_element("Value").attr("Protected", "True"))?;
            self.characters(&encode_base64(&data))?;
            self.end()?;
        } else {
            self.text("Value", &value.reveal())?;
        }
        self.end()
    }

    fn write_auto_type(&mut self, auto_type: &AutoType) -> Result<()> {
        self.start("AutoType")?;
        self.bool("Enabled", auto_type.enabled)?;
        self.number("DataTransferObfuscation", auto_type.obfuscation)?;
        if !auto_type.default_sequence.is_empty() {
            self.text("DefaultSequence", &auto_type.default_sequence)?;
        }
        for (window, sequence) in &auto_type.associations {
            self.start("Association")?;
            self.text("Window", window)?;
            self.text("KeystrokeSequence", sequence)?;
            self.end()?;
        }
        self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::super::xml_reader::read_document;
    use super::*;
    use crate::crypto::stream::InnerStreamAlgorithm;
    use crate::entry::EntryBuilder;
    use crate::key::Credentials;

    fn sample_db() -> Database {
        let mut db = Database::new("Written", Credentials::from_password("pw"));
        db.add_entry(
            EntryBuilder::new("Site\u{1}")
                .username("user")
                .password("secret")
                .custom_field("PIN", "1234", true)
                .custom_field("Plain", "visible", false)
                .attachment("a.bin", b"attached")
                .tag("work")
                .build(),
        )
        .unwrap();
        db
    }

    fn write(db: &Database, version: KdbxVersion, key: &[u8]) -> (Vec<u8>, BinaryPool) {
        let pool = BinaryPool::collect(db.entries());
        let mut stream = InnerStream::new(InnerStreamAlgorithm::ChaCha20, key).unwrap();
        let xml = write_document(
            db,
            &mut stream,
            WriteOptions {
                version,
                binaries: &pool,
                header_hash: Some([1; 32]),
                compress_binaries: true,
            },
        )
        .unwrap();
        (xml, pool)
    }

    #[test]
    fn test_protected_values_are_not_plaintext() {
        let db = sample_db();
        let (xml, _) = write(&db, KdbxVersion::Kdbx31, &[5; 64]);
        let text = String::from_utf8(xml).unwrap();
        assert!(!text.contains("secret"));
        assert!(!text.contains("1234"));
        assert!(text.contains("visible"));
        assert!(text.contains("<HeaderHash>"));
        assert!(text.contains("Compressed=\"True\""));
        // control characters are stripped from plain text
        assert!(text.contains("<Value>Site</Value>"));
    }

    #[test]
    fn test_document_reads_back_with_same_keystream() {
        let db = sample_db();
        let (xml, _) = write(&db, KdbxVersion::Kdbx31, &[5; 64]);
        let mut stream = InnerStream::new(InnerStreamAlgorithm::ChaCha20, &[5; 64]).unwrap();
        let doc = read_document(&xml, &mut stream, BinaryPool::new()).unwrap();
        let entry = doc.tree.entries.values().next().unwrap();
        assert_eq!(entry.password.reveal().as_str(), "secret");
        assert!(entry.custom_fields["PIN"].is_protected());
        assert_eq!(entry.custom_fields["PIN"].reveal().as_str(), "1234");
        assert!(!entry.custom_fields["Plain"].is_protected());
        assert_eq!(entry.binaries["a.bin"].reveal().as_slice(), b"attached");
        assert_eq!(doc.header_hash, Some(vec![1; 32]));
    }

    #[test]
    fn test_v4_keeps_binaries_out_of_meta() {
        let db = sample_db();
        let (xml, pool) = write(&db, KdbxVersion::Kdbx40, &[5; 64]);
        let text = String::from_utf8(xml.clone()).unwrap();
        assert!(!text.contains("<Binaries>"));
        assert!(!text.contains("<HeaderHash>"));

        let mut stream = InnerStream::new(InnerStreamAlgorithm::ChaCha20, &[5; 64]).unwrap();
        let doc = read_document(&xml, &mut stream, pool).unwrap();
        let entry = doc.tree.entries.values().next().unwrap();
        assert_eq!(entry.binaries["a.bin"].reveal().as_slice(), b"attached");
    }
}
