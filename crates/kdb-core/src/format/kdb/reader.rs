//! KDB v3 loading: decrypt, verify, then rebuild the tree from the flat
//! leveled group list

use super::date::{unpack_or_never, PACKED_DATE_LEN};
use super::header::{KdbHeader, HEADER_SIZE};
use super::{entry_field, group_field, EXT_HEADER_HASH, FIELD_END};
use crate::crypto::kdf::{aes_transform, KdfParameters};
use crate::crypto::sha256;
use crate::database::{Compression, CryptoSettings, Database, DatabaseFormat, Tree, KDB_ROOT_NAME};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::format::ByteReader;
use crate::group::Group;
use crate::icons::IconRef;
use crate::key::{Credentials, KeyFlavor};
use crate::meta::Meta;
use crate::progress::{ProgressListener, ProgressStatus};
use crate::protected::{ProtectedBinary, ProtectedString};
use crate::times::{never, Times};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) fn read(
    data: &[u8],
    credentials: Credentials,
    progress: &mut dyn ProgressListener,
) -> Result<Database> {
    progress.on_status(ProgressStatus::ReadingHeader);
    let header = KdbHeader::parse(data)?;
    let cipher = header.cipher()?;
    debug!(
        "KDB header: version {:#x}, {} groups, {} entries, {} rounds",
        header.version, header.num_groups, header.num_entries, header.transform_rounds
    );

    let composite = credentials.composite_key(KeyFlavor::Kdb)?;
    let rounds = u64::from(header.transform_rounds);
    progress.on_status(ProgressStatus::DerivingKey {
        done: 0,
        total: rounds,
    });
    let transformed = aes_transform(&header.transform_seed, &composite, rounds, &mut |done, total| {
        progress.on_status(ProgressStatus::DerivingKey { done, total })
    });
    let final_key = sha256(&[&header.master_seed, &transformed]);

    progress.on_status(ProgressStatus::Decrypting);
    let plain = cipher.decrypt(&final_key, &header.encryption_iv, &data[HEADER_SIZE..])?;
    if sha256(&[&plain]) != header.contents_hash {
        return Err(Error::WrongKeyOrCorruptFile);
    }

    progress.on_status(ProgressStatus::Parsing);
    let tree = parse_body(&plain, &header)?;

    let crypto = CryptoSettings {
        cipher,
        compression: Compression::None,
        kdf: KdfParameters::Aes {
            rounds,
            seed: header.transform_seed.to_vec(),
        },
    };
    let meta = Meta {
        recycle_bin_enabled: false,
        ..Meta::default()
    };
    let db = Database::assemble(DatabaseFormat::Kdb, crypto, meta, credentials, tree)?;
    debug!(
        "Decoded KDB body: {} groups, {} entries",
        header.num_groups, header.num_entries
    );
    Ok(db)
}

/// Type and size of a record, the least any group or entry can take
const RECORD_HEADER_LEN: usize = 6;

/// A group as read, before it is placed in the tree
struct FlatGroup {
    group: Group,
    level: u16,
}

fn parse_body(plain: &[u8], header: &KdbHeader) -> Result<Tree> {
    let mut r = ByteReader::new(plain);
    // header counts are not authenticated, so never reserve past the body
    let max_records = plain.len() / RECORD_HEADER_LEN;

    let mut flat = Vec::with_capacity((header.num_groups as usize).min(max_records));
    let mut current = new_group();
    while flat.len() < header.num_groups as usize {
        let (field, data) = read_record(&mut r)?;
        if field == FIELD_END {
            flat.push(std::mem::replace(&mut current, new_group()));
        } else {
            read_group_field(&mut current, field, data, header)?;
        }
    }

    let mut entries = Vec::with_capacity((header.num_entries as usize).min(max_records));
    let mut entry = new_entry();
    while entries.len() < header.num_entries as usize {
        let (field, data) = read_record(&mut r)?;
        if field == FIELD_END {
            entries.push(std::mem::replace(&mut entry, new_entry()));
        } else {
            read_entry_field(&mut entry, field, data)?;
        }
    }

    build_tree(flat, entries)
}

fn new_group() -> FlatGroup {
    let mut group = Group::new("");
    group.times.expires = never();
    FlatGroup { group, level: 0 }
}

fn new_entry() -> (Entry, Option<u32>) {
    let mut entry = Entry::new("");
    entry.password = ProtectedString::protected("");
    (entry, None)
}

fn read_record<'a>(r: &mut ByteReader<'a>) -> Result<(u16, &'a [u8])> {
    let field = r.u16("record type")?;
    let size = r.u32("record size")? as usize;
    let data = r.take(size, "record data")?;
    Ok((field, data))
}

fn cstr(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn le_u32(data: &[u8], what: &str) -> Result<u32> {
    ByteReader::new(data).u32(what)
}

fn date(data: &[u8]) -> Result<DateTime<Utc>> {
    let bytes: [u8; PACKED_DATE_LEN] = ByteReader::new(data).array("packed date")?;
    Ok(unpack_or_never(&bytes))
}

fn set_expiry(times: &mut Times, expires: DateTime<Utc>) {
    times.expires = expires;
    times.expires_enabled = expires != never();
}

fn read_group_field(fg: &mut FlatGroup, field: u16, data: &[u8], header: &KdbHeader) -> Result<()> {
    let group = &mut fg.group;
    match field {
        group_field::EXT_DATA => check_ext_data(data, header)?,
        group_field::ID => group.kdb_id = Some(le_u32(data, "group id")?),
        group_field::NAME => group.name = cstr(data),
        group_field::CREATION => group.times.created = date(data)?,
        group_field::MODIFICATION => group.times.modified = date(data)?,
        group_field::ACCESS => group.times.accessed = date(data)?,
        group_field::EXPIRY => set_expiry(&mut group.times, date(data)?),
        group_field::ICON => group.icon = IconRef::standard(le_u32(data, "group icon")?),
        group_field::LEVEL => fg.level = ByteReader::new(data).u16("group level")?,
        group_field::FLAGS => group.kdb_flags = le_u32(data, "group flags")?,
        other => debug!("Skipping unknown group field {:#06x}", other),
    }
    Ok(())
}

/// The extension block written before the first group: a header digest
/// and random padding
fn check_ext_data(data: &[u8], header: &KdbHeader) -> Result<()> {
    let mut r = ByteReader::new(data);
    loop {
        let (field, value) = read_record(&mut r)?;
        match field {
            FIELD_END => return Ok(()),
            EXT_HEADER_HASH => {
                if value != header.digest()? {
                    warn!("KDB extension data carries a header hash that does not match");
                }
            }
            _ => {}
        }
    }
}

fn read_entry_field(slot: &mut (Entry, Option<u32>), field: u16, data: &[u8]) -> Result<()> {
    let (entry, group_id) = slot;
    match field {
        entry_field::UUID => {
            let bytes: [u8; 16] = ByteReader::new(data).array("entry uuid")?;
            entry.uuid = Uuid::from_bytes(bytes);
        }
        entry_field::GROUP_ID => *group_id = Some(le_u32(data, "entry group id")?),
        entry_field::ICON => entry.icon = IconRef::standard(le_u32(data, "entry icon")?),
        entry_field::TITLE => entry.title = ProtectedString::plain(&cstr(data)),
        entry_field::URL => entry.url = ProtectedString::plain(&cstr(data)),
        entry_field::USERNAME => entry.username = ProtectedString::plain(&cstr(data)),
        entry_field::PASSWORD => entry.password = ProtectedString::protected(&cstr(data)),
        entry_field::NOTES => entry.notes = ProtectedString::plain(&cstr(data)),
        entry_field::CREATION => entry.times.created = date(data)?,
        entry_field::MODIFICATION => entry.times.modified = date(data)?,
        entry_field::ACCESS => entry.times.accessed = date(data)?,
        entry_field::EXPIRY => set_expiry(&mut entry.times, date(data)?),
        entry_field::BINARY_DESC => {
            let desc = cstr(data);
            let existing = entry.binaries.pop_first().map(|(_, bin)| bin);
            entry
                .binaries
                .insert(desc, existing.unwrap_or_else(|| ProtectedBinary::new(&[], false)));
        }
        entry_field::BINARY_DATA => {
            let desc = entry
                .binaries
                .pop_first()
                .map(|(desc, _)| desc)
                .unwrap_or_default();
            entry.binaries.insert(desc, ProtectedBinary::new(data, false));
        }
        other => debug!("Skipping unknown entry field {:#06x}", other),
    }
    Ok(())
}

/// Rebuild the hierarchy: a group at level L hangs below the most recent
/// group at level L-1; level 0 hangs below the synthetic root
fn build_tree(flat: Vec<FlatGroup>, entries: Vec<(Entry, Option<u32>)>) -> Result<Tree> {
    let mut root = Group::new(KDB_ROOT_NAME);
    root.times.expires = never();
    let root_uuid = root.uuid;

    let mut groups: HashMap<Uuid, Group> = HashMap::new();
    let mut by_id: HashMap<u32, Uuid> = HashMap::new();
    let mut ancestors: Vec<Uuid> = Vec::new();
    let mut order = vec![root_uuid];
    groups.insert(root_uuid, root);

    for FlatGroup { mut group, level } in flat {
        let level = level as usize;
        if level > ancestors.len() {
            return Err(Error::InconsistentTree(format!(
                "Group '{}' at level {} has no parent at level {}",
                group.name,
                level,
                level - 1
            )));
        }
        ancestors.truncate(level);
        let parent = ancestors.last().copied().unwrap_or(root_uuid);
        group.parent = Some(parent);
        if let Some(id) = group.kdb_id {
            if by_id.insert(id, group.uuid).is_some() {
                warn!("Duplicate KDB group id {}", id);
            }
        }
        ancestors.push(group.uuid);
        order.push(group.uuid);
        if let Some(parent_group) = groups.get_mut(&parent) {
            parent_group.add_child(group.uuid);
        }
        groups.insert(group.uuid, group);
    }

    let mut entry_map = HashMap::new();
    for (mut entry, group_id) in entries {
        let parent = group_id
            .and_then(|id| by_id.get(&id).copied())
            .ok_or_else(|| {
                Error::InconsistentTree(format!(
                    "Entry {} references unknown group {:?}",
                    entry.uuid, group_id
                ))
            })?;
        if entry_map.contains_key(&entry.uuid) {
            warn!("Duplicate entry uuid {}, assigning a new one", entry.uuid);
            entry.uuid = Uuid::new_v4();
        }
        entry
            .binaries
            .retain(|desc, data| !(desc.is_empty() && data.is_empty()));
        entry.parent_group = Some(parent);
        if let Some(group) = groups.get_mut(&parent) {
            group.add_entry(entry.uuid);
        }
        entry_map.insert(entry.uuid, entry);
    }
    debug!("Rebuilt KDB tree with {} groups", order.len() - 1);

    Ok(Tree {
        root: root_uuid,
        groups,
        entries: entry_map,
        deleted_objects: Vec::new(),
    })
}
