//! KDB v3 saving: flatten the tree into leveled records and encrypt them

use super::date::pack;
use super::header::{KdbHeader, VERSION};
use super::{entry_field, group_field, EXT_HEADER_HASH, EXT_RANDOM_SEED, FIELD_END};
use crate::crypto::kdf::{aes_transform, KdfParameters};
use crate::crypto::{random_bytes, sha256};
use crate::database::Database;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::key::KeyFlavor;
use crate::progress::{ProgressListener, ProgressStatus};
use crate::times::{never, Times};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

pub(crate) fn write(db: &Database, progress: &mut dyn ProgressListener) -> Result<Vec<u8>> {
    progress.on_status(ProgressStatus::Serializing);
    let rounds = match &db.crypto.kdf {
        KdfParameters::Aes { rounds, .. } => u32::try_from(*rounds).map_err(|_| {
            Error::UnsupportedKdf(format!("KDB files allow at most {} rounds", u32::MAX))
        })?,
        other => {
            return Err(Error::UnsupportedKdf(format!(
                "KDB files require AES-KDF, not {}",
                other.uuid()
            )))
        }
    };

    let layout = Layout::of(db)?;
    let mut header = KdbHeader {
        flags: KdbHeader::flags_for(db.crypto.cipher)?,
        version: VERSION,
        master_seed: random_bytes(),
        encryption_iv: random_bytes(),
        num_groups: count(layout.groups.len(), "groups")?,
        num_entries: count(layout.entries.len(), "entries")?,
        contents_hash: [0; 32],
        transform_seed: random_bytes(),
        transform_rounds: rounds,
    };

    let mut body = Vec::new();
    for (i, (group, level)) in layout.groups.iter().enumerate() {
        let ext = if i == 0 {
            Some(header.digest()?)
        } else {
            None
        };
        write_group(&mut body, group, layout.ids[&group.uuid], *level, ext)?;
    }
    for entry in &layout.entries {
        let group_id = entry
            .parent_group
            .and_then(|parent| layout.ids.get(&parent))
            .copied()
            .ok_or_else(|| {
                Error::InvalidEntry(format!("Entry {} must belong to a group", entry.uuid))
            })?;
        write_entry(&mut body, entry, group_id)?;
    }
    header.contents_hash = sha256(&[&body]);

    let composite = db.credentials().composite_key(KeyFlavor::Kdb)?;
    let total = u64::from(rounds);
    progress.on_status(ProgressStatus::DerivingKey { done: 0, total });
    let transformed = aes_transform(&header.transform_seed, &composite, total, &mut |done, total| {
        progress.on_status(ProgressStatus::DerivingKey { done, total })
    });
    let final_key = sha256(&[&header.master_seed, &transformed]);

    progress.on_status(ProgressStatus::Encrypting);
    let encrypted = db
        .crypto
        .cipher
        .encrypt(&final_key, &header.encryption_iv, &body)?;

    progress.on_status(ProgressStatus::Writing);
    let mut out = header.to_bytes()?;
    out.extend_from_slice(&encrypted);
    debug!(
        "Encoded KDB database: {} groups, {} entries, {} bytes",
        header.num_groups,
        header.num_entries,
        out.len()
    );
    Ok(out)
}

fn count(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::InvalidGroup(format!("Too many {} for a KDB file", what)))
}

/// Groups in file order with their levels, the id each group is written
/// under, and the entries in file order
struct Layout<'a> {
    groups: Vec<(&'a Group, u16)>,
    ids: HashMap<Uuid, u32>,
    entries: Vec<&'a Entry>,
}

impl<'a> Layout<'a> {
    fn of(db: &'a Database) -> Result<Self> {
        let root = db.root_uuid();
        let mut levels: HashMap<Uuid, u16> = HashMap::new();
        let mut groups = Vec::new();
        for group in db.groups_preorder().into_iter().skip(1) {
            let level = match group.parent {
                Some(parent) if parent == root => 0,
                Some(parent) => levels
                    .get(&parent)
                    .map(|l| l.saturating_add(1))
                    .ok_or_else(|| {
                        Error::InconsistentTree(format!("Group {} has no parent", group.uuid))
                    })?,
                None => {
                    return Err(Error::InconsistentTree(format!(
                        "Group {} is detached",
                        group.uuid
                    )))
                }
            };
            levels.insert(group.uuid, level);
            groups.push((group, level));
        }

        // Stored ids are kept when they are usable; the rest get fresh ones
        let mut used = HashSet::new();
        let mut ids = HashMap::new();
        for (group, _) in &groups {
            if let Some(id) = group.kdb_id.filter(|id| *id != 0 && !used.contains(id)) {
                used.insert(id);
                ids.insert(group.uuid, id);
            }
        }
        let mut next = used.iter().copied().max().unwrap_or(0);
        for (group, _) in &groups {
            if !ids.contains_key(&group.uuid) {
                next = next.checked_add(1).ok_or_else(|| {
                    Error::InvalidGroup("Ran out of KDB group ids".to_string())
                })?;
                ids.insert(group.uuid, next);
            }
        }

        if !db.root_group().entries.is_empty() {
            return Err(Error::InvalidEntry(
                "KDB files cannot hold entries outside a group".to_string(),
            ));
        }
        let entries = groups
            .iter()
            .flat_map(|(group, _)| db.entries_in_group(&group.uuid))
            .collect::<Vec<_>>();
        debug!(
            "KDB layout: {} groups, {} entries, {} reassigned ids",
            groups.len(),
            entries.len(),
            groups.len() - used.len()
        );
        Ok(Layout {
            groups,
            ids,
            entries,
        })
    }
}

fn record(out: &mut Vec<u8>, field: u16, data: &[u8]) -> Result<()> {
    out.write_u16::<LittleEndian>(field)?;
    out.write_u32::<LittleEndian>(data.len() as u32)?;
    out.extend_from_slice(data);
    Ok(())
}

fn string_record(out: &mut Vec<u8>, field: u16, value: &str) -> Result<()> {
    let mut data = Vec::with_capacity(value.len() + 1);
    data.extend_from_slice(value.as_bytes());
    data.push(0);
    record(out, field, &data)
}

fn date_record(out: &mut Vec<u8>, field: u16, date: &DateTime<Utc>) -> Result<()> {
    record(out, field, &pack(date))
}

fn expiry(times: &Times) -> DateTime<Utc> {
    if times.expires_enabled {
        times.expires
    } else {
        never()
    }
}

fn write_ext_data(out: &mut Vec<u8>, header_digest: &[u8; 32]) -> Result<()> {
    let mut ext = Vec::new();
    record(&mut ext, EXT_HEADER_HASH, header_digest)?;
    record(&mut ext, EXT_RANDOM_SEED, &random_bytes::<32>())?;
    record(&mut ext, FIELD_END, &[])?;
    record(out, group_field::EXT_DATA, &ext)
}

fn write_group(
    out: &mut Vec<u8>,
    group: &Group,
    id: u32,
    level: u16,
    ext: Option<[u8; 32]>,
) -> Result<()> {
    if let Some(digest) = ext {
        write_ext_data(out, &digest)?;
    }
    record(out, group_field::ID, &id.to_le_bytes())?;
    string_record(out, group_field::NAME, &group.name)?;
    date_record(out, group_field::CREATION, &group.times.created)?;
    date_record(out, group_field::MODIFICATION, &group.times.modified)?;
    date_record(out, group_field::ACCESS, &group.times.accessed)?;
    date_record(out, group_field::EXPIRY, &expiry(&group.times))?;
    record(out, group_field::ICON, &group.icon.standard.to_le_bytes())?;
    record(out, group_field::LEVEL, &level.to_le_bytes())?;
    record(out, group_field::FLAGS, &group.kdb_flags.to_le_bytes())?;
    record(out, FIELD_END, &[])
}

fn write_entry(out: &mut Vec<u8>, entry: &Entry, group_id: u32) -> Result<()> {
    record(out, entry_field::UUID, entry.uuid.as_bytes())?;
    record(out, entry_field::GROUP_ID, &group_id.to_le_bytes())?;
    record(out, entry_field::ICON, &entry.icon.standard.to_le_bytes())?;
    string_record(out, entry_field::TITLE, &entry.title.reveal())?;
    string_record(out, entry_field::URL, &entry.url.reveal())?;
    string_record(out, entry_field::USERNAME, &entry.username.reveal())?;
    string_record(out, entry_field::PASSWORD, &entry.password.reveal())?;
    string_record(out, entry_field::NOTES, &entry.notes.reveal())?;
    date_record(out, entry_field::CREATION, &entry.times.created)?;
    date_record(out, entry_field::MODIFICATION, &entry.times.modified)?;
    date_record(out, entry_field::ACCESS, &entry.times.accessed)?;
    date_record(out, entry_field::EXPIRY, &expiry(&entry.times))?;
    match entry.binaries.iter().next() {
        Some((desc, data)) => {
            string_record(out, entry_field::BINARY_DESC, desc)?;
            record(out, entry_field::BINARY_DATA, &data.reveal())?;
        }
        None => {
            string_record(out, entry_field::BINARY_DESC, "")?;
            record(out, entry_field::BINARY_DATA, &[])?;
        }
    }
    record(out, FIELD_END, &[])
}
