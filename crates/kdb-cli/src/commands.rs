//! Command handlers and their plain-text / JSON renderings

use crate::session::DatabaseSession;
use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use kdb_core::{
    Database, Entry, EntryBuilder, GroupTreeNode, ProtectedString, SaveOptions, SearchParameters,
    Uuid, STANDARD_FIELDS,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary of an entry as listed by `list` and `search`
#[derive(Debug, Serialize)]
pub struct EntryView {
    pub uuid: Uuid,
    pub title: String,
    pub username: String,
    pub url: String,
    pub group: String,
    pub tags: Vec<String>,
    pub expired: bool,
}

/// Everything `show` prints. Protected values stay hidden unless revealed.
#[derive(Debug, Serialize)]
pub struct EntryDetail {
    #[serde(flatten)]
    pub summary: EntryView,
    pub fields: BTreeMap<String, String>,
    pub attachments: Vec<AttachmentView>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub history: usize,
}

#[derive(Debug, Serialize)]
pub struct AttachmentView {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Serialize)]
pub struct GroupExport {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub entries: Vec<EntryExport>,
    pub groups: Vec<GroupExport>,
}

#[derive(Debug, Serialize)]
pub struct EntryExport {
    pub uuid: Uuid,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub attachments: Vec<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub history: usize,
}

const MASK: &str = "********";

fn group_path(db: &Database, entry: &Entry) -> String {
    entry
        .parent_group
        .and_then(|parent| db.path_of(&parent).ok())
        .map(|names| names.join("/"))
        .unwrap_or_default()
}

fn expiry(entry: &Entry) -> Option<DateTime<Utc>> {
    entry
        .times
        .expires_enabled
        .then_some(entry.times.expires)
}

fn summarize(db: &Database, entry: &Entry) -> EntryView {
    EntryView {
        uuid: entry.uuid,
        title: entry.title.reveal().to_string(),
        username: entry.username.reveal().to_string(),
        url: entry.url.reveal().to_string(),
        group: group_path(db, entry),
        tags: entry.tags.clone(),
        expired: entry.is_expired(),
    }
}

fn detail(db: &Database, entry: &Entry, reveal: bool) -> EntryDetail {
    let fields = entry
        .fields()
        .map(|(key, value)| {
            let text = if value.is_protected() && !reveal {
                MASK.to_string()
            } else {
                value.reveal().to_string()
            };
            (key.to_string(), text)
        })
        .collect();
    EntryDetail {
        summary: summarize(db, entry),
        fields,
        attachments: entry
            .binaries
            .iter()
            .map(|(name, data)| AttachmentView {
                name: name.clone(),
                size: data.len(),
            })
            .collect(),
        created: entry.times.created,
        modified: entry.times.modified,
        expires: expiry(entry),
        history: entry.history.len(),
    }
}

fn export_group(db: &Database, uuid: &Uuid) -> Option<GroupExport> {
    let group = db.get_group(uuid)?;
    Some(GroupExport {
        uuid: group.uuid,
        name: group.name.clone(),
        notes: group.notes.clone(),
        entries: db
            .entries_in_group(uuid)
            .into_iter()
            .filter(|e| !e.is_meta_stream())
            .map(|entry| EntryExport {
                uuid: entry.uuid,
                fields: entry
                    .fields()
                    .map(|(k, v)| (k.to_string(), v.reveal().to_string()))
                    .collect(),
                tags: entry.tags.clone(),
                attachments: entry.binaries.keys().cloned().collect(),
                created: entry.times.created,
                modified: entry.times.modified,
                expires: expiry(entry),
                history: entry.history.len(),
            })
            .collect(),
        groups: group
            .children
            .iter()
            .filter_map(|child| export_group(db, child))
            .collect(),
    })
}

/// Entries in tree order, optionally restricted to a group and its subgroups
fn entries_below<'a>(db: &'a Database, group: Option<Uuid>) -> Vec<&'a Entry> {
    db.groups_preorder()
        .into_iter()
        .filter(|g| group.map_or(true, |root| db.is_in_group(&g.uuid, &root)))
        .flat_map(|g| db.entries_in_group(&g.uuid))
        .filter(|e| !e.is_meta_stream())
        .collect()
}

/// Resolve an entry by UUID, or by a title that matches exactly one entry
fn resolve_entry(db: &Database, needle: &str) -> anyhow::Result<Uuid> {
    if let Ok(uuid) = needle.parse::<Uuid>() {
        if db.get_entry(&uuid).is_some() {
            return Ok(uuid);
        }
        bail!(kdb_core::Error::EntryNotFound(uuid));
    }
    let matches: Vec<Uuid> = db
        .visible_entries()
        .filter(|e| e.title.reveal().eq_ignore_ascii_case(needle))
        .map(|e| e.uuid)
        .collect();
    match matches.as_slice() {
        [uuid] => Ok(*uuid),
        [] => Err(anyhow!("No entry titled {:?}", needle)),
        many => Err(anyhow!(
            "{} entries are titled {:?}, pick one by UUID",
            many.len(),
            needle
        )),
    }
}

/// Map `title`, `password` and friends onto the standard field keys
fn canonical_field(name: &str) -> String {
    STANDARD_FIELDS
        .iter()
        .find(|key| key.eq_ignore_ascii_case(name))
        .map(|key| key.to_string())
        .unwrap_or_else(|| name.to_string())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_entries(entries: &[EntryView], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&entries);
    }
    for entry in entries {
        let group = if entry.group.is_empty() {
            String::new()
        } else {
            format!(" [{}]", entry.group)
        };
        println!("{}  {}{}", entry.uuid, entry.title, group);
    }
    Ok(())
}

fn print_tree(node: &GroupTreeNode, depth: usize) {
    println!("{}{} ({})", "  ".repeat(depth), node.name, node.entry_count);
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

pub async fn info(session: &DatabaseSession, json: bool) -> anyhow::Result<()> {
    let metadata = session.read(|db| db.metadata()).await;
    if json {
        return print_json(&metadata);
    }
    println!("File:     {}", session.path().display());
    println!("Name:     {}", metadata.name);
    if !metadata.description.is_empty() {
        println!("About:    {}", metadata.description);
    }
    println!("Format:   {}", metadata.format.name());
    println!("Cipher:   {}", metadata.cipher);
    println!("Rounds:   {}", metadata.transform_rounds);
    println!("Groups:   {}", metadata.group_count);
    println!("Entries:  {}", metadata.entry_count);
    Ok(())
}

pub async fn tree(session: &DatabaseSession, json: bool) -> anyhow::Result<()> {
    let tree = session.read(|db| db.group_tree()).await;
    if json {
        return print_json(&tree);
    }
    print_tree(&tree, 0);
    Ok(())
}

pub async fn list(
    session: &DatabaseSession,
    group: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let views = session
        .read(|db| {
            let group = match group {
                Some(path) => Some(
                    db.find_group_by_path(path)
                        .ok_or_else(|| anyhow!("No group at {:?}", path))?,
                ),
                None => None,
            };
            Ok::<_, anyhow::Error>(
                entries_below(db, group)
                    .into_iter()
                    .map(|e| summarize(db, e))
                    .collect::<Vec<_>>(),
            )
        })
        .await?;
    print_entries(&views, json)
}

pub async fn show(
    session: &DatabaseSession,
    needle: &str,
    reveal: bool,
    json: bool,
) -> anyhow::Result<()> {
    let view = session
        .read(|db| {
            let uuid = resolve_entry(db, needle)?;
            let entry = db
                .get_entry(&uuid)
                .ok_or(kdb_core::Error::EntryNotFound(uuid))?;
            Ok::<_, anyhow::Error>(detail(db, entry, reveal))
        })
        .await?;
    if json {
        return print_json(&view);
    }
    println!("UUID:      {}", view.summary.uuid);
    println!("Group:     {}", view.summary.group);
    for (key, value) in &view.fields {
        println!("{:<10} {}", format!("{}:", key), value);
    }
    if !view.summary.tags.is_empty() {
        println!("Tags:      {}", view.summary.tags.join(", "));
    }
    for attachment in &view.attachments {
        println!("Attached:  {} ({} bytes)", attachment.name, attachment.size);
    }
    println!("Modified:  {}", view.modified);
    if let Some(expires) = view.expires {
        let note = if view.summary.expired { " (expired)" } else { "" };
        println!("Expires:   {}{}", expires, note);
    }
    if view.history > 0 {
        println!("History:   {} versions", view.history);
    }
    Ok(())
}

pub async fn search(
    session: &DatabaseSession,
    query: &str,
    params: SearchParameters,
    json: bool,
) -> anyhow::Result<()> {
    if query.is_empty() {
        bail!("Search query is empty");
    }
    let views = session
        .read(|db| {
            db.search(query, &params)
                .into_iter()
                .map(|e| summarize(db, e))
                .collect::<Vec<_>>()
        })
        .await;
    print_entries(&views, json)
}

/// New entry fields for `add`
pub struct NewEntry {
    pub group: String,
    pub title: String,
    pub username: Option<String>,
    pub url: Option<String>,
    pub password: Option<zeroize::Zeroizing<String>>,
}

pub async fn add(session: &DatabaseSession, new: NewEntry, json: bool) -> anyhow::Result<()> {
    let group = session
        .read(|db| db.find_group_by_path(&new.group))
        .await
        .ok_or_else(|| anyhow!("No group at {:?}", new.group))?;

    let mut builder = EntryBuilder::new(&new.title).parent_group(group);
    if let Some(username) = &new.username {
        builder = builder.username(username);
    }
    if let Some(url) = &new.url {
        builder = builder.url(url);
    }
    if let Some(password) = &new.password {
        builder = builder.password(password);
    }
    let entry = builder.build();

    let uuid = session
        .commit(move |db, path, progress| {
            db.commit_add_entry(path, entry, SaveOptions::default(), progress)
        })
        .await?;
    tracing::info!("Added entry {}", uuid);
    if json {
        return print_json(&serde_json::json!({ "uuid": uuid }));
    }
    println!("{}", uuid);
    Ok(())
}

/// Parse `NAME=VALUE`
pub fn parse_field(arg: &str) -> Result<(String, String), String> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", arg))?;
    if name.is_empty() {
        return Err("field name is empty".to_string());
    }
    Ok((name.to_string(), value.to_string()))
}

pub async fn edit(
    session: &DatabaseSession,
    needle: &str,
    fields: Vec<(String, String)>,
) -> anyhow::Result<()> {
    if fields.is_empty() {
        bail!("Nothing to change, pass --field NAME=VALUE");
    }
    let (uuid, entry) = session
        .read(|db| {
            let uuid = resolve_entry(db, needle)?;
            let mut entry = db
                .get_entry(&uuid)
                .cloned()
                .ok_or(kdb_core::Error::EntryNotFound(uuid))?;
            for (name, value) in &fields {
                let key = canonical_field(name);
                let protect = match db.meta.memory_protection.for_field(&key) {
                    Some(flag) => flag,
                    None if db.format().is_kdb() => {
                        bail!("KDB entries have no custom field {:?}", key)
                    }
                    None => entry.field(&key).map_or(false, ProtectedString::is_protected),
                };
                entry.set_field(&key, db.store_string(value, protect));
            }
            Ok::<_, anyhow::Error>((uuid, entry))
        })
        .await?;

    session
        .commit(move |db, path, progress| {
            db.commit_entry_update(path, &uuid, entry, SaveOptions::default(), progress)
        })
        .await?;
    tracing::info!("Updated entry {}", uuid);
    Ok(())
}

pub async fn remove(
    session: &DatabaseSession,
    needle: &str,
    permanent: bool,
) -> anyhow::Result<()> {
    let uuid = session.read(|db| resolve_entry(db, needle)).await?;
    let recycled = session
        .commit(move |db, path, progress| {
            if permanent {
                db.commit_delete_entry(path, &uuid, SaveOptions::default(), progress)
                    .map(|_| false)
            } else {
                db.commit_recycle_entry(path, &uuid, SaveOptions::default(), progress)
            }
        })
        .await?;
    if recycled {
        println!("Moved {} to the recycle bin", uuid);
    } else {
        println!("Deleted {}", uuid);
    }
    Ok(())
}

pub async fn export_json(session: &DatabaseSession) -> anyhow::Result<()> {
    let export = session
        .read(|db| export_group(db, &db.root_uuid()))
        .await
        .context("Root group is missing")?;
    print_json(&export)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdb_core::{Credentials, Group};

    fn sample() -> (Database, Uuid) {
        let mut db = Database::new("Sample", Credentials::from_password("pw"));
        let mut group = Group::new("Web");
        group.parent = Some(db.root_uuid());
        let group = db.add_group(group).unwrap();
        let uuid = db
            .add_entry(
                EntryBuilder::new("GitHub")
                    .username("octo")
                    .password("hunter2")
                    .parent_group(group)
                    .build(),
            )
            .unwrap();
        db.add_entry(EntryBuilder::new("Loose").build()).unwrap();
        (db, uuid)
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("UserName=a=b").unwrap(),
            ("UserName".to_string(), "a=b".to_string())
        );
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[test]
    fn test_canonical_field() {
        assert_eq!(canonical_field("password"), "Password");
        assert_eq!(canonical_field("url"), "URL");
        assert_eq!(canonical_field("Pin"), "Pin");
    }

    #[test]
    fn test_resolve_entry_by_title_and_uuid() {
        let (db, uuid) = sample();
        assert_eq!(resolve_entry(&db, "github").unwrap(), uuid);
        assert_eq!(resolve_entry(&db, &uuid.to_string()).unwrap(), uuid);
        assert!(resolve_entry(&db, "missing").is_err());
        assert!(resolve_entry(&db, &Uuid::new_v4().to_string()).is_err());
    }

    #[test]
    fn test_detail_masks_protected_fields() {
        let (db, uuid) = sample();
        let entry = db.get_entry(&uuid).unwrap();
        let hidden = detail(&db, entry, false);
        assert_eq!(hidden.fields["Password"], MASK);
        assert_eq!(hidden.fields["UserName"], "octo");
        assert_eq!(hidden.summary.group, "Web");
        assert_eq!(detail(&db, entry, true).fields["Password"], "hunter2");
    }

    #[test]
    fn test_entries_below_group() {
        let (db, uuid) = sample();
        let web = db.find_group_by_path("Web");
        let below: Vec<Uuid> = entries_below(&db, web).iter().map(|e| e.uuid).collect();
        assert_eq!(below, vec![uuid]);
        assert_eq!(entries_below(&db, None).len(), 2);
    }

    #[test]
    fn test_export_reveals_everything() {
        let (db, uuid) = sample();
        let export = export_group(&db, &db.root_uuid()).unwrap();
        let web = &export.groups[0];
        assert_eq!(web.entries[0].uuid, uuid);
        assert_eq!(web.entries[0].fields["Password"], "hunter2");
        assert_eq!(export.entries.len(), 1);
    }
}
