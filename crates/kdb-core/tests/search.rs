//! Search over databases loaded from disk

use chrono::{Duration, Utc};
use kdb_core::{
    Credentials, Database, EntryBuilder, GroupBuilder, KdfParameters, NoProgress,
    SearchParameters,
};
use tempfile::tempdir;

fn titles(db: &Database, query: &str, params: &SearchParameters) -> Vec<String> {
    db.search(query, params)
        .into_iter()
        .map(|e| e.title.reveal().to_string())
        .collect()
}

fn reload(db: &Database) -> Database {
    let dir = tempdir().unwrap();
    let path = dir.path().join("search.db");
    db.save_to_path(&path, &mut NoProgress).unwrap();
    Database::open_path(&path, &Credentials::from_password("pw"), &mut NoProgress).unwrap()
}

fn kdbx_fixture() -> Database {
    let mut db = Database::new("Search", Credentials::from_password("pw"));
    db.crypto.kdf = KdfParameters::aes(10);
    let root = db.root_uuid();
    let hidden = db
        .add_group(GroupBuilder::new("Hidden").parent(root).searchable(false).build())
        .unwrap();
    let nested = db
        .add_group(GroupBuilder::new("Nested").parent(hidden).build())
        .unwrap();

    db.add_entry(
        EntryBuilder::new("Bank Login")
            .username("Alice")
            .password("bank-pass")
            .build(),
    )
    .unwrap();
    db.add_entry(
        EntryBuilder::new("Old Bank")
            .expires(Utc::now() - Duration::days(1))
            .build(),
    )
    .unwrap();
    db.add_entry(
        EntryBuilder::new("Notes")
            .custom_field("Account", "bank 42", true)
            .build(),
    )
    .unwrap();
    db.add_entry(EntryBuilder::new("Hidden Bank").parent_group(hidden).build())
        .unwrap();
    db.add_entry(EntryBuilder::new("Deep Bank").parent_group(nested).build())
        .unwrap();
    let trashed = db
        .add_entry(EntryBuilder::new("Trashed Bank").build())
        .unwrap();
    db.recycle_entry(&trashed).unwrap();
    db
}

#[test]
fn test_defaults_after_reload() {
    let db = reload(&kdbx_fixture());
    let params = SearchParameters::default();
    assert_eq!(
        titles(&db, "BANK", &params),
        vec!["Bank Login", "Old Bank", "Notes"]
    );
}

#[test]
fn test_disabled_groups_and_recycle_bin() {
    let db = reload(&kdbx_fixture());
    let everything = SearchParameters {
        respect_searching_disabled: false,
        ..SearchParameters::default()
    };
    let mut found = titles(&db, "bank", &everything);
    found.sort();
    assert_eq!(
        found,
        vec![
            "Bank Login",
            "Deep Bank",
            "Hidden Bank",
            "Notes",
            "Old Bank",
            "Trashed Bank"
        ]
    );
}

#[test]
fn test_expired_and_limits() {
    let db = reload(&kdbx_fixture());
    let params = SearchParameters {
        exclude_expired: true,
        max_results: Some(1),
        ..SearchParameters::default()
    };
    assert_eq!(titles(&db, "bank", &params), vec!["Bank Login"]);
}

#[test]
fn test_password_and_case_options() {
    let db = reload(&kdbx_fixture());
    let passwords_only = SearchParameters {
        search_in_titles: false,
        search_in_other_fields: false,
        search_in_passwords: true,
        ..SearchParameters::default()
    };
    assert_eq!(titles(&db, "bank-pass", &passwords_only), vec!["Bank Login"]);

    let exact = SearchParameters {
        ignore_case: false,
        ..SearchParameters::default()
    };
    assert_eq!(titles(&db, "alice", &exact), Vec::<String>::new());
    assert_eq!(titles(&db, "Alice", &exact), vec!["Bank Login"]);
    assert!(titles(&db, "", &SearchParameters::default()).is_empty());
}

#[test]
fn test_kdb_backup_group_is_omitted() {
    let mut db = Database::new_kdb(Credentials::from_password("pw"));
    db.crypto.kdf = KdfParameters::aes(10);
    let root = db.root_uuid();
    let backup = db
        .add_group(GroupBuilder::new("Backup").parent(root).build())
        .unwrap();
    let internet = db.find_group_by_path("Internet").unwrap();
    db.add_entry(EntryBuilder::new("Forum").parent_group(internet).build())
        .unwrap();
    db.add_entry(EntryBuilder::new("Forum (old)").parent_group(backup).build())
        .unwrap();

    let db = reload(&db);
    assert_eq!(
        titles(&db, "forum", &SearchParameters::default()),
        vec!["Forum"]
    );
    let with_backup = SearchParameters {
        omit_backup: false,
        ..SearchParameters::default()
    };
    assert_eq!(titles(&db, "forum", &with_backup).len(), 2);
}
