//! Whole-file save and reload through every supported format

use kdb_core::{
    Argon2Variant, Credentials, DataCipher, Database, DatabaseFormat, EntryBuilder, Error,
    GroupBuilder, KdbxVersion, KdfParameters, NoProgress, ProtectedString, Uuid,
};
use std::path::Path;
use tempfile::tempdir;

fn password() -> Credentials {
    Credentials::from_password("correct horse")
}

fn reopen(path: &Path) -> Database {
    Database::open_path(path, &password(), &mut NoProgress).unwrap()
}

fn kdbx(version: KdbxVersion, cipher: DataCipher, kdf: KdfParameters) -> Database {
    let mut db = Database::new("Round Trip", password());
    db.crypto.cipher = cipher;
    db.crypto.kdf = kdf;
    db.set_kdbx_version(version).unwrap();
    db
}

fn small_argon2() -> KdfParameters {
    KdfParameters::Argon2 {
        variant: Argon2Variant::Argon2id,
        salt: vec![7; 32],
        memory: 1024 * 1024,
        iterations: 1,
        parallelism: 1,
        version: 0x13,
    }
}

/// Fill a KDBX database with a nested group, custom fields, attachments and history
fn populate(db: &mut Database) -> (Uuid, Uuid) {
    let root = db.root_uuid();
    let work = db
        .add_group(GroupBuilder::new("Work").notes("office").parent(root).build())
        .unwrap();
    let servers = db
        .add_group(GroupBuilder::new("Servers").parent(work).build())
        .unwrap();

    let mail = db
        .add_entry(
            EntryBuilder::new("Mail")
                .username("alice")
                .password("m4il-pass")
                .url("https://mail.example.com")
                .notes("line one\nline two")
                .custom_field("PIN", "0000", true)
                .custom_field("Recovery", "word list", true)
                .custom_field("Plain", "visible", false)
                .attachment("key.pem", b"-----BEGIN KEY-----")
                .tag("work")
                .parent_group(work)
                .build(),
        )
        .unwrap();
    let ssh = db
        .add_entry(
            EntryBuilder::new("SSH")
                .username("root")
                .password("t0ps3cret")
                .attachment("key.pem", b"-----BEGIN KEY-----")
                .parent_group(servers)
                .build(),
        )
        .unwrap();

    for (pin, password) in [("1111", "second"), ("2222", "third")] {
        let mut next = db.get_entry(&mail).unwrap().clone();
        next.set_field("PIN", ProtectedString::protected(pin));
        next.set_password(password);
        db.update_entry(&mail, next).unwrap();
    }
    (mail, ssh)
}

fn assert_populated(db: &Database, mail: Uuid, ssh: Uuid) {
    let entry = db.get_entry(&mail).unwrap();
    assert_eq!(entry.title.reveal().as_str(), "Mail");
    assert_eq!(entry.username.reveal().as_str(), "alice");
    assert_eq!(entry.password.reveal().as_str(), "third");
    assert_eq!(entry.notes.reveal().as_str(), "line one\nline two");
    assert_eq!(entry.custom_fields["PIN"].reveal().as_str(), "2222");
    assert!(entry.custom_fields["PIN"].is_protected());
    assert_eq!(entry.custom_fields["Recovery"].reveal().as_str(), "word list");
    assert!(!entry.custom_fields["Plain"].is_protected());
    assert_eq!(
        entry.binaries["key.pem"].reveal().as_slice(),
        b"-----BEGIN KEY-----"
    );
    assert_eq!(entry.tags, vec!["work".to_string()]);

    // oldest first, each with its own protected values
    let history: Vec<String> = entry
        .history
        .iter()
        .map(|h| h.password.reveal().to_string())
        .collect();
    assert_eq!(history, vec!["m4il-pass", "second"]);
    assert_eq!(entry.history[1].custom_fields["PIN"].reveal().as_str(), "1111");
    assert!(entry.history.iter().all(|h| h.uuid == mail));

    let ssh = db.get_entry(&ssh).unwrap();
    assert_eq!(ssh.password.reveal().as_str(), "t0ps3cret");
    assert_eq!(db.path_of(&ssh.parent_group.unwrap()).unwrap(), vec!["Work", "Servers"]);

    let work = db.find_group_by_path("Work").unwrap();
    assert_eq!(db.get_group(&work).unwrap().notes, "office");
    db.check_integrity().unwrap();
}

#[test]
fn test_kdbx31_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v31.kdbx");
    let mut db = kdbx(KdbxVersion::Kdbx31, DataCipher::Aes256, KdfParameters::aes(50));
    let (mail, ssh) = populate(&mut db);
    db.save_to_path(&path, &mut NoProgress).unwrap();

    let reopened = reopen(&path);
    assert_eq!(reopened.format(), DatabaseFormat::Kdbx(KdbxVersion::Kdbx31));
    assert_eq!(reopened.meta.name, "Round Trip");
    assert_eq!(reopened.crypto.kdf.rounds(), 50);
    assert_populated(&reopened, mail, ssh);
}

#[test]
fn test_kdbx40_chacha_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v40.kdbx");
    let mut db = kdbx(KdbxVersion::Kdbx40, DataCipher::ChaCha20, KdfParameters::aes(50));
    let (mail, ssh) = populate(&mut db);
    db.save_to_path(&path, &mut NoProgress).unwrap();

    let reopened = reopen(&path);
    assert_eq!(reopened.format(), DatabaseFormat::Kdbx(KdbxVersion::Kdbx40));
    assert_eq!(reopened.crypto.cipher, DataCipher::ChaCha20);
    assert_populated(&reopened, mail, ssh);
}

#[test]
fn test_kdbx40_argon2_twofish_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("argon.kdbx");
    let mut db = kdbx(KdbxVersion::Kdbx40, DataCipher::Twofish, small_argon2());
    let (mail, ssh) = populate(&mut db);
    db.save_to_path(&path, &mut NoProgress).unwrap();

    let reopened = reopen(&path);
    assert!(matches!(
        reopened.crypto.kdf,
        KdfParameters::Argon2 {
            variant: Argon2Variant::Argon2id,
            iterations: 1,
            ..
        }
    ));
    assert_populated(&reopened, mail, ssh);
}

#[test]
fn test_reload_twice_is_stable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stable.kdbx");
    let mut db = kdbx(KdbxVersion::Kdbx40, DataCipher::Aes256, KdfParameters::aes(20));
    let (mail, ssh) = populate(&mut db);
    db.save_to_path(&path, &mut NoProgress).unwrap();

    let first = reopen(&path);
    first.save_to_path(&path, &mut NoProgress).unwrap();
    let second = reopen(&path);
    assert_populated(&second, mail, ssh);
    assert_eq!(first.groups().count(), second.groups().count());
    assert_eq!(
        first.get_entry(&mail).unwrap().times,
        second.get_entry(&mail).unwrap().times
    );
}

#[test]
fn test_kdb_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy.kdb");
    let mut db = Database::new_kdb(password());
    db.crypto.kdf = KdfParameters::aes(40);
    db.crypto.cipher = DataCipher::Twofish;

    let internet = db.find_group_by_path("Internet").unwrap();
    let nested = db
        .add_group(GroupBuilder::new("Shops").parent(internet).build())
        .unwrap();
    let shop = db
        .add_entry(
            EntryBuilder::new("Shop")
                .username("bob")
                .password("kdb-secret")
                .url("https://shop.example")
                .notes("n")
                .attachment("receipt.txt", b"paid")
                .parent_group(nested)
                .build(),
        )
        .unwrap();
    db.save_to_path(&path, &mut NoProgress).unwrap();

    let reopened = reopen(&path);
    assert_eq!(reopened.format(), DatabaseFormat::Kdb);
    assert_eq!(reopened.crypto.cipher, DataCipher::Twofish);
    assert_eq!(reopened.crypto.kdf.rounds(), 40);

    let entry = reopened.get_entry(&shop).unwrap();
    assert_eq!(entry.username.reveal().as_str(), "bob");
    assert_eq!(entry.password.reveal().as_str(), "kdb-secret");
    assert_eq!(entry.binaries["receipt.txt"].reveal().as_slice(), b"paid");
    assert_eq!(
        reopened.path_of(&entry.parent_group.unwrap()).unwrap(),
        vec!["Internet", "Shops"]
    );
    let top: Vec<&str> = reopened
        .child_groups(&reopened.root_uuid())
        .iter()
        .map(|g| g.name.as_str())
        .collect();
    assert_eq!(top, vec!["Internet", "eMail"]);
    reopened.check_integrity().unwrap();
}

#[test]
fn test_kdb_rejects_root_entries_on_save() {
    let dir = tempdir().unwrap();
    let mut db = Database::new_kdb(password());
    assert!(matches!(
        db.add_entry(EntryBuilder::new("Loose").build()),
        Err(Error::InvalidEntry(_))
    ));
    db.crypto.kdf = KdfParameters::aes(10);
    db.save_to_path(dir.path().join("ok.kdb"), &mut NoProgress)
        .unwrap();
}

#[test]
fn test_wrong_password_for_every_format() {
    let dir = tempdir().unwrap();
    let mut kdb = Database::new_kdb(password());
    kdb.crypto.kdf = KdfParameters::aes(10);
    let databases = [
        kdb,
        kdbx(KdbxVersion::Kdbx31, DataCipher::Aes256, KdfParameters::aes(10)),
        kdbx(KdbxVersion::Kdbx40, DataCipher::Aes256, KdfParameters::aes(10)),
    ];
    for (i, db) in databases.iter().enumerate() {
        let path = dir.path().join(format!("db{}", i));
        db.save_to_path(&path, &mut NoProgress).unwrap();
        let result = Database::open_path(
            &path,
            &Credentials::from_password("wrong"),
            &mut NoProgress,
        );
        assert!(
            matches!(result, Err(Error::WrongKeyOrCorruptFile)),
            "{}",
            db.format().name()
        );
    }
}

#[test]
fn test_truncated_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("short.kdbx");
    let db = kdbx(KdbxVersion::Kdbx31, DataCipher::Aes256, KdfParameters::aes(10));
    let mut bytes = Vec::new();
    db.save(&mut bytes, &mut NoProgress).unwrap();
    std::fs::write(&path, &bytes[..40]).unwrap();
    let err = Database::open_path(&path, &password(), &mut NoProgress).unwrap_err();
    assert!(matches!(
        err,
        Error::TruncatedData(_) | Error::InvalidHeader(_)
    ));
}

fn small_kdb_bytes() -> Vec<u8> {
    let mut db = Database::new_kdb(password());
    db.crypto.kdf = KdfParameters::aes(10);
    let mut bytes = Vec::new();
    db.save(&mut bytes, &mut NoProgress).unwrap();
    bytes
}

#[test]
fn test_truncated_kdb_file() {
    let bytes = small_kdb_bytes();
    let open = |data: &[u8]| Database::open(data, &password(), &mut NoProgress);
    assert!(open(&bytes).is_ok());

    // inside the fixed 124-byte header
    assert!(matches!(open(&bytes[..100]), Err(Error::TruncatedData(_))));

    // the encrypted body no longer decrypts to content matching its hash
    let cut = bytes.len() - 16;
    assert!(matches!(
        open(&bytes[..cut]),
        Err(Error::WrongKeyOrCorruptFile)
    ));
}

#[test]
fn test_kdb_counts_past_the_body() {
    // group count at offset 48, entry count at 52
    for (offset, count) in [(48, 3u32), (52, 1), (48, u32::MAX), (52, u32::MAX)] {
        let mut bytes = small_kdb_bytes();
        bytes[offset..offset + 4].copy_from_slice(&count.to_le_bytes());
        let result = Database::open(&bytes[..], &password(), &mut NoProgress);
        assert!(
            matches!(result, Err(Error::TruncatedData(_))),
            "count {} at offset {}",
            count,
            offset
        );
    }
}

#[test]
fn test_changed_credentials_apply_on_next_save() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rekey.kdbx");
    let mut db = kdbx(KdbxVersion::Kdbx40, DataCipher::Aes256, KdfParameters::aes(10));
    db.save_to_path(&path, &mut NoProgress).unwrap();

    db.set_credentials(Credentials::from_password("new password"));
    db.save_to_path(&path, &mut NoProgress).unwrap();
    assert!(Database::open_path(&path, &password(), &mut NoProgress).is_err());
    let reopened = Database::open_path(
        &path,
        &Credentials::from_password("new password"),
        &mut NoProgress,
    )
    .unwrap();
    assert_eq!(reopened.meta.name, "Round Trip");
}
