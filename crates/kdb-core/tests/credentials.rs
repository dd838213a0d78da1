//! Opening databases with passwords, key files, or both

use base64::Engine;
use kdb_core::{
    Credentials, Database, Error, ErrorKind, KdbxVersion, KdfParameters, KeyFileProblem,
    NoProgress,
};
use tempfile::tempdir;

const RAW_KEY: [u8; 32] = [
    0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc,
    0xfe, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
    0xee, 0xff,
];

fn save_with(credentials: Credentials, version: Option<KdbxVersion>) -> Vec<u8> {
    let mut db = match version {
        Some(version) => {
            let mut db = Database::new("Keys", credentials);
            db.set_kdbx_version(version).unwrap();
            db
        }
        None => Database::new_kdb(credentials),
    };
    db.crypto.kdf = KdfParameters::aes(10);
    let mut out = Vec::new();
    db.save(&mut out, &mut NoProgress).unwrap();
    out
}

fn open(data: &[u8], credentials: &Credentials) -> Result<Database, Error> {
    Database::open(data, credentials, &mut NoProgress)
}

fn key_file(content: &[u8]) -> Credentials {
    Credentials::new().with_key_file_bytes(content).unwrap()
}

#[test]
fn test_key_file_encodings_agree() {
    let hex = hex::encode(RAW_KEY);
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<KeyFile>\n\t<Meta><Version>1.00</Version></Meta>\n\t<Key><Data>{}</Data></Key>\n</KeyFile>\n",
        base64::engine::general_purpose::STANDARD.encode(RAW_KEY)
    );

    for version in [None, Some(KdbxVersion::Kdbx31), Some(KdbxVersion::Kdbx40)] {
        let data = save_with(key_file(&RAW_KEY), version);
        assert!(open(&data, &key_file(hex.as_bytes())).is_ok());
        assert!(open(&data, &key_file(xml.as_bytes())).is_ok());
        assert!(matches!(
            open(&data, &key_file(b"some other file")),
            Err(Error::WrongKeyOrCorruptFile)
        ));
    }
}

#[test]
fn test_arbitrary_file_is_hashed() {
    let content = b"any file at all, of any length, works as a key".repeat(10);
    let data = save_with(key_file(&content), Some(KdbxVersion::Kdbx40));
    assert!(open(&data, &key_file(&content)).is_ok());
}

#[test]
fn test_password_and_key_file_both_required() {
    let both = Credentials::from_password("pw")
        .with_key_file_bytes(&RAW_KEY)
        .unwrap();
    for version in [None, Some(KdbxVersion::Kdbx31)] {
        let data = save_with(both.clone(), version);
        assert!(open(&data, &both).is_ok());
        assert!(open(&data, &Credentials::from_password("pw")).is_err());
        assert!(open(&data, &key_file(&RAW_KEY)).is_err());
    }
}

#[test]
fn test_empty_key_file() {
    let err = Credentials::new().with_key_file_bytes(b"").unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidKeyFile(KeyFileProblem::KeyFileEmpty)
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidKeyFile);
}

#[test]
fn test_malformed_xml_key_data() {
    let xml = b"<KeyFile><Key><Data>not base64!</Data></Key></KeyFile>";
    assert!(matches!(
        Credentials::new().with_key_file_bytes(xml),
        Err(Error::InvalidKeyFile(KeyFileProblem::Malformed))
    ));
}

#[test]
fn test_no_credentials_is_empty_key() {
    let db = Database::new("Nothing", Credentials::new());
    let mut out = Vec::new();
    assert!(matches!(
        db.save(&mut out, &mut NoProgress),
        Err(Error::EmptyKey)
    ));
}

#[test]
fn test_kdb_password_outside_latin1() {
    let mut db = Database::new_kdb(Credentials::from_password("пароль"));
    db.crypto.kdf = KdfParameters::aes(10);
    let mut out = Vec::new();
    assert!(matches!(
        db.save(&mut out, &mut NoProgress),
        Err(Error::UnsupportedPasswordEncoding)
    ));

    // the same password is fine in KDBX, which uses UTF-8
    let data = save_with(
        Credentials::from_password("пароль"),
        Some(KdbxVersion::Kdbx31),
    );
    assert!(open(&data, &Credentials::from_password("пароль")).is_ok());
}

#[test]
fn test_latin1_password_in_kdb() {
    let creds = Credentials::from_password("grüße");
    let data = save_with(creds.clone(), None);
    assert!(open(&data, &creds).is_ok());
}

#[test]
fn test_key_file_read_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.key");
    std::fs::write(&path, RAW_KEY).unwrap();
    let file = std::fs::File::open(&path).unwrap();
    let creds = Credentials::new().with_key_file(file).unwrap();
    assert!(creds.has_key_file());
    assert!(!creds.has_password());

    let data = save_with(key_file(&RAW_KEY), Some(KdbxVersion::Kdbx31));
    assert!(open(&data, &creds).is_ok());
}
