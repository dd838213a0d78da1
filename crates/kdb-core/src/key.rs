//! Master key material: password, key file, and the composite key built from them

use crate::crypto::sha256;
use crate::error::{Error, KeyFileProblem, Result};
use base64::Engine;
use std::io::Read;
use xml::reader::{EventReader, XmlEvent};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Which byte encoding and combination rules apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlavor {
    /// KDB v3: ISO-8859-1 password, single-source keys used without rehashing
    Kdb,
    /// KDBX: UTF-8 password, always hashed once more
    Kdbx,
}

/// Secure wrapper for the master password
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct MasterPassword(String);

impl std::fmt::Debug for MasterPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterPassword(***)")
    }
}

/// Password and/or key-file material, kept for re-saving
#[derive(Clone, Default)]
pub struct Credentials {
    password: Option<MasterPassword>,
    file_key: Option<Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_file", &self.file_key.is_some())
            .finish()
    }
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_password(password: impl Into<String>) -> Self {
        Self::new().with_password(password)
    }

    /// An empty password counts as absent.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = if password.is_empty() {
            None
        } else {
            Some(MasterPassword(password))
        };
        self
    }

    /// Read and classify a key file
    pub fn with_key_file<R: Read>(mut self, mut reader: R) -> Result<Self> {
        let mut content = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut content)?;
        self.file_key = Some(Zeroizing::new(file_key(&content)?));
        Ok(self)
    }

    pub fn with_key_file_bytes(self, content: &[u8]) -> Result<Self> {
        self.with_key_file(content)
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn has_key_file(&self) -> bool {
        self.file_key.is_some()
    }

    /// The composite key, before the transform rounds
    pub fn composite_key(&self, flavor: KeyFlavor) -> Result<Zeroizing<[u8; 32]>> {
        let pw_key = match &self.password {
            Some(pw) => Some(Zeroizing::new(password_key(&pw.0, flavor)?)),
            None => None,
        };

        let key = match (pw_key, &self.file_key, flavor) {
            (None, None, _) => return Err(Error::EmptyKey),
            (Some(pw), None, KeyFlavor::Kdb) => *pw,
            (None, Some(file), KeyFlavor::Kdb) => **file,
            (Some(pw), None, KeyFlavor::Kdbx) => sha256(&[pw.as_slice()]),
            (None, Some(file), KeyFlavor::Kdbx) => sha256(&[file.as_slice()]),
            (Some(pw), Some(file), _) => sha256(&[pw.as_slice(), file.as_slice()]),
        };
        Ok(Zeroizing::new(key))
    }
}

fn password_key(password: &str, flavor: KeyFlavor) -> Result<[u8; 32]> {
    match flavor {
        KeyFlavor::Kdbx => Ok(sha256(&[password.as_bytes()])),
        KeyFlavor::Kdb => {
            let mut latin1 = Zeroizing::new(Vec::with_capacity(password.len()));
            for ch in password.chars() {
                let code = u32::from(ch);
                if code > 0xFF {
                    return Err(Error::UnsupportedPasswordEncoding);
                }
                latin1.push(code as u8);
            }
            Ok(sha256(&[latin1.as_slice()]))
        }
    }
}

/// Derive the 32-byte file key from the raw content of a key file
pub fn file_key(content: &[u8]) -> Result<[u8; 32]> {
    if content.is_empty() {
        return Err(Error::InvalidKeyFile(KeyFileProblem::KeyFileEmpty));
    }

    if let Some(key) = xml_key_file(content)? {
        return Ok(key);
    }

    if content.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(content);
        return Ok(key);
    }

    if content.len() == 64 {
        let mut key = [0u8; 32];
        if hex::decode_to_slice(content, &mut key).is_ok() {
            return Ok(key);
        }
    }

    Ok(sha256(&[content]))
}

/// `<KeyFile><Key><Data>base64</Data></Key></KeyFile>`, element names matched case-insensitively.
///
/// Returns `Ok(None)` when the content is not such a document.
fn xml_key_file(content: &[u8]) -> Result<Option<[u8; 32]>> {
    let trimmed = content
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|p| &content[p..])
        .unwrap_or_default();
    if !trimmed.starts_with(b"<") && !trimmed.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Ok(None);
    }

    let mut path: Vec<String> = Vec::new();
    let mut data: Option<String> = None;
    for event in EventReader::new(content) {
        let event = match event {
            Ok(event) => event,
            Err(_) => return Ok(None),
        };
        match event {
            XmlEvent::StartElement { name, .. } => {
                path.push(name.local_name.to_ascii_lowercase());
            }
            XmlEvent::EndElement { .. } => {
                path.pop();
            }
            XmlEvent::Characters(text) => {
                if path == ["keyfile", "key", "data"] {
                    data.get_or_insert_with(String::new).push_str(&text);
                }
            }
            _ => {}
        }
    }

    let Some(data) = data else {
        return Ok(None);
    };
    let decoded = Zeroizing::new(
        base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|_| Error::InvalidKeyFile(KeyFileProblem::Malformed))?,
    );
    let key: [u8; 32] = decoded
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidKeyFile(KeyFileProblem::Malformed))?;
    Ok(Some(key))
}
