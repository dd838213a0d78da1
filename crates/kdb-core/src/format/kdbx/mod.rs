//! KeePass 2.x `.kdbx` files, versions 3.1 and 4.0

mod dom;
mod hashed_block;
mod header;
mod hmac_block;
mod inner_header;
mod values;
mod variant;
mod xml_reader;
mod xml_writer;

use crate::binary_pool::BinaryPool;
use crate::crypto::stream::{InnerStream, InnerStreamAlgorithm};
use crate::crypto::{random_bytes, random_vec, sha256, sha512};
use crate::database::{Compression, CryptoSettings, Database, DatabaseFormat, KdbxVersion};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::format::{gunzip, gzip};
use crate::key::{Credentials, KeyFlavor};
use crate::progress::{ProgressListener, ProgressStatus};
use header::KdbxHeader;
use inner_header::InnerHeader;
use tracing::{debug, warn};
use xml_writer::WriteOptions;
use zeroize::Zeroizing;

/// Payload block size used on save
const BLOCK_SIZE: usize = 1024 * 1024;

const STREAM_START_BYTES_LEN: usize = 32;
const SALSA20_KEY_LEN: usize = 32;
const CHACHA20_KEY_LEN: usize = 64;
/// Appended to seed ‖ transformed key to derive the HMAC key
const HMAC_KEY_SUFFIX: u8 = 0x01;

struct Keys {
    master: Zeroizing<[u8; 32]>,
    hmac: Zeroizing<[u8; 64]>,
}

fn derive_keys(
    credentials: &Credentials,
    header: &KdbxHeader,
    progress: &mut dyn ProgressListener,
) -> Result<Keys> {
    let composite = credentials.composite_key(KeyFlavor::Kdbx)?;
    let total = header.kdf.rounds();
    progress.on_status(ProgressStatus::DerivingKey { done: 0, total });
    let transformed = Zeroizing::new(header.kdf.derive(&composite, &mut |done, total| {
        progress.on_status(ProgressStatus::DerivingKey { done, total })
    })?);
    Ok(Keys {
        master: Zeroizing::new(sha256(&[&header.master_seed, transformed.as_slice()])),
        hmac: Zeroizing::new(sha512(&[
            &header.master_seed,
            transformed.as_slice(),
            &[HMAC_KEY_SUFFIX],
        ])),
    })
}

/// Entries in the order the document lists them
fn entries_in_tree_order(db: &Database) -> Vec<&Entry> {
    db.groups_preorder()
        .into_iter()
        .flat_map(|group| db.entries_in_group(&group.uuid))
        .collect()
}

pub(crate) fn read(
    data: &[u8],
    credentials: Credentials,
    progress: &mut dyn ProgressListener,
) -> Result<Database> {
    progress.on_status(ProgressStatus::ReadingHeader);
    let (header, header_len) = KdbxHeader::parse(data)?;
    let header_bytes = &data[..header_len];
    let keys = derive_keys(&credentials, &header, progress)?;

    let document = match header.version {
        KdbxVersion::Kdbx31 => read_v3_body(data, header_len, &header, &keys, progress)?,
        KdbxVersion::Kdbx40 => read_v4_body(data, header_len, &header, &keys, progress)?,
    };

    if header.version == KdbxVersion::Kdbx31 {
        match &document.header_hash {
            Some(stored) if stored.as_slice() != sha256(&[header_bytes]).as_slice() => {
                return Err(Error::WrongKeyOrCorruptFile);
            }
            Some(_) => {}
            None => warn!("Document carries no header hash; header integrity is unchecked"),
        }
    }

    let crypto = CryptoSettings {
        cipher: header.cipher,
        compression: header.compression,
        kdf: header.kdf,
    };
    let format = DatabaseFormat::Kdbx(header.version);
    let mut db = Database::assemble(format, crypto, document.meta, credentials, document.tree)?;
    db.public_custom_data = header.public_custom_data;
    debug!("Decoded {} body", format.name());
    Ok(db)
}

fn read_v3_body(
    data: &[u8],
    header_len: usize,
    header: &KdbxHeader,
    keys: &Keys,
    progress: &mut dyn ProgressListener,
) -> Result<xml_reader::Document> {
    progress.on_status(ProgressStatus::Decrypting);
    let plain = Zeroizing::new(header.cipher.decrypt(
        &keys.master,
        &header.encryption_iv,
        &data[header_len..],
    )?);
    let start_len = header.stream_start_bytes.len();
    if plain.len() < start_len || plain[..start_len] != header.stream_start_bytes[..] {
        return Err(Error::WrongKeyOrCorruptFile);
    }
    let mut payload = Zeroizing::new(hashed_block::read(&plain[start_len..])?);
    if header.compression == Compression::Gzip {
        payload = Zeroizing::new(gunzip(&payload)?);
    }

    progress.on_status(ProgressStatus::Parsing);
    let algorithm = header
        .inner_stream
        .unwrap_or(InnerStreamAlgorithm::Salsa20);
    let mut stream = InnerStream::new(algorithm, &header.protected_stream_key)?;
    xml_reader::read_document(&payload, &mut stream, BinaryPool::new())
}

fn read_v4_body(
    data: &[u8],
    header_len: usize,
    header: &KdbxHeader,
    keys: &Keys,
    progress: &mut dyn ProgressListener,
) -> Result<xml_reader::Document> {
    let header_bytes = &data[..header_len];
    let mut r = crate::format::ByteReader::new(&data[header_len..]);
    let stored_hash: [u8; 32] = r.array("header hash")?;
    let stored_hmac: [u8; 32] = r.array("header HMAC")?;
    if sha256(&[header_bytes]) != stored_hash {
        return Err(Error::WrongKeyOrCorruptFile);
    }
    if hmac_block::header_hmac(header_bytes, &keys.hmac)? != stored_hmac {
        return Err(Error::WrongKeyOrCorruptFile);
    }

    let encrypted = hmac_block::read(&data[header_len + r.position()..], &keys.hmac)?;
    progress.on_status(ProgressStatus::Decrypting);
    let mut plain = Zeroizing::new(header.cipher.decrypt(
        &keys.master,
        &header.encryption_iv,
        &encrypted,
    )?);
    if header.compression == Compression::Gzip {
        plain = Zeroizing::new(gunzip(&plain)?);
    }

    progress.on_status(ProgressStatus::Parsing);
    let (inner, xml_start) = InnerHeader::parse(&plain)?;
    debug!("Inner header: {:?}, {} binaries", inner.stream, inner.binaries.len());
    let mut stream = InnerStream::new(inner.stream, &inner.stream_key)?;
    xml_reader::read_document(&plain[xml_start..], &mut stream, inner.binaries)
}

pub(crate) fn write(db: &Database, progress: &mut dyn ProgressListener) -> Result<Vec<u8>> {
    let DatabaseFormat::Kdbx(version) = db.format() else {
        return Err(Error::InvalidHeader(
            "A KDB database cannot be written as KDBX".to_string(),
        ));
    };
    progress.on_status(ProgressStatus::Serializing);

    let cipher = db.crypto.cipher;
    let mut kdf = db.crypto.kdf.clone();
    kdf.randomize();
    let (inner_stream, stream_key) = match version {
        KdbxVersion::Kdbx31 => (InnerStreamAlgorithm::Salsa20, random_vec(SALSA20_KEY_LEN)),
        KdbxVersion::Kdbx40 => (InnerStreamAlgorithm::ChaCha20, random_vec(CHACHA20_KEY_LEN)),
    };
    let stream_key = Zeroizing::new(stream_key);
    let header = KdbxHeader {
        version,
        cipher,
        compression: db.crypto.compression,
        master_seed: random_bytes(),
        encryption_iv: random_vec(cipher.iv_len()),
        kdf,
        protected_stream_key: match version {
            KdbxVersion::Kdbx31 => stream_key.to_vec(),
            KdbxVersion::Kdbx40 => Vec::new(),
        },
        stream_start_bytes: match version {
            KdbxVersion::Kdbx31 => random_vec(STREAM_START_BYTES_LEN),
            KdbxVersion::Kdbx40 => Vec::new(),
        },
        inner_stream: match version {
            KdbxVersion::Kdbx31 => Some(inner_stream),
            KdbxVersion::Kdbx40 => None,
        },
        public_custom_data: match version {
            KdbxVersion::Kdbx31 => None,
            KdbxVersion::Kdbx40 => db.public_custom_data.clone(),
        },
    };
    let header_bytes = header.to_bytes()?;
    let header_hash = sha256(&[&header_bytes]);

    let binaries = BinaryPool::collect(entries_in_tree_order(db));
    let mut stream = InnerStream::new(inner_stream, &stream_key)?;
    let xml = Zeroizing::new(xml_writer::write_document(
        db,
        &mut stream,
        WriteOptions {
            version,
            binaries: &binaries,
            header_hash: Some(header_hash),
            compress_binaries: db.crypto.compression == Compression::Gzip,
        },
    )?);

    let keys = derive_keys(db.credentials(), &header, progress)?;
    let mut out = header_bytes;
    match version {
        KdbxVersion::Kdbx31 => {
            let payload = compress(&xml, db.crypto.compression)?;
            let mut plain = Zeroizing::new(header.stream_start_bytes.clone());
            plain.extend_from_slice(&hashed_block::write(&payload, BLOCK_SIZE));
            progress.on_status(ProgressStatus::Encrypting);
            out.extend_from_slice(&cipher.encrypt(&keys.master, &header.encryption_iv, &plain)?);
        }
        KdbxVersion::Kdbx40 => {
            let inner = InnerHeader {
                stream: inner_stream,
                stream_key,
                binaries,
            };
            let mut plain = Zeroizing::new(Vec::with_capacity(xml.len() + 256));
            inner.write(&mut plain)?;
            plain.extend_from_slice(&xml);
            let payload = compress(&plain, db.crypto.compression)?;
            progress.on_status(ProgressStatus::Encrypting);
            let encrypted = cipher.encrypt(&keys.master, &header.encryption_iv, &payload)?;
            let header_hmac = hmac_block::header_hmac(&out, &keys.hmac)?;
            out.extend_from_slice(&header_hash);
            out.extend_from_slice(&header_hmac);
            out.extend_from_slice(&hmac_block::write(&encrypted, &keys.hmac, BLOCK_SIZE)?);
        }
    }

    progress.on_status(ProgressStatus::Writing);
    debug!("Encoded {} database: {} bytes", db.format().name(), out.len());
    Ok(out)
}

fn compress(data: &[u8], compression: Compression) -> Result<Zeroizing<Vec<u8>>> {
    Ok(Zeroizing::new(match compression {
        Compression::Gzip => gzip(data)?,
        Compression::None => data.to_vec(),
    }))
}
