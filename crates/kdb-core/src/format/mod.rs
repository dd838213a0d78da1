//! On-disk formats: signature detection and the helpers both codecs share

pub(crate) mod kdb;
pub(crate) mod kdbx;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::key::Credentials;
use crate::progress::ProgressListener;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

pub const SIGNATURE_1: u32 = 0x9AA2_D903;
pub const KDB_SIGNATURE_2: u32 = 0xB54B_FB65;
pub const KDBX_SIGNATURE_2: u32 = 0xB54B_FB67;
/// Written by pre-release KeePass 2.x builds, otherwise identical to KDBX
pub const KDBX_PRERELEASE_SIGNATURE_2: u32 = 0xB54B_FB66;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Kdb,
    Kdbx,
}

/// Identify the file format from its first eight bytes
pub(crate) fn detect(data: &[u8]) -> Result<FileKind> {
    if data.len() < 8 {
        return Err(Error::truncated("file signature"));
    }
    let sig1 = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let sig2 = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    match (sig1, sig2) {
        (SIGNATURE_1, KDB_SIGNATURE_2) => Ok(FileKind::Kdb),
        (SIGNATURE_1, KDBX_SIGNATURE_2) | (SIGNATURE_1, KDBX_PRERELEASE_SIGNATURE_2) => {
            Ok(FileKind::Kdbx)
        }
        _ => Err(Error::InvalidHeader(format!(
            "Unknown signature {:08x} {:08x}",
            sig1, sig2
        ))),
    }
}

/// Decode a whole file
pub(crate) fn read(
    data: &[u8],
    credentials: Credentials,
    progress: &mut dyn ProgressListener,
) -> Result<Database> {
    match detect(data)? {
        FileKind::Kdb => kdb::read(data, credentials, progress),
        FileKind::Kdbx => kdbx::read(data, credentials, progress),
    }
}

/// Encode a whole file in the database's own format
pub(crate) fn write(db: &Database, progress: &mut dyn ProgressListener) -> Result<Vec<u8>> {
    if db.format().is_kdb() {
        kdb::write(db, progress)
    } else {
        kdbx::write(db, progress)
    }
}

pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|_| Error::WrongKeyOrCorruptFile)?;
    Ok(result)
}

/// Bounds-checked little-endian reads over a byte slice
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::truncated(what));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }
}
