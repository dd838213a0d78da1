//! The fixed 124-byte KDB v3 header

use crate::crypto::cipher::DataCipher;
use crate::crypto::sha256;
use crate::error::{Error, Result};
use crate::format::{ByteReader, KDB_SIGNATURE_2, SIGNATURE_1};
use byteorder::{LittleEndian, WriteBytesExt};

pub const HEADER_SIZE: usize = 124;

pub const FLAG_SHA2: u32 = 1;
pub const FLAG_RIJNDAEL: u32 = 2;
pub const FLAG_ARCFOUR: u32 = 4;
pub const FLAG_TWOFISH: u32 = 8;

pub const VERSION: u32 = 0x0003_0004;
const VERSION_MAJOR_MASK: u32 = 0xFFFF_0000;

const CONTENTS_HASH_OFFSET: usize = 56;
const CONTENTS_HASH_END: usize = CONTENTS_HASH_OFFSET + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdbHeader {
    pub flags: u32,
    pub version: u32,
    pub master_seed: [u8; 16],
    pub encryption_iv: [u8; 16],
    pub num_groups: u32,
    pub num_entries: u32,
    pub contents_hash: [u8; 32],
    pub transform_seed: [u8; 32],
    pub transform_rounds: u32,
}

impl KdbHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let sig1 = r.u32("header")?;
        let sig2 = r.u32("header")?;
        if sig1 != SIGNATURE_1 || sig2 != KDB_SIGNATURE_2 {
            return Err(Error::InvalidHeader(format!(
                "Not a KDB file: {:08x} {:08x}",
                sig1, sig2
            )));
        }
        if data.len() < HEADER_SIZE {
            return Err(Error::truncated("KDB header"));
        }

        let header = KdbHeader {
            flags: r.u32("flags")?,
            version: r.u32("version")?,
            master_seed: r.array("master seed")?,
            encryption_iv: r.array("encryption IV")?,
            num_groups: r.u32("group count")?,
            num_entries: r.u32("entry count")?,
            contents_hash: r.array("contents hash")?,
            transform_seed: r.array("transform seed")?,
            transform_rounds: r.u32("transform rounds")?,
        };
        if header.version & VERSION_MAJOR_MASK != VERSION & VERSION_MAJOR_MASK {
            return Err(Error::InvalidVersion(header.version));
        }
        Ok(header)
    }

    pub fn cipher(&self) -> Result<DataCipher> {
        if self.flags & FLAG_RIJNDAEL != 0 {
            Ok(DataCipher::Aes256)
        } else if self.flags & FLAG_TWOFISH != 0 {
            Ok(DataCipher::Twofish)
        } else if self.flags & FLAG_ARCFOUR != 0 {
            Err(Error::UnsupportedCipher("ArcFour".to_string()))
        } else {
            Err(Error::UnsupportedCipher(format!("flags {:#x}", self.flags)))
        }
    }

    pub fn flags_for(cipher: DataCipher) -> Result<u32> {
        match cipher {
            DataCipher::Aes256 => Ok(FLAG_SHA2 | FLAG_RIJNDAEL),
            DataCipher::Twofish => Ok(FLAG_SHA2 | FLAG_TWOFISH),
            DataCipher::ChaCha20 => Err(Error::UnsupportedCipher(
                "ChaCha20 cannot be used with KDB files".to_string(),
            )),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.write_u32::<LittleEndian>(SIGNATURE_1)?;
        out.write_u32::<LittleEndian>(KDB_SIGNATURE_2)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u32::<LittleEndian>(self.version)?;
        out.extend_from_slice(&self.master_seed);
        out.extend_from_slice(&self.encryption_iv);
        out.write_u32::<LittleEndian>(self.num_groups)?;
        out.write_u32::<LittleEndian>(self.num_entries)?;
        out.extend_from_slice(&self.contents_hash);
        out.extend_from_slice(&self.transform_seed);
        out.write_u32::<LittleEndian>(self.transform_rounds)?;
        Ok(out)
    }

    /// SHA-256 of the header without its contents hash, stored in the
    /// extension data of the body
    pub fn digest(&self) -> Result<[u8; 32]> {
        let bytes = self.to_bytes()?;
        Ok(sha256(&[
            &bytes[..CONTENTS_HASH_OFFSET],
            &bytes[CONTENTS_HASH_END..],
        ]))
    }
}
