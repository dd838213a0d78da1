//! KDBX 4 HMAC block stream: `[32] hmac, u32 size, data`, closed by an
//! empty block that is authenticated like any other

use crate::crypto::sha512;
use crate::error::{Error, Result};
use crate::format::ByteReader;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Block index whose key authenticates the outer header
pub const HEADER_INDEX: u64 = u64::MAX;

/// Per-block HMAC key: SHA-512(index LE ‖ hmacKey)
pub fn block_key(index: u64, hmac_key: &[u8; 64]) -> [u8; 64] {
    sha512(&[&index.to_le_bytes(), hmac_key])
}

fn mac(index: u64, hmac_key: &[u8; 64], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(&block_key(index, hmac_key))
        .map_err(|_| Error::InvalidHeader("HMAC init failed".to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// HMAC stored after the outer header
pub fn header_hmac(header: &[u8], hmac_key: &[u8; 64]) -> Result<[u8; 32]> {
    mac(HEADER_INDEX, hmac_key, &[header])
}

fn block_hmac(index: u64, hmac_key: &[u8; 64], data: &[u8]) -> Result<[u8; 32]> {
    mac(
        index,
        hmac_key,
        &[&index.to_le_bytes(), &(data.len() as u32).to_le_bytes(), data],
    )
}

pub fn read(data: &[u8], hmac_key: &[u8; 64]) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(data);
    let mut out = Vec::with_capacity(data.len());
    let mut index = 0u64;
    loop {
        let stored: [u8; 32] = r.array("block hmac").map_err(|_| Error::WrongKeyOrCorruptFile)?;
        let size = r.u32("block size").map_err(|_| Error::WrongKeyOrCorruptFile)? as usize;
        let block = r
            .take(size, "block data")
            .map_err(|_| Error::WrongKeyOrCorruptFile)?;
        if block_hmac(index, hmac_key, block)? != stored {
            return Err(Error::WrongKeyOrCorruptFile);
        }
        if size == 0 {
            return Ok(out);
        }
        out.extend_from_slice(block);
        index += 1;
    }
}

pub fn write(data: &[u8], hmac_key: &[u8; 64], block_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 36 * (data.len() / block_size.max(1) + 2));
    let mut index = 0u64;
    for block in data.chunks(block_size.max(1)) {
        out.extend_from_slice(&block_hmac(index, hmac_key, block)?);
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(block);
        index += 1;
    }
    out.extend_from_slice(&block_hmac(index, hmac_key, &[])?);
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}
