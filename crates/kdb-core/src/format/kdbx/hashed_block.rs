//! KDBX 3.1 hashed block stream: `u32 index, [32] sha256, u32 size, data`,
//! closed by an empty block with an all-zero hash

use crate::crypto::sha256;
use crate::error::{Error, Result};
use crate::format::ByteReader;

pub fn read(data: &[u8]) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(data);
    let mut out = Vec::with_capacity(data.len());
    let mut expected_index = 0u32;
    loop {
        let index = r.u32("block index").map_err(|_| Error::WrongKeyOrCorruptFile)?;
        let hash: [u8; 32] = r.array("block hash").map_err(|_| Error::WrongKeyOrCorruptFile)?;
        let size = r.u32("block size").map_err(|_| Error::WrongKeyOrCorruptFile)? as usize;
        if index != expected_index {
            return Err(Error::WrongKeyOrCorruptFile);
        }
        if size == 0 {
            if hash != [0u8; 32] {
                return Err(Error::WrongKeyOrCorruptFile);
            }
            return Ok(out);
        }
        let block = r
            .take(size, "block data")
            .map_err(|_| Error::WrongKeyOrCorruptFile)?;
        if sha256(&[block]) != hash {
            return Err(Error::WrongKeyOrCorruptFile);
        }
        out.extend_from_slice(block);
        expected_index = expected_index.wrapping_add(1);
    }
}

pub fn write(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 40 * (data.len() / block_size.max(1) + 2));
    let mut index = 0u32;
    for block in data.chunks(block_size.max(1)) {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&sha256(&[block]));
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(block);
        index = index.wrapping_add(1);
    }
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_payload_is_one_terminal_block() {
        let stream = write(&[], 16);
        assert_eq!(stream.len(), 40);
        assert!(read(&stream).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_block_is_detected() {
        let mut stream = write(b"hello hashed blocks", 8);
        stream[40] ^= 1;
        assert!(matches!(read(&stream), Err(Error::WrongKeyOrCorruptFile)));
    }

    #[test]
    fn test_missing_terminator() {
        let stream = write(b"payload", 1024);
        let cut = &stream[..stream.len() - 40];
        assert!(matches!(read(cut), Err(Error::WrongKeyOrCorruptFile)));
    }

    #[test]
    fn test_out_of_order_index() {
        let mut stream = write(b"abcdefgh", 4);
        // second block starts after 40 + 4 bytes
        stream[44] = 7;
        assert!(matches!(read(&stream), Err(Error::WrongKeyOrCorruptFile)));
    }

    proptest! {
        #[test]
        fn test_any_block_size(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            block_size in 1usize..512,
        ) {
            prop_assert_eq!(read(&write(&data, block_size)).unwrap(), data);
        }
    }
}
