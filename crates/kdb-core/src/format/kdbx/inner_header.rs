//! KDBX 4 inner header, between the decrypted payload start and the XML

use crate::binary_pool::BinaryPool;
use crate::crypto::stream::InnerStreamAlgorithm;
use crate::error::{Error, Result};
use crate::format::ByteReader;
use crate::protected::ProtectedBinary;
use byteorder::{LittleEndian, WriteBytesExt};
use zeroize::Zeroizing;

const INNER_HEADER_END: u8 = 0;
const INNER_HEADER_STREAM_ID: u8 = 1;
const INNER_HEADER_STREAM_KEY: u8 = 2;
const INNER_HEADER_BINARY: u8 = 3;

const BINARY_FLAG_PROTECTED: u8 = 0x01;

pub struct InnerHeader {
    pub stream: InnerStreamAlgorithm,
    pub stream_key: Zeroizing<Vec<u8>>,
    /// Attachments, numbered in order of appearance
    pub binaries: BinaryPool,
}

impl InnerHeader {
    /// Parse the inner header and return it with the offset of the XML
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(data);
        let mut stream = None;
        let mut stream_key = None;
        let mut binaries = BinaryPool::new();
        let mut next_id = 0u32;
        loop {
            let id = r.u8("inner header field id")?;
            let len = r.u32("inner header field length")? as usize;
            let value = r.take(len, "inner header field")?;
            match id {
                INNER_HEADER_END => break,
                INNER_HEADER_STREAM_ID => {
                    let raw: [u8; 4] = ByteReader::new(value).array("inner stream id")?;
                    stream = Some(InnerStreamAlgorithm::from_id(u32::from_le_bytes(raw))?);
                }
                INNER_HEADER_STREAM_KEY => stream_key = Some(Zeroizing::new(value.to_vec())),
                INNER_HEADER_BINARY => {
                    let (flags, content) = value
                        .split_first()
                        .ok_or_else(|| Error::truncated("inner header binary"))?;
                    let protect = flags & BINARY_FLAG_PROTECTED != 0;
                    binaries.insert(next_id, ProtectedBinary::new(content, protect));
                    next_id += 1;
                }
                other => {
                    return Err(Error::InvalidHeader(format!(
                        "Unknown inner header field id {}",
                        other
                    )))
                }
            }
        }
        let header = InnerHeader {
            stream: stream
                .ok_or_else(|| Error::InvalidHeader("Missing inner stream id".to_string()))?,
            stream_key: stream_key
                .ok_or_else(|| Error::InvalidHeader("Missing inner stream key".to_string()))?,
            binaries,
        };
        Ok((header, r.position()))
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        field(out, INNER_HEADER_STREAM_ID, &self.stream.id().to_le_bytes())?;
        field(out, INNER_HEADER_STREAM_KEY, &self.stream_key)?;
        for (_, binary) in self.binaries.iter() {
            let flags = if binary.is_protected() {
                BINARY_FLAG_PROTECTED
            } else {
                0
            };
            let content = binary.reveal();
            let mut value = Zeroizing::new(Vec::with_capacity(content.len() + 1));
            value.push(flags);
            value.extend_from_slice(&content);
            field(out, INNER_HEADER_BINARY, &value)?;
        }
        field(out, INNER_HEADER_END, &[])
    }
}

fn field(out: &mut Vec<u8>, id: u8, value: &[u8]) -> Result<()> {
    out.write_u8(id)?;
    out.write_u32::<LittleEndian>(value.len() as u32)?;
    out.extend_from_slice(value);
    Ok(())
}
