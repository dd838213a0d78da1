//! VariantDictionary: the typed key/value map of KDBX 4 headers

use crate::error::{Error, Result};
use crate::format::ByteReader;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

const VERSION: u16 = 0x0100;
const VERSION_CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_UINT32: u8 = 0x04;
const TYPE_UINT64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_INT32: u8 = 0x0C;
const TYPE_INT64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl Variant {
    fn type_id(&self) -> u8 {
        match self {
            Variant::UInt32(_) => TYPE_UINT32,
            Variant::UInt64(_) => TYPE_UINT64,
            Variant::Bool(_) => TYPE_BOOL,
            Variant::Int32(_) => TYPE_INT32,
            Variant::Int64(_) => TYPE_INT64,
            Variant::String(_) => TYPE_STRING,
            Variant::Bytes(_) => TYPE_BYTES,
        }
    }

    fn decode(type_id: u8, key: &str, value: &[u8]) -> Result<Self> {
        let fixed = |len: usize| -> Result<()> {
            if value.len() == len {
                Ok(())
            } else {
                Err(Error::InvalidHeader(format!(
                    "Variant '{}' should hold {} bytes, not {}",
                    key,
                    len,
                    value.len()
                )))
            }
        };
        Ok(match type_id {
            TYPE_UINT32 => {
                fixed(4)?;
                Variant::UInt32(LittleEndian::read_u32(value))
            }
            TYPE_UINT64 => {
                fixed(8)?;
                Variant::UInt64(LittleEndian::read_u64(value))
            }
            TYPE_BOOL => {
                fixed(1)?;
                Variant::Bool(value[0] != 0)
            }
            TYPE_INT32 => {
                fixed(4)?;
                Variant::Int32(LittleEndian::read_i32(value))
            }
            TYPE_INT64 => {
                fixed(8)?;
                Variant::Int64(LittleEndian::read_i64(value))
            }
            TYPE_STRING => Variant::String(String::from_utf8_lossy(value).into_owned()),
            TYPE_BYTES => Variant::Bytes(value.to_vec()),
            other => {
                return Err(Error::InvalidHeader(format!(
                    "Unknown variant type {:#04x} for '{}'",
                    other, key
                )))
            }
        })
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Variant::UInt32(v) => v.to_le_bytes().to_vec(),
            Variant::UInt64(v) => v.to_le_bytes().to_vec(),
            Variant::Bool(v) => vec![u8::from(*v)],
            Variant::Int32(v) => v.to_le_bytes().to_vec(),
            Variant::Int64(v) => v.to_le_bytes().to_vec(),
            Variant::String(v) => v.as_bytes().to_vec(),
            Variant::Bytes(v) => v.clone(),
        }
    }
}

/// Insertion-ordered map of variants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDictionary {
    items: Vec<(String, Variant)>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let version = r.u16("variant dictionary version")?;
        if version & VERSION_CRITICAL_MASK > VERSION & VERSION_CRITICAL_MASK {
            return Err(Error::InvalidHeader(format!(
                "Unsupported variant dictionary version {:#06x}",
                version
            )));
        }

        let mut dict = Self::new();
        loop {
            let type_id = r.u8("variant type")?;
            if type_id == TYPE_END {
                break;
            }
            let key_len = r.u32("variant key length")? as usize;
            let key = String::from_utf8_lossy(r.take(key_len, "variant key")?).into_owned();
            let value_len = r.u32("variant value length")? as usize;
            let value = r.take(value_len, "variant value")?;
            let variant = Variant::decode(type_id, &key, value)?;
            dict.set(key, variant);
        }
        Ok(dict)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u16::<LittleEndian>(VERSION)?;
        for (key, value) in &self.items {
            let encoded = value.encode();
            out.write_u8(value.type_id())?;
            out.write_u32::<LittleEndian>(key.len() as u32)?;
            out.extend_from_slice(key.as_bytes());
            out.write_u32::<LittleEndian>(encoded.len() as u32)?;
            out.extend_from_slice(&encoded);
        }
        out.write_u8(TYPE_END)?;
        Ok(out)
    }

    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace, keeping the position of an existing key
    pub fn set(&mut self, key: impl Into<String>, value: Variant) {
        let key = key.into();
        match self.items.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.items.push((key, value)),
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            Variant::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Variant::UInt64(v) => Some(*v),
            Variant::UInt32(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key)? {
            Variant::Bytes(v) => Some(v),
            _ => None,
        }
    }
}
